use ash::vk;

bitflags::bitflags! {
    /// Capabilities of a hardware queue family.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapabilitySet: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const SPARSE_BINDING = 1 << 3;
        const PROTECTED = 1 << 4;
        const VIDEO_DECODE = 1 << 5;
        const VIDEO_ENCODE = 1 << 6;
        /// Not reported by Vulkan queue flags; set after a surface support query.
        const PRESENT = 1 << 7;
    }
}

impl CapabilitySet {
    /// Translate Vulkan queue flags. Graphics and compute families can always
    /// execute transfer commands even when the driver omits the bit.
    pub fn from_vk(flags: vk::QueueFlags) -> Self {
        let mut caps = Self::empty();
        if flags.contains(vk::QueueFlags::GRAPHICS) {
            caps |= Self::GRAPHICS | Self::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::COMPUTE) {
            caps |= Self::COMPUTE | Self::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::TRANSFER) {
            caps |= Self::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::SPARSE_BINDING) {
            caps |= Self::SPARSE_BINDING;
        }
        if flags.contains(vk::QueueFlags::PROTECTED) {
            caps |= Self::PROTECTED;
        }
        if flags.contains(vk::QueueFlags::VIDEO_DECODE_KHR) {
            caps |= Self::VIDEO_DECODE;
        }
        if flags.contains(vk::QueueFlags::VIDEO_ENCODE_KHR) {
            caps |= Self::VIDEO_ENCODE;
        }
        caps
    }

    /// A family is compatible with a request when it offers every required bit.
    /// An empty requirement is satisfied by any family.
    pub fn satisfies(self, required: CapabilitySet) -> bool {
        self.contains(required)
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "{}", names.join("|"))
    }
}
