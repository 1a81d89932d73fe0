use ash::vk;

use crate::capability::CapabilitySet;

/// Immutable description of one hardware queue family, captured at device
/// discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    pub index: u32,
    pub queue_count: u32,
    pub capabilities: CapabilitySet,
    /// Valid bits in timestamps written by queues of this family (0 = unsupported)
    pub timestamp_valid_bits: u32,
    /// Minimum granularity for image transfer operations
    pub min_image_transfer_granularity: vk::Extent3D,
}

impl QueueFamily {
    pub fn new(index: u32, queue_count: u32, capabilities: CapabilitySet) -> Self {
        Self {
            index,
            queue_count,
            capabilities,
            timestamp_valid_bits: 64,
            min_image_transfer_granularity: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
        }
    }

    pub fn from_vk(index: u32, props: &vk::QueueFamilyProperties) -> Self {
        Self {
            index,
            queue_count: props.queue_count,
            capabilities: CapabilitySet::from_vk(props.queue_flags),
            timestamp_valid_bits: props.timestamp_valid_bits,
            min_image_transfer_granularity: props.min_image_transfer_granularity,
        }
    }

    /// Tag (or untag) the family as able to present to the window surface.
    pub fn with_present(mut self, present: bool) -> Self {
        self.capabilities.set(CapabilitySet::PRESENT, present);
        self
    }

    pub fn supports(&self, required: CapabilitySet) -> bool {
        self.capabilities.satisfies(required)
    }
}
