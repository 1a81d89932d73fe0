use std::thread::ThreadId;

use ash::vk;

use crate::capability::CapabilitySet;

/// Errors reported by the command-execution subsystem.
///
/// Everything except `Vulkan`, `DeviceLost` and `Io` is recoverable: the
/// operation was rejected and nothing changed.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("{operation}() rejected: command buffer is {actual}, expected {expected}")]
    InvalidStateTransition {
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid queue family index {index} (device has {family_count} families)")]
    InvalidFamilyIndex { index: u32, family_count: u32 },

    #[error("invalid queue index {index} in family {family} (family has {queue_count} queues)")]
    InvalidQueueIndex {
        family: u32,
        index: u32,
        queue_count: u32,
    },

    #[error("no queue family satisfies {required}")]
    NoCompatibleFamily { required: CapabilitySet },

    #[error("queue {family}:{index} is already owned by thread {owner:?}")]
    SlotOwnedByOtherThread {
        family: u32,
        index: u32,
        owner: ThreadId,
    },

    #[error("thread already holds queue {family}:{held}, cannot also claim {family}:{requested}")]
    ThreadHoldsOtherSlot {
        family: u32,
        requested: u32,
        held: u32,
    },

    #[error("operation requires a valid queue lease")]
    InvalidLease,

    #[error("command buffer of family {buffer} cannot be submitted to a queue of family {queue}")]
    FamilyMismatch { buffer: u32, queue: u32 },

    #[error("command buffer {index} (generation {generation}) is no longer checked out")]
    StaleCommandBuffer { index: u32, generation: u32 },

    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("device lost")]
    DeviceLost,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Fatal errors come from the driver or the allocator; callers cannot
    /// resynchronize and should abort the frame or startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::Vulkan(_) | ExecError::DeviceLost)
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
