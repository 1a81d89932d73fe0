//! Command execution and resource lifetime for a Vulkan-style device.
//!
//! Threads lease hardware queues from a [`QueueLeaseManager`], record into
//! command buffers recycled by a per-thread [`CommandBufferPool`], and defer
//! destruction of GPU-visible resources through a [`ReclamationBin`] until
//! every [`RunToken`] that touched them reports finished.

pub mod backend;
pub mod command;
pub mod context;
pub mod headless;
pub mod pool;
pub mod queue;
pub mod reclaim;
pub mod run;
pub mod vulkan;

pub use backend::DeviceBackend;
pub use command::{CommandBuffer, CommandBufferStatus};
pub use context::DeviceContext;
pub use headless::{CompletionMode, HeadlessBackend};
pub use pool::{CommandBufferId, CommandBufferPool};
pub use queue::{QueueLease, QueueLeaseManager};
pub use reclaim::ReclamationBin;
pub use run::{RunSet, RunToken};
pub use vulkan::VulkanBackend;

pub use vexel_core::{CapabilitySet, ExecError, ExecResult, QueueFamily};
