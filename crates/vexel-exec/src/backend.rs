use ash::vk;

use vexel_core::{ExecResult, QueueFamily};

/// The native device as seen by the execution subsystem.
///
/// Handles are plain `ash::vk` handles. Implementations must be callable
/// from any thread; Vulkan's external synchronization rules (one thread per
/// queue, per command pool) are upheld by the callers: queues through
/// [`QueueLease`](crate::QueueLease), command pools through the
/// single-owner [`CommandBufferPool`](crate::CommandBufferPool).
pub trait DeviceBackend: Send + Sync {
    /// Queue families discovered at device creation, indexed by family index.
    fn queue_families(&self) -> &[QueueFamily];

    /// Native handle of queue `index` in `family`. Callers validate indices.
    fn queue(&self, family: u32, index: u32) -> vk::Queue;

    /// Frames the renderer may buffer ahead of the GPU.
    fn max_frames_in_flight(&self) -> u32;

    fn create_command_pool(&self, family: u32) -> ExecResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> ExecResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        one_time_submit: bool,
    ) -> ExecResult<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> ExecResult<()>;
    fn reset_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        release_resources: bool,
    ) -> ExecResult<()>;

    /// Create an unsignaled fence.
    fn create_fence(&self) -> ExecResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> ExecResult<()>;
    /// Non-blocking status poll.
    fn fence_signaled(&self, fence: vk::Fence) -> ExecResult<bool>;
    /// Block until every fence is signaled. No timeout.
    fn wait_for_fences(&self, fences: &[vk::Fence]) -> ExecResult<()>;

    /// Submit one command buffer; `fence` is signaled when it completes.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> ExecResult<()>;
}
