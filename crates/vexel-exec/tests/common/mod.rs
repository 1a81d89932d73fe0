//! A headless device wrapped with switches for fault and timing injection.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use crossbeam_channel::{Receiver, Sender};
use vexel_core::{ExecError, ExecResult, QueueFamily};
use vexel_exec::{DeviceBackend, HeadlessBackend};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HookedBackend {
    inner: Arc<HeadlessBackend>,
    pause_next_wait: AtomicBool,
    lost: AtomicBool,
    fail_waits: AtomicBool,
    entered: (Sender<()>, Receiver<()>),
    waited: (Sender<()>, Receiver<()>),
    resume: (Sender<()>, Receiver<()>),
}

impl HookedBackend {
    pub fn new(inner: Arc<HeadlessBackend>) -> Self {
        Self {
            inner,
            pause_next_wait: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            fail_waits: AtomicBool::new(false),
            entered: crossbeam_channel::unbounded(),
            waited: crossbeam_channel::unbounded(),
            resume: crossbeam_channel::unbounded(),
        }
    }

    /// The next `wait_for_fences` announces itself, waits on the device,
    /// announces completion and then holds until [`resume`](Self::resume).
    pub fn pause_next_wait(&self) {
        self.pause_next_wait.store(true, Ordering::SeqCst);
    }

    pub fn await_entered(&self) {
        self.entered
            .1
            .recv_timeout(STEP_TIMEOUT)
            .expect("paused wait never started");
    }

    pub fn await_waited(&self) {
        self.waited
            .1
            .recv_timeout(STEP_TIMEOUT)
            .expect("paused wait never returned from the device");
    }

    pub fn resume(&self) {
        self.resume.0.send(()).expect("resume");
    }

    /// Fence queries and waits report `DeviceLost` from now on.
    pub fn lose_device(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    /// Fence waits fail with an out-of-host-memory error from now on.
    pub fn fail_waits(&self) {
        self.fail_waits.store(true, Ordering::SeqCst);
    }
}

impl DeviceBackend for HookedBackend {
    fn queue_families(&self) -> &[QueueFamily] {
        self.inner.queue_families()
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        self.inner.queue(family, index)
    }

    fn max_frames_in_flight(&self) -> u32 {
        self.inner.max_frames_in_flight()
    }

    fn create_command_pool(&self, family: u32) -> ExecResult<vk::CommandPool> {
        self.inner.create_command_pool(family)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.inner.destroy_command_pool(pool)
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> ExecResult<vk::CommandBuffer> {
        self.inner.allocate_command_buffer(pool)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        self.inner.free_command_buffer(pool, buffer)
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        one_time_submit: bool,
    ) -> ExecResult<()> {
        self.inner.begin_command_buffer(buffer, one_time_submit)
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> ExecResult<()> {
        self.inner.end_command_buffer(buffer)
    }

    fn reset_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        release_resources: bool,
    ) -> ExecResult<()> {
        self.inner.reset_command_buffer(buffer, release_resources)
    }

    fn create_fence(&self) -> ExecResult<vk::Fence> {
        self.inner.create_fence()
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.inner.destroy_fence(fence)
    }

    fn reset_fence(&self, fence: vk::Fence) -> ExecResult<()> {
        self.inner.reset_fence(fence)
    }

    fn fence_signaled(&self, fence: vk::Fence) -> ExecResult<bool> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(ExecError::DeviceLost);
        }
        self.inner.fence_signaled(fence)
    }

    fn wait_for_fences(&self, fences: &[vk::Fence]) -> ExecResult<()> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(ExecError::DeviceLost);
        }
        if self.fail_waits.load(Ordering::SeqCst) {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY.into());
        }
        if !self.pause_next_wait.swap(false, Ordering::SeqCst) {
            return self.inner.wait_for_fences(fences);
        }
        let _ = self.entered.0.send(());
        let result = self.inner.wait_for_fences(fences);
        let _ = self.waited.0.send(());
        let _ = self.resume.1.recv_timeout(STEP_TIMEOUT);
        result
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> ExecResult<()> {
        self.inner.queue_submit(queue, buffer, fence)
    }
}
