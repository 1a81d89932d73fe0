//! Software device used by tests and the stress tool.
//!
//! Handles are opaque counters; nothing reaches a GPU. Fences complete either
//! as soon as they are submitted or when the owner of the backend completes
//! them explicitly, which lets tests hold work "in flight" for as long as
//! they need.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use vexel_core::{CapabilitySet, ExecResult, QueueFamily};

use crate::backend::DeviceBackend;

/// When submitted work completes on the headless device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Fences are signaled inside `queue_submit`
    Immediate,
    /// Fences stay unsignaled until `complete_*` is called
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
}

struct HeadlessCommandBuffer {
    pool: u64,
    state: RecordState,
}

pub struct HeadlessBackend {
    families: Vec<QueueFamily>,
    max_frames_in_flight: u32,
    manual: AtomicBool,
    next_handle: AtomicU64,

    // ── Object tables ───────────────────────────────────────
    command_pools: DashMap<u64, u32>,
    command_buffers: DashMap<u64, HeadlessCommandBuffer>,
    /// fence -> signaled
    fences: DashMap<u64, bool>,

    /// Submitted, not yet completed fences in submission order
    pending: Mutex<VecDeque<u64>>,
    /// Guards fence signaling so waiters never miss a notification
    signal_lock: Mutex<()>,
    signaled: Condvar,

    submissions: AtomicU64,
    fail_next_allocation: AtomicBool,
}

impl HeadlessBackend {
    pub fn new(families: Vec<QueueFamily>, mode: CompletionMode) -> Self {
        Self {
            families,
            max_frames_in_flight: 2,
            manual: AtomicBool::new(mode == CompletionMode::Manual),
            next_handle: AtomicU64::new(0x1000),
            command_pools: DashMap::new(),
            command_buffers: DashMap::new(),
            fences: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            signal_lock: Mutex::new(()),
            signaled: Condvar::new(),
            submissions: AtomicU64::new(0),
            fail_next_allocation: AtomicBool::new(false),
        }
    }

    /// Four families shaped like a common discrete GPU: one universal queue,
    /// two async compute queues, two transfer queues and one video decoder.
    pub fn discrete(mode: CompletionMode) -> Self {
        Self::new(
            vec![
                QueueFamily::new(
                    0,
                    1,
                    CapabilitySet::GRAPHICS | CapabilitySet::COMPUTE | CapabilitySet::TRANSFER,
                )
                .with_present(true),
                QueueFamily::new(1, 2, CapabilitySet::COMPUTE | CapabilitySet::TRANSFER),
                QueueFamily::new(2, 2, CapabilitySet::TRANSFER),
                QueueFamily::new(3, 1, CapabilitySet::VIDEO_DECODE),
            ],
            mode,
        )
    }

    pub fn with_max_frames_in_flight(mut self, frames: u32) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.manual
            .store(mode == CompletionMode::Manual, Ordering::SeqCst);
        if mode == CompletionMode::Immediate {
            self.complete_all();
        }
    }

    /// Make the next command buffer or fence allocation fail with
    /// `ERROR_OUT_OF_DEVICE_MEMORY`.
    pub fn fail_next_allocation(&self) {
        self.fail_next_allocation.store(true, Ordering::SeqCst);
    }

    // ── Completion control ──────────────────────────────────

    /// Complete the oldest outstanding submission. Returns false when nothing
    /// is in flight.
    pub fn complete_next(&self) -> bool {
        let next = self.pending.lock().pop_front();
        match next {
            Some(raw) => {
                self.signal(raw);
                true
            }
            None => false,
        }
    }

    /// Complete every outstanding submission.
    pub fn complete_all(&self) -> usize {
        let drained: Vec<u64> = self.pending.lock().drain(..).collect();
        for raw in &drained {
            self.signal(*raw);
        }
        drained.len()
    }

    /// Complete one specific submission, identified by its fence.
    pub fn complete_fence(&self, fence: vk::Fence) -> bool {
        let raw = fence.as_raw();
        let removed = {
            let mut pending = self.pending.lock();
            let before = pending.len();
            pending.retain(|f| *f != raw);
            pending.len() != before
        };
        if removed {
            self.signal(raw);
        }
        removed
    }

    fn signal(&self, raw: u64) {
        let _guard = self.signal_lock.lock();
        if let Some(mut signaled) = self.fences.get_mut(&raw) {
            *signaled = true;
        }
        self.signaled.notify_all();
        trace!("headless fence {:#x} signaled", raw);
    }

    // ── Counters ────────────────────────────────────────────

    pub fn pending_submissions(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn live_command_buffers(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn live_command_pools(&self) -> usize {
        self.command_pools.len()
    }

    pub fn live_fences(&self) -> usize {
        self.fences.len()
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_allocation(&self) -> ExecResult<()> {
        if self.fail_next_allocation.swap(false, Ordering::SeqCst) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
        }
        Ok(())
    }

    fn queue_raw(family: u32, index: u32) -> u64 {
        (((family as u64) << 32) | index as u64) + 1
    }

    fn valid_queue(&self, queue: vk::Queue) -> bool {
        let raw = queue.as_raw();
        if raw == 0 {
            return false;
        }
        let family = ((raw - 1) >> 32) as usize;
        let index = ((raw - 1) & 0xffff_ffff) as u32;
        self.families
            .get(family)
            .map(|f| index < f.queue_count)
            .unwrap_or(false)
    }
}

impl DeviceBackend for HeadlessBackend {
    fn queue_families(&self) -> &[QueueFamily] {
        &self.families
    }

    fn queue(&self, family: u32, index: u32) -> vk::Queue {
        vk::Queue::from_raw(Self::queue_raw(family, index))
    }

    fn max_frames_in_flight(&self) -> u32 {
        self.max_frames_in_flight
    }

    fn create_command_pool(&self, family: u32) -> ExecResult<vk::CommandPool> {
        if family as usize >= self.families.len() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED.into());
        }
        let raw = self.alloc_handle();
        self.command_pools.insert(raw, family);
        debug!("headless command pool {:#x} for family {}", raw, family);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let raw = pool.as_raw();
        // Destroying a pool frees every buffer allocated from it.
        self.command_buffers.retain(|_, cb| cb.pool != raw);
        self.command_pools.remove(&raw);
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> ExecResult<vk::CommandBuffer> {
        self.check_allocation()?;
        if !self.command_pools.contains_key(&pool.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN.into());
        }
        let raw = self.alloc_handle();
        self.command_buffers.insert(
            raw,
            HeadlessCommandBuffer {
                pool: pool.as_raw(),
                state: RecordState::Initial,
            },
        );
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        self.command_buffers.remove(&buffer.as_raw());
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        _one_time_submit: bool,
    ) -> ExecResult<()> {
        let mut cb = self
            .command_buffers
            .get_mut(&buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if cb.state == RecordState::Recording {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT.into());
        }
        cb.state = RecordState::Recording;
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> ExecResult<()> {
        let mut cb = self
            .command_buffers
            .get_mut(&buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if cb.state != RecordState::Recording {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT.into());
        }
        cb.state = RecordState::Executable;
        Ok(())
    }

    fn reset_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        _release_resources: bool,
    ) -> ExecResult<()> {
        let mut cb = self
            .command_buffers
            .get_mut(&buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        cb.state = RecordState::Initial;
        Ok(())
    }

    fn create_fence(&self) -> ExecResult<vk::Fence> {
        self.check_allocation()?;
        let raw = self.alloc_handle();
        self.fences.insert(raw, false);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let raw = fence.as_raw();
        self.pending.lock().retain(|f| *f != raw);
        self.fences.remove(&raw);
    }

    fn reset_fence(&self, fence: vk::Fence) -> ExecResult<()> {
        let mut signaled = self
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *signaled = false;
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> ExecResult<bool> {
        self.fences
            .get(&fence.as_raw())
            .map(|signaled| *signaled)
            .ok_or_else(|| vk::Result::ERROR_UNKNOWN.into())
    }

    fn wait_for_fences(&self, fences: &[vk::Fence]) -> ExecResult<()> {
        let mut guard = self.signal_lock.lock();
        loop {
            let mut all_signaled = true;
            for fence in fences {
                match self.fences.get(&fence.as_raw()) {
                    Some(signaled) if *signaled => {}
                    Some(_) => all_signaled = false,
                    None => return Err(vk::Result::ERROR_UNKNOWN.into()),
                }
            }
            if all_signaled {
                return Ok(());
            }
            self.signaled.wait(&mut guard);
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> ExecResult<()> {
        if !self.valid_queue(queue) {
            return Err(vk::Result::ERROR_UNKNOWN.into());
        }
        match self.command_buffers.get(&buffer.as_raw()) {
            Some(cb) if cb.state == RecordState::Executable => {}
            Some(_) => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT.into()),
            None => return Err(vk::Result::ERROR_UNKNOWN.into()),
        }
        match self.fences.get(&fence.as_raw()) {
            Some(signaled) if !*signaled => {}
            Some(_) => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT.into()),
            None => return Err(vk::Result::ERROR_UNKNOWN.into()),
        }

        self.submissions.fetch_add(1, Ordering::SeqCst);
        if self.manual.load(Ordering::SeqCst) {
            self.pending.lock().push_back(fence.as_raw());
        } else {
            self.signal(fence.as_raw());
        }
        Ok(())
    }
}
