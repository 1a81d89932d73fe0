//! Command buffers with an explicit recording/submission state machine and
//! fence-based completion tracking.
//!
//! ```text
//! READY --begin--> RECORDING --end--> RECORDED --submit--> RECORDED (+1 fence)
//!   ^                                     |
//!   +--------------- reset (waits) -------+
//! ```

use std::fmt;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use vexel_core::{ExecError, ExecResult, Slab, SlotState};

use crate::backend::DeviceBackend;
use crate::queue::QueueLease;
use crate::run::RunToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferStatus {
    Ready,
    Recording,
    Recorded,
}

impl CommandBufferStatus {
    pub fn name(self) -> &'static str {
        match self {
            CommandBufferStatus::Ready => "READY",
            CommandBufferStatus::Recording => "RECORDING",
            CommandBufferStatus::Recorded => "RECORDED",
        }
    }
}

impl fmt::Display for CommandBufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fence and the submission it currently guards.
#[derive(Debug, Clone, Copy)]
struct SubmitFence {
    fence: vk::Fence,
    serial: u64,
}

struct TrackerState {
    status: CommandBufferStatus,
    /// Advances on every reset; run tokens remember the run they were taken in
    run: u64,
    /// Submissions made since the last reset
    submissions: u32,
    /// Submissions over the buffer's lifetime; tags each fence slot so a
    /// recycled fence is told apart from the submission it guarded before
    serial: u64,
    one_time_submit: bool,
    /// Set once the device reported loss; nothing outstanding will complete
    lost: bool,
    /// Active slots are fences of unconfirmed submissions, free slots are
    /// signaled fences waiting for reuse
    fences: Slab<SubmitFence>,
}

impl TrackerState {
    fn mark_lost(&mut self, err: &ExecError) {
        if !self.lost {
            error!(
                "abandoning {} outstanding submission(s): {}",
                self.fences.active_count(),
                err
            );
        }
        self.lost = true;
        self.fences.release_all();
    }
}

/// Completion state shared between a command buffer and its run tokens.
pub(crate) struct Tracker {
    backend: Arc<dyn DeviceBackend>,
    state: Mutex<TrackerState>,
}

impl Tracker {
    /// Poll outstanding fences, recycling every signaled one. A fatal status
    /// error latches the tracker as lost and abandons every submission.
    fn poll(&self, state: &mut TrackerState) -> bool {
        if state.status == CommandBufferStatus::Recording {
            return true;
        }
        if state.lost {
            return false;
        }
        let backend = &self.backend;
        let mut fatal = None;
        state
            .fences
            .release_where(|slot| match backend.fence_signaled(slot.fence) {
                Ok(signaled) => signaled,
                Err(e) if e.is_fatal() => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                    false
                }
                Err(e) => {
                    warn!("fence status query failed: {}", e);
                    false
                }
            });
        if let Some(err) = fatal {
            state.mark_lost(&err);
            return false;
        }
        state.fences.active_count() > 0
    }

    pub(crate) fn is_being_used(&self) -> bool {
        let mut state = self.state.lock();
        self.poll(&mut state)
    }

    /// True once the buffer has moved past `run`, or is no longer in use.
    /// Ended but not yet submitted work is still pending: the submit may
    /// come later and reference everything recorded.
    pub(crate) fn run_finished(&self, run: u64) -> bool {
        let mut state = self.state.lock();
        if state.run > run || state.lost {
            return true;
        }
        if state.status == CommandBufferStatus::Recorded && state.submissions == 0 {
            return false;
        }
        !self.poll(&mut state)
    }

    pub(crate) fn current_run(&self) -> u64 {
        self.state.lock().run
    }

    /// Block until every outstanding fence signals, then recycle them. The
    /// lock is not held while blocking so pollers stay responsive.
    ///
    /// The owner may recycle and resubmit a fence while the lock is dropped;
    /// only slots still tagged with the serial seen before blocking are
    /// released afterwards.
    pub(crate) fn wait(&self) -> ExecResult<()> {
        let outstanding: Vec<(usize, SubmitFence)> = self
            .state
            .lock()
            .fences
            .active_indexed()
            .map(|(index, slot)| (index, *slot))
            .collect();
        if outstanding.is_empty() {
            return Ok(());
        }
        let fences: Vec<vk::Fence> = outstanding.iter().map(|(_, slot)| slot.fence).collect();
        let result = self.backend.wait_for_fences(&fences);

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                for (index, seen) in outstanding {
                    let same_submission = state.fences.state(index) == Some(SlotState::Active)
                        && state.fences.get(index).map(|slot| slot.serial) == Some(seen.serial);
                    if same_submission {
                        state.fences.release(index);
                    }
                }
                Ok(())
            }
            Err(ExecError::DeviceLost) => {
                state.mark_lost(&ExecError::DeviceLost);
                Err(ExecError::DeviceLost)
            }
            Err(e) => Err(e),
        }
    }
}

/// A recordable, submittable unit of GPU work.
///
/// A command buffer is checked out to one thread at a time; only its run
/// tokens are shared.
pub struct CommandBuffer {
    tracker: Arc<Tracker>,
    raw: vk::CommandBuffer,
    /// Null for external buffers
    pool: vk::CommandPool,
    family: u32,
    /// Wraps a handle owned by the caller; never freed here
    external: bool,
}

impl CommandBuffer {
    /// Allocate a primary command buffer from `pool`, which serves `family`.
    pub fn allocate(
        backend: Arc<dyn DeviceBackend>,
        pool: vk::CommandPool,
        family: u32,
    ) -> ExecResult<Self> {
        let raw = backend.allocate_command_buffer(pool)?;
        Ok(Self::wrap(backend, raw, pool, family, false))
    }

    /// Track a command buffer the caller allocated and will free itself.
    pub fn from_external(
        backend: Arc<dyn DeviceBackend>,
        raw: vk::CommandBuffer,
        family: u32,
    ) -> Self {
        Self::wrap(backend, raw, vk::CommandPool::null(), family, true)
    }

    fn wrap(
        backend: Arc<dyn DeviceBackend>,
        raw: vk::CommandBuffer,
        pool: vk::CommandPool,
        family: u32,
        external: bool,
    ) -> Self {
        Self {
            tracker: Arc::new(Tracker {
                backend,
                state: Mutex::new(TrackerState {
                    status: CommandBufferStatus::Ready,
                    run: 0,
                    submissions: 0,
                    serial: 0,
                    one_time_submit: false,
                    lost: false,
                    fences: Slab::new(),
                }),
            }),
            raw,
            pool,
            family,
            external,
        }
    }

    fn reject(
        operation: &'static str,
        expected: CommandBufferStatus,
        actual: CommandBufferStatus,
    ) -> ExecError {
        let err = ExecError::InvalidStateTransition {
            operation,
            expected: expected.name(),
            actual: actual.name(),
        };
        error!("{}", err);
        err
    }

    /// Start recording. Only valid from `READY`: recording into a buffer that
    /// may still be executing would corrupt in-flight work.
    pub fn begin(&mut self, one_time_submit: bool) -> ExecResult<()> {
        let mut state = self.tracker.state.lock();
        if state.lost {
            error!("begin rejected: {}", ExecError::DeviceLost);
            return Err(ExecError::DeviceLost);
        }
        if state.status != CommandBufferStatus::Ready {
            return Err(Self::reject("begin", CommandBufferStatus::Ready, state.status));
        }
        self.tracker
            .backend
            .begin_command_buffer(self.raw, one_time_submit)?;
        state.status = CommandBufferStatus::Recording;
        state.one_time_submit = one_time_submit;
        Ok(())
    }

    pub fn end(&mut self) -> ExecResult<()> {
        let mut state = self.tracker.state.lock();
        if state.status != CommandBufferStatus::Recording {
            return Err(Self::reject("end", CommandBufferStatus::Recording, state.status));
        }
        self.tracker.backend.end_command_buffer(self.raw)?;
        state.status = CommandBufferStatus::Recorded;
        Ok(())
    }

    /// Submit the recorded commands on the leased queue, attaching a fence
    /// (recycled when one is free). The buffer stays `RECORDED` so it can be
    /// submitted again before the next reset.
    pub fn submit(&mut self, lease: &QueueLease) -> ExecResult<RunToken> {
        if !lease.is_valid() {
            error!("submit rejected: {}", ExecError::InvalidLease);
            return Err(ExecError::InvalidLease);
        }
        if lease.family_index() != self.family {
            let err = ExecError::FamilyMismatch {
                buffer: self.family,
                queue: lease.family_index(),
            };
            error!("submit rejected: {}", err);
            return Err(err);
        }

        let backend = &self.tracker.backend;
        let mut state = self.tracker.state.lock();
        if state.lost {
            error!("submit rejected: {}", ExecError::DeviceLost);
            return Err(ExecError::DeviceLost);
        }
        if state.status != CommandBufferStatus::Recorded {
            return Err(Self::reject("submit", CommandBufferStatus::Recorded, state.status));
        }
        if state.one_time_submit && state.submissions > 0 {
            warn!("submit rejected: one-time command buffer was already submitted");
            return Err(ExecError::InvalidStateTransition {
                operation: "submit",
                expected: "RECORDED (not yet submitted)",
                actual: "RECORDED (one-time, submitted)",
            });
        }

        let serial = state.serial + 1;
        let slot = match state.fences.acquire_free() {
            Some(slot) => {
                let Some(reused) = state.fences.get_mut(slot) else {
                    return Err(ExecError::DeviceLost);
                };
                reused.serial = serial;
                let fence = reused.fence;
                if let Err(e) = backend.reset_fence(fence) {
                    state.fences.release(slot);
                    return Err(e);
                }
                slot
            }
            None => {
                let fence = backend.create_fence()?;
                state.fences.insert_active(SubmitFence { fence, serial })
            }
        };
        let fence = state
            .fences
            .get(slot)
            .map(|slot| slot.fence)
            .ok_or(ExecError::DeviceLost)?;

        if let Err(e) = backend.queue_submit(lease.queue(), self.raw, fence) {
            error!(
                "queue submit on {}:{} failed: {}",
                lease.family_index(),
                lease.queue_index(),
                e
            );
            state.fences.release(slot);
            return Err(e);
        }
        state.serial = serial;
        state.submissions += 1;
        let run = state.run;
        drop(state);

        debug!(
            "submitted command buffer {:?} on queue {}:{}",
            self.raw,
            lease.family_index(),
            lease.queue_index()
        );
        Ok(RunToken::new(&self.tracker, run))
    }

    /// Wait for every submission, recycle the fences and return to `READY`.
    pub fn reset(&mut self, release_resources: bool) -> ExecResult<()> {
        self.tracker.wait()?;
        let mut state = self.tracker.state.lock();
        self.tracker
            .backend
            .reset_command_buffer(self.raw, release_resources)?;
        state.status = CommandBufferStatus::Ready;
        state.run += 1;
        state.submissions = 0;
        state.one_time_submit = false;
        Ok(())
    }

    /// Block until every submission has completed. The state is unchanged.
    pub fn wait(&self) -> ExecResult<()> {
        self.tracker.wait()
    }

    /// True while recording or while any submission is unconfirmed.
    /// Signaled fences found along the way are recycled.
    pub fn is_being_used(&self) -> bool {
        self.tracker.is_being_used()
    }

    /// Token for the current run of this buffer; resources touched while
    /// recording register it. Taken before `begin`, it reads as finished.
    pub fn current_run(&self) -> RunToken {
        RunToken::new(&self.tracker, self.tracker.current_run())
    }

    /// Ended, but not submitted even once since.
    pub fn awaiting_submit(&self) -> bool {
        let state = self.tracker.state.lock();
        state.status == CommandBufferStatus::Recorded && state.submissions == 0
    }

    pub fn status(&self) -> CommandBufferStatus {
        self.tracker.state.lock().status
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn family_index(&self) -> u32 {
        self.family
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Fences attached to unconfirmed submissions.
    pub fn active_fences(&self) -> usize {
        self.tracker.state.lock().fences.active_count()
    }

    /// Fences recycled and ready for the next submit.
    pub fn free_fences(&self) -> usize {
        self.tracker.state.lock().fences.free_count()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        match self.tracker.wait() {
            Ok(()) => {}
            Err(ExecError::DeviceLost) => {
                warn!("command buffer {:?} torn down after device loss", self.raw);
            }
            Err(e) => {
                // The GPU may still be executing it: leak the native buffer,
                // its fences and the tracker so outstanding run tokens keep
                // reporting unfinished until the fences signal.
                error!(
                    "cannot confirm command buffer {:?} is idle ({}); leaking it",
                    self.raw, e
                );
                std::mem::forget(self.tracker.clone());
                return;
            }
        }
        let backend = self.tracker.backend.clone();
        let fences = {
            let mut state = self.tracker.state.lock();
            // Tokens still holding the tracker must read as finished.
            state.status = CommandBufferStatus::Ready;
            state.run += 1;
            std::mem::take(&mut state.fences)
        };
        for slot in fences.into_values() {
            backend.destroy_fence(slot.fence);
        }
        if !self.external {
            backend.free_command_buffer(self.pool, self.raw);
        }
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("raw", &self.raw)
            .field("family", &self.family)
            .field("status", &self.status())
            .field("external", &self.external)
            .finish()
    }
}
