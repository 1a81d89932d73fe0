use std::sync::Arc;

use ash::vk;
use tracing::{debug, error};

use vexel_core::{ExecError, ExecResult};

use crate::backend::DeviceBackend;
use crate::command::CommandBuffer;
use crate::queue::QueueLease;
use crate::run::RunToken;

/// Identifies one checkout of a pooled command buffer. The generation
/// advances every time the buffer is recycled, so ids held past that point
/// stop resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferId {
    index: u32,
    generation: u32,
}

impl CommandBufferId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct PoolSlot {
    buffer: CommandBuffer,
    generation: u32,
}

/// Recycles command buffers of one queue family.
///
/// A pool belongs to a single thread (typically one per worker); it takes no
/// locks. It grows to the largest number of buffers that were in use at once
/// and never shrinks.
pub struct CommandBufferPool {
    backend: Arc<dyn DeviceBackend>,
    family: u32,
    raw: vk::CommandPool,
    slots: Vec<PoolSlot>,
    available: Vec<u32>,
    used: Vec<u32>,
}

impl CommandBufferPool {
    pub fn new(backend: Arc<dyn DeviceBackend>, family: u32) -> ExecResult<Self> {
        Self::with_prewarm(backend, family, 0)
    }

    /// Create the pool with `prewarm` buffers already allocated.
    pub fn with_prewarm(
        backend: Arc<dyn DeviceBackend>,
        family: u32,
        prewarm: u32,
    ) -> ExecResult<Self> {
        let family_count = backend.queue_families().len() as u32;
        if family >= family_count {
            let err = ExecError::InvalidFamilyIndex {
                index: family,
                family_count,
            };
            error!("command pool rejected: {}", err);
            return Err(err);
        }
        let raw = backend.create_command_pool(family)?;
        let mut pool = Self {
            backend,
            family,
            raw,
            slots: Vec::new(),
            available: Vec::new(),
            used: Vec::new(),
        };
        for _ in 0..prewarm {
            let index = pool.allocate()?;
            pool.available.push(index);
        }
        debug!(
            "command pool for family {} ({} prewarmed)",
            family, prewarm
        );
        Ok(pool)
    }

    fn allocate(&mut self) -> ExecResult<u32> {
        let buffer = CommandBuffer::allocate(self.backend.clone(), self.raw, self.family)?;
        self.slots.push(PoolSlot {
            buffer,
            generation: 0,
        });
        Ok(self.slots.len() as u32 - 1)
    }

    /// Check out a buffer with `begin` already called on it.
    ///
    /// Recycled buffers are preferred. Only when none is available are the
    /// in-use buffers swept for finished ones, and only when the sweep comes
    /// back empty is a new buffer allocated.
    pub fn begin_command_buffer(&mut self, one_time_submit: bool) -> ExecResult<CommandBufferId> {
        if self.available.is_empty() {
            self.reclaim();
        }
        let index = match self.available.pop() {
            Some(index) => index,
            None => {
                let index = self.allocate()?;
                debug!(
                    "command pool for family {} grew to {} buffers",
                    self.family,
                    self.slots.len()
                );
                index
            }
        };
        self.used.push(index);

        let slot = &mut self.slots[index as usize];
        if let Err(e) = slot.buffer.begin(one_time_submit) {
            self.used.retain(|&i| i != index);
            self.available.push(index);
            return Err(e);
        }
        Ok(CommandBufferId {
            index,
            generation: slot.generation,
        })
    }

    /// Move every in-use buffer that finished executing back to the
    /// available list. Buffers that were ended but never submitted stay
    /// checked out. Returns how many were reclaimed.
    pub fn reclaim(&mut self) -> usize {
        let mut reclaimed = 0;
        let mut still_used = Vec::with_capacity(self.used.len());
        for index in std::mem::take(&mut self.used) {
            let slot = &mut self.slots[index as usize];
            if slot.buffer.is_being_used() || slot.buffer.awaiting_submit() {
                still_used.push(index);
                continue;
            }
            match slot.buffer.reset(false) {
                Ok(()) => {
                    slot.generation = slot.generation.wrapping_add(1);
                    self.available.push(index);
                    reclaimed += 1;
                }
                Err(e) => {
                    error!("failed to reset command buffer {}: {}", index, e);
                    still_used.push(index);
                }
            }
        }
        self.used = still_used;
        reclaimed
    }

    /// Return a checked-out buffer explicitly, waiting for its submissions.
    pub fn recycle(&mut self, id: CommandBufferId) -> ExecResult<()> {
        self.check(id)?;
        let slot = &mut self.slots[id.index as usize];
        slot.buffer.reset(false)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.used.retain(|&i| i != id.index);
        self.available.push(id.index);
        Ok(())
    }

    /// Block until every checked-out buffer's submissions complete. Used at
    /// teardown; buffers still recording are left alone.
    pub fn wait_for_all(&mut self) {
        self.reclaim();
        for &index in &self.used {
            if let Err(e) = self.slots[index as usize].buffer.wait() {
                error!("waiting on command buffer {}: {}", index, e);
            }
        }
        self.reclaim();
    }

    fn check(&self, id: CommandBufferId) -> ExecResult<()> {
        match self.slots.get(id.index as usize) {
            Some(slot) if slot.generation == id.generation && self.used.contains(&id.index) => {
                Ok(())
            }
            _ => Err(ExecError::StaleCommandBuffer {
                index: id.index,
                generation: id.generation,
            }),
        }
    }

    pub fn buffer(&self, id: CommandBufferId) -> ExecResult<&CommandBuffer> {
        self.check(id)?;
        Ok(&self.slots[id.index as usize].buffer)
    }

    pub fn buffer_mut(&mut self, id: CommandBufferId) -> ExecResult<&mut CommandBuffer> {
        self.check(id)?;
        Ok(&mut self.slots[id.index as usize].buffer)
    }

    /// End recording of a checked-out buffer.
    pub fn end(&mut self, id: CommandBufferId) -> ExecResult<()> {
        self.buffer_mut(id)?.end()
    }

    /// Submit a checked-out buffer on the leased queue.
    pub fn submit(&mut self, id: CommandBufferId, lease: &QueueLease) -> ExecResult<RunToken> {
        self.buffer_mut(id)?.submit(lease)
    }

    pub fn family_index(&self) -> u32 {
        self.family
    }

    /// Total buffers owned by the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.used.len()
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        self.wait_for_all();
        let busy = self
            .slots
            .iter()
            .filter(|slot| slot.buffer.active_fences() > 0)
            .count();
        // Buffers free themselves before their pool goes away.
        self.slots.clear();
        if busy > 0 {
            error!(
                "{} command buffer(s) of family {} may still be executing; leaking their pool",
                busy, self.family
            );
            return;
        }
        self.backend.destroy_command_pool(self.raw);
    }
}
