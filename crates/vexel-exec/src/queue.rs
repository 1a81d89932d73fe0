//! Thread-affine leasing of hardware queues.
//!
//! Vulkan queues must be externally synchronized, and a device exposes only a
//! handful of them. Every family is a shard with its own lock and condition
//! variable, so threads leasing from different families never contend. A
//! second, manager-wide lock is taken only by the cross-family
//! "any compatible queue" search.
//!
//! A thread that already holds a slot in a family gets that same slot back
//! (reference counted) instead of blocking on itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use ash::vk;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use vexel_core::{CapabilitySet, ExecError, ExecResult, QueueFamily};

use crate::backend::DeviceBackend;

#[derive(Debug, Clone, Copy)]
struct Claim {
    index: u32,
    refs: usize,
}

/// Free list and ownership table of one family.
struct FamilySlots {
    /// Unclaimed slot indices, next to hand out last
    free: Vec<u32>,
    /// slot index -> owning thread
    owner: Vec<Option<ThreadId>>,
    claims: HashMap<ThreadId, Claim>,
}

impl FamilySlots {
    fn new(queue_count: u32) -> Self {
        Self {
            free: (0..queue_count).rev().collect(),
            owner: vec![None; queue_count as usize],
            claims: HashMap::new(),
        }
    }

    /// Reentrant fast path: bump the reference count of the slot `thread`
    /// already holds.
    fn reenter(&mut self, thread: ThreadId) -> Option<u32> {
        let claim = self.claims.get_mut(&thread)?;
        claim.refs += 1;
        Some(claim.index)
    }

    fn try_claim(&mut self, thread: ThreadId) -> Option<u32> {
        let index = self.free.pop()?;
        self.owner[index as usize] = Some(thread);
        self.claims.insert(thread, Claim { index, refs: 1 });
        Some(index)
    }

    /// Drop one reference. Returns true when the slot went back to the free
    /// list.
    fn release(&mut self, thread: ThreadId) -> bool {
        let Some(claim) = self.claims.get_mut(&thread) else {
            return false;
        };
        claim.refs -= 1;
        if claim.refs > 0 {
            return false;
        }
        let index = claim.index;
        self.claims.remove(&thread);
        self.owner[index as usize] = None;
        self.free.push(index);
        true
    }
}

struct FamilyShard {
    family: QueueFamily,
    slots: Mutex<FamilySlots>,
    available: Condvar,
}

struct Shared {
    backend: Arc<dyn DeviceBackend>,
    shards: Vec<FamilyShard>,
    /// Round-robin cursor for the cross-family search
    any: Mutex<usize>,
    any_available: Condvar,
}

impl Shared {
    fn release(&self, family: u32, thread: ThreadId) {
        let shard = &self.shards[family as usize];
        let freed = shard.slots.lock().release(thread);
        if !freed {
            return;
        }
        trace!("queue family {} slot returned by {:?}", family, thread);
        shard.available.notify_one();
        // Taking the lock orders this notification after any search that
        // already inspected this family and is about to wait. Cross-family
        // waiters have different candidate sets, so all of them re-check.
        let _any = self.any.lock();
        self.any_available.notify_all();
    }
}

/// Mediates access to the device's queues among any number of threads.
#[derive(Clone)]
pub struct QueueLeaseManager {
    shared: Arc<Shared>,
}

impl QueueLeaseManager {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        let shards = backend
            .queue_families()
            .iter()
            .map(|family| FamilyShard {
                family: *family,
                slots: Mutex::new(FamilySlots::new(family.queue_count)),
                available: Condvar::new(),
            })
            .collect::<Vec<_>>();
        debug!("queue lease manager over {} families", shards.len());
        Self {
            shared: Arc::new(Shared {
                backend,
                shards,
                any: Mutex::new(0),
                any_available: Condvar::new(),
            }),
        }
    }

    pub fn families(&self) -> impl Iterator<Item = &QueueFamily> {
        self.shared.shards.iter().map(|shard| &shard.family)
    }

    pub fn family_count(&self) -> u32 {
        self.shared.shards.len() as u32
    }

    /// Lease a queue of `family`, blocking until a slot is free.
    ///
    /// Returns the calling thread's existing slot (with its reference count
    /// bumped) if it already holds one in this family. An out-of-range family
    /// yields an invalid lease.
    pub fn lease_queue(&self, family: u32) -> QueueLease {
        let Some(shard) = self.shared.shards.get(family as usize) else {
            let err = ExecError::InvalidFamilyIndex {
                index: family,
                family_count: self.family_count(),
            };
            error!("lease_queue rejected: {}", err);
            return QueueLease::invalid();
        };
        if shard.family.queue_count == 0 {
            error!("lease_queue rejected: family {} exposes no queues", family);
            return QueueLease::invalid();
        }

        let thread = thread::current().id();
        let mut slots = shard.slots.lock();
        if let Some(index) = slots.reenter(thread) {
            return self.lease(family, index, thread);
        }
        loop {
            if let Some(index) = slots.try_claim(thread) {
                drop(slots);
                debug!("leased queue {}:{}", family, index);
                return self.lease(family, index, thread);
            }
            trace!("waiting for a free queue in family {}", family);
            shard.available.wait(&mut slots);
        }
    }

    /// Lease a queue from any family offering `required`, blocking until one
    /// of them has a free slot.
    ///
    /// A family in which the calling thread already holds a slot is preferred.
    /// Otherwise candidates are tried round-robin. When no family can ever
    /// satisfy the requirement the lease is invalid and returned immediately.
    pub fn lease_compatible_queue(&self, required: CapabilitySet) -> QueueLease {
        let candidates: Vec<u32> = self
            .shared
            .shards
            .iter()
            .enumerate()
            .filter(|(_, shard)| shard.family.queue_count > 0 && shard.family.supports(required))
            .map(|(family, _)| family as u32)
            .collect();

        match candidates.as_slice() {
            [] => {
                warn!("{}", ExecError::NoCompatibleFamily { required });
                QueueLease::invalid()
            }
            [family] => self.lease_queue(*family),
            _ => self.lease_any(&candidates),
        }
    }

    fn lease_any(&self, candidates: &[u32]) -> QueueLease {
        let thread = thread::current().id();
        let mut cursor = self.shared.any.lock();

        for &family in candidates {
            let reentered = self.shared.shards[family as usize].slots.lock().reenter(thread);
            if let Some(index) = reentered {
                return self.lease(family, index, thread);
            }
        }

        let n = candidates.len();
        loop {
            for step in 0..n {
                let family = candidates[(*cursor + step) % n];
                let claimed = self.shared.shards[family as usize].slots.lock().try_claim(thread);
                if let Some(index) = claimed {
                    *cursor = (*cursor + step + 1) % n;
                    drop(cursor);
                    debug!("leased compatible queue {}:{}", family, index);
                    return self.lease(family, index, thread);
                }
            }
            trace!("waiting for any of families {:?}", candidates);
            self.shared.any_available.wait(&mut cursor);
        }
    }

    /// Register a slot obtained outside the manager (a presentation queue,
    /// say) as owned by `thread`, without blocking.
    ///
    /// Fails if another thread owns the slot or if `thread` already holds a
    /// different slot of the same family. Registering a slot the thread
    /// already owns bumps its reference count.
    pub fn mark_used(&self, thread: ThreadId, family: u32, index: u32) -> ExecResult<QueueLease> {
        let result = self.try_mark_used(thread, family, index);
        if let Err(e) = &result {
            error!("mark_used rejected: {}", e);
        }
        result
    }

    fn try_mark_used(&self, thread: ThreadId, family: u32, index: u32) -> ExecResult<QueueLease> {
        let shard = self
            .shared
            .shards
            .get(family as usize)
            .ok_or(ExecError::InvalidFamilyIndex {
                index: family,
                family_count: self.family_count(),
            })?;
        if index >= shard.family.queue_count {
            return Err(ExecError::InvalidQueueIndex {
                family,
                index,
                queue_count: shard.family.queue_count,
            });
        }

        let mut slots = shard.slots.lock();
        if let Some(owner) = slots.owner[index as usize] {
            if owner != thread {
                return Err(ExecError::SlotOwnedByOtherThread {
                    family,
                    index,
                    owner,
                });
            }
        }
        if let Some(claim) = slots.claims.get(&thread) {
            if claim.index != index {
                return Err(ExecError::ThreadHoldsOtherSlot {
                    family,
                    requested: index,
                    held: claim.index,
                });
            }
        }

        if slots.reenter(thread).is_none() {
            slots.free.retain(|&free| free != index);
            slots.owner[index as usize] = Some(thread);
            slots.claims.insert(thread, Claim { index, refs: 1 });
        }
        drop(slots);
        Ok(self.lease(family, index, thread))
    }

    /// Number of threads currently holding a slot in `family`.
    pub fn active_leases(&self, family: u32) -> usize {
        self.shared
            .shards
            .get(family as usize)
            .map(|shard| shard.slots.lock().claims.len())
            .unwrap_or(0)
    }

    /// Outstanding lease handles `thread` holds in `family`.
    pub fn lease_refs(&self, thread: ThreadId, family: u32) -> usize {
        self.shared
            .shards
            .get(family as usize)
            .and_then(|shard| shard.slots.lock().claims.get(&thread).map(|c| c.refs))
            .unwrap_or(0)
    }

    pub fn owner_of(&self, family: u32, index: u32) -> Option<ThreadId> {
        let shard = self.shared.shards.get(family as usize)?;
        let slots = shard.slots.lock();
        slots.owner.get(index as usize).copied().flatten()
    }

    fn lease(&self, family: u32, index: u32, owner: ThreadId) -> QueueLease {
        QueueLease {
            shared: Some(self.shared.clone()),
            family,
            index,
            queue: self.shared.backend.queue(family, index),
            owner,
        }
    }
}

/// One reference to a leased queue slot. Dropping the last reference a
/// thread holds in a family returns the slot and wakes waiters.
pub struct QueueLease {
    shared: Option<Arc<Shared>>,
    family: u32,
    index: u32,
    queue: vk::Queue,
    owner: ThreadId,
}

impl QueueLease {
    fn invalid() -> Self {
        Self {
            shared: None,
            family: u32::MAX,
            index: u32::MAX,
            queue: vk::Queue::null(),
            owner: thread::current().id(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    pub fn family_index(&self) -> u32 {
        self.family
    }

    pub fn queue_index(&self) -> u32 {
        self.index
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.shared
            .as_ref()
            .map(|shared| shared.shards[self.family as usize].family.capabilities)
            .unwrap_or_default()
    }
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.family, self.owner);
        }
    }
}

impl fmt::Debug for QueueLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "QueueLease(invalid)");
        }
        f.debug_struct("QueueLease")
            .field("family", &self.family)
            .field("index", &self.index)
            .field("owner", &self.owner)
            .finish()
    }
}
