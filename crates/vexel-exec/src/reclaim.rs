//! Deferred destruction of GPU-visible resources.
//!
//! Deleting a buffer or image on the CPU side does not mean the GPU is done
//! with it. The bin holds each resource's destructor together with the run
//! tokens gathered while the resource was alive, and runs the destructor
//! once, on a sweep after every one of those runs has finished.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::run::RunToken;

struct Entry {
    destroy: Box<dyn FnOnce() + Send>,
    runs: Vec<RunToken>,
}

impl Entry {
    fn ready(&mut self) -> bool {
        self.runs.retain_mut(|run| !run.has_finished());
        self.runs.is_empty()
    }
}

/// Any thread may push into the bin; sweeps are meant to come from one
/// thread (once per frame, typically).
pub struct ReclamationBin {
    incoming: Sender<Entry>,
    queued: Receiver<Entry>,
    pending: Mutex<Vec<Entry>>,
    destroyed: AtomicU64,
}

impl ReclamationBin {
    pub fn new() -> Self {
        let (incoming, queued) = crossbeam_channel::unbounded();
        Self {
            incoming,
            queued,
            pending: Mutex::new(Vec::new()),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Destroy `resource` with `destructor` once every run in `runs` has
    /// finished. Never runs the destructor on the calling thread.
    pub fn destroy_later<R, F>(&self, resource: R, runs: Vec<RunToken>, destructor: F)
    where
        R: Send + 'static,
        F: FnOnce(R) + Send + 'static,
    {
        let entry = Entry {
            destroy: Box::new(move || destructor(resource)),
            runs,
        };
        trace!("deferred destruction with {} run(s)", entry.runs.len());
        // The receiver lives as long as the bin, so sending cannot fail.
        let _ = self.incoming.send(entry);
    }

    /// Run the destructor of every entry whose runs have all finished.
    /// Returns how many resources were destroyed.
    pub fn collect(&self) -> usize {
        let ready: Vec<Entry> = {
            let mut pending = self.pending.lock();
            pending.extend(self.queued.try_iter());
            let mut ready = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].ready() {
                    ready.push(pending.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            ready
        };

        let count = ready.len();
        for entry in ready {
            (entry.destroy)();
        }
        if count > 0 {
            self.destroyed.fetch_add(count as u64, Ordering::Relaxed);
            debug!("reclaimed {} resource(s)", count);
        }
        count
    }

    /// Wait for every outstanding run, then destroy everything whose runs
    /// finished. Destructors that push more entries are drained too.
    ///
    /// A run that is still recording, or ended but never submitted, cannot be
    /// waited on: its entries stay pending and are not destroyed.
    pub fn drain_blocking(&self) -> usize {
        let mut total = 0;
        let mut held = Vec::new();
        loop {
            let entries: Vec<Entry> = {
                let mut pending = self.pending.lock();
                pending.extend(self.queued.try_iter());
                std::mem::take(&mut *pending)
            };
            if entries.is_empty() {
                break;
            }
            for mut entry in entries {
                for run in &mut entry.runs {
                    if let Err(e) = run.wait() {
                        error!("waiting on run before reclamation: {}", e);
                    }
                }
                if entry.ready() {
                    (entry.destroy)();
                    total += 1;
                } else {
                    held.push(entry);
                }
            }
        }
        if !held.is_empty() {
            warn!(
                "{} resource(s) held back by runs that have not been submitted",
                held.len()
            );
            self.pending.lock().extend(held);
        }
        if total > 0 {
            self.destroyed.fetch_add(total as u64, Ordering::Relaxed);
            debug!("drained {} resource(s)", total);
        }
        total
    }

    /// Entries waiting for their runs to finish.
    pub fn pending(&self) -> usize {
        self.pending.lock().len() + self.queued.len()
    }

    /// Resources destroyed over the bin's lifetime.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }
}

impl Default for ReclamationBin {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReclamationBin {
    fn drop(&mut self) {
        self.drain_blocking();
        let leaked = std::mem::take(self.pending.get_mut());
        if !leaked.is_empty() {
            error!(
                "leaking {} resource(s) whose runs never finished",
                leaked.len()
            );
            // Neither the destructor nor the resource's own drop may run.
            for entry in leaked {
                std::mem::forget(entry);
            }
        }
    }
}
