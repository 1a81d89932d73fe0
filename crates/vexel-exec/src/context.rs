use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info};

use vexel_core::{ExecResult, VexelConfig};

use crate::backend::DeviceBackend;
use crate::pool::CommandBufferPool;
use crate::queue::QueueLeaseManager;
use crate::reclaim::ReclamationBin;
use crate::run::RunToken;

/// Ties the execution subsystem to one device: queue leasing, the shared
/// reclamation bin and frame pacing.
pub struct DeviceContext {
    backend: Arc<dyn DeviceBackend>,
    queues: QueueLeaseManager,
    bin: Arc<ReclamationBin>,
    config: VexelConfig,
    frame: u64,
    /// Runs submitted by each frame still allowed in flight, oldest first
    in_flight: VecDeque<Vec<RunToken>>,
}

impl DeviceContext {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: VexelConfig) -> ExecResult<Self> {
        config.validate()?;
        let queues = QueueLeaseManager::new(backend.clone());
        info!(
            "device context: {} queue families, {} frame(s) in flight",
            queues.family_count(),
            backend.max_frames_in_flight()
        );
        Ok(Self {
            backend,
            queues,
            bin: Arc::new(ReclamationBin::new()),
            config,
            frame: 0,
            in_flight: VecDeque::new(),
        })
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub fn queues(&self) -> &QueueLeaseManager {
        &self.queues
    }

    /// The shared bin; clone the `Arc` to delete resources from other threads.
    pub fn bin(&self) -> &Arc<ReclamationBin> {
        &self.bin
    }

    pub fn config(&self) -> &VexelConfig {
        &self.config
    }

    pub fn frame_index(&self) -> u64 {
        self.frame
    }

    /// A command pool for `family`, prewarmed per configuration. Pools are
    /// owned by the thread that records with them.
    pub fn new_pool(&self, family: u32) -> ExecResult<CommandBufferPool> {
        CommandBufferPool::with_prewarm(
            self.backend.clone(),
            family,
            self.config.pool.prewarm_buffers,
        )
    }

    /// Close the current frame.
    ///
    /// Blocks on the oldest frame once more than max-frames-in-flight frames
    /// are outstanding, then sweeps the bin on the configured interval.
    /// Returns how many resources the sweep destroyed.
    pub fn end_frame(&mut self, runs: Vec<RunToken>) -> ExecResult<usize> {
        self.in_flight.push_back(runs);
        self.frame += 1;

        let depth = self.backend.max_frames_in_flight().max(1) as usize;
        while self.in_flight.len() > depth {
            if let Some(mut oldest) = self.in_flight.pop_front() {
                for run in &mut oldest {
                    run.wait()?;
                }
            }
        }

        let interval = u64::from(self.config.reclamation.sweep_interval_frames.max(1));
        if self.frame % interval != 0 {
            return Ok(0);
        }
        let reclaimed = self.bin.collect();
        if reclaimed > 0 {
            debug!("frame {}: reclaimed {} resource(s)", self.frame, reclaimed);
        }
        Ok(reclaimed)
    }

    /// Frames whose runs have not been waited on yet.
    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        for mut frame in self.in_flight.drain(..) {
            for run in &mut frame {
                if let Err(e) = run.wait() {
                    error!("waiting on frame during teardown: {}", e);
                }
            }
        }
        self.bin.drain_blocking();
    }
}
