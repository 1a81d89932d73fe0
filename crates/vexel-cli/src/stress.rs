//! Headless stress workload.
//!
//! Worker threads lease compatible queues, record and submit through their own
//! pools and hand transient resources to the shared reclamation bin. A
//! completer thread plays the GPU and signals fences after random delays,
//! while the main thread closes frames once every worker has submitted them.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use rand::Rng;
use tracing::{debug, error, info, warn};

use vexel_core::{ExecResult, VexelConfig};
use vexel_exec::{
    CapabilitySet, CommandBufferPool, CompletionMode, DeviceBackend, DeviceContext,
    HeadlessBackend, QueueLease, QueueLeaseManager, ReclamationBin, RunSet, RunToken,
};

/// Frames a worker's long-lived texture is sampled before it is replaced.
const TEXTURE_LIFETIME_FRAMES: u64 = 8;
const TEXTURE_BYTES: usize = 64 * 1024;

pub struct StressOptions {
    pub threads: usize,
    pub frames: u64,
    pub requests: Vec<CapabilitySet>,
    pub max_latency_us: u64,
}

/// Parse "graphics,compute,transfer+sparse_binding" into capability requests.
pub fn parse_requests(list: &str) -> anyhow::Result<Vec<CapabilitySet>> {
    let mut requests = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut required = CapabilitySet::empty();
        for name in item.split('+').map(str::trim) {
            let flag = CapabilitySet::from_name(&name.to_ascii_uppercase())
                .ok_or_else(|| anyhow::anyhow!("unknown capability '{}' in '{}'", name, item))?;
            required |= flag;
        }
        requests.push(required);
    }
    if requests.is_empty() {
        anyhow::bail!("no capability requests given");
    }
    Ok(requests)
}

/// Per-family lease counters, updated while a worker holds its lease.
struct LeaseStats {
    active: Vec<AtomicUsize>,
    peak: Vec<AtomicUsize>,
    leases: Vec<AtomicUsize>,
}

impl LeaseStats {
    fn new(families: usize) -> Self {
        let counters =
            || -> Vec<AtomicUsize> { (0..families).map(|_| AtomicUsize::new(0)).collect() };
        Self {
            active: counters(),
            peak: counters(),
            leases: counters(),
        }
    }

    fn enter(&self, family: u32) {
        let family = family as usize;
        let now = self.active[family].fetch_add(1, Ordering::SeqCst) + 1;
        self.peak[family].fetch_max(now, Ordering::SeqCst);
        self.leases[family].fetch_add(1, Ordering::Relaxed);
    }

    fn leave(&self, family: u32) {
        self.active[family as usize].fetch_sub(1, Ordering::SeqCst);
    }
}

struct FrameRun {
    frame: u64,
    run: RunToken,
}

struct Worker {
    id: usize,
    backend: Arc<dyn DeviceBackend>,
    queues: QueueLeaseManager,
    bin: Arc<ReclamationBin>,
    stats: Arc<LeaseStats>,
    freed_bytes: Arc<AtomicUsize>,
    prewarm: u32,
    runs_tx: Sender<FrameRun>,
}

struct WorkerReport {
    pools: usize,
    command_buffers: usize,
}

impl Worker {
    fn run(self, frames: u64, requests: &[CapabilitySet]) -> anyhow::Result<WorkerReport> {
        let mut rng = rand::thread_rng();
        let mut pools: HashMap<u32, CommandBufferPool> = HashMap::new();
        let mut texture_runs = RunSet::new();

        for frame in 0..frames {
            let required = requests[rng.gen_range(0..requests.len())];
            let lease = self.queues.lease_compatible_queue(required);
            if !lease.is_valid() {
                anyhow::bail!("worker {}: no queue family offers {}", self.id, required);
            }
            let family = lease.family_index();

            self.stats.enter(family);
            let submitted = self
                .pool_for(&mut pools, family)
                .and_then(|pool| record_and_submit(pool, &lease));
            self.stats.leave(family);
            drop(lease);
            let run = submitted?;

            let staging = vec![0u8; rng.gen_range(256..=16 * 1024)];
            self.destroy_bytes_later(staging, vec![run.clone()]);

            texture_runs.register(run.clone());
            if (frame + 1) % TEXTURE_LIFETIME_FRAMES == 0 {
                debug!("worker {}: replacing texture after frame {}", self.id, frame);
                self.destroy_bytes_later(vec![0u8; TEXTURE_BYTES], texture_runs.take());
            }

            self.runs_tx
                .send(FrameRun { frame, run })
                .map_err(|_| anyhow::anyhow!("frame pacer stopped"))?;
        }
        if !texture_runs.is_empty() {
            self.destroy_bytes_later(vec![0u8; TEXTURE_BYTES], texture_runs.take());
        }

        Ok(WorkerReport {
            pools: pools.len(),
            command_buffers: pools.values().map(CommandBufferPool::len).sum(),
        })
    }

    fn pool_for<'a>(
        &self,
        pools: &'a mut HashMap<u32, CommandBufferPool>,
        family: u32,
    ) -> ExecResult<&'a mut CommandBufferPool> {
        match pools.entry(family) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let pool =
                    CommandBufferPool::with_prewarm(self.backend.clone(), family, self.prewarm)?;
                Ok(entry.insert(pool))
            }
        }
    }

    fn destroy_bytes_later(&self, bytes: Vec<u8>, runs: Vec<RunToken>) {
        let freed = self.freed_bytes.clone();
        self.bin.destroy_later(bytes, runs, move |bytes| {
            freed.fetch_add(bytes.len(), Ordering::Relaxed);
        });
    }
}

fn record_and_submit(pool: &mut CommandBufferPool, lease: &QueueLease) -> ExecResult<RunToken> {
    let id = pool.begin_command_buffer(true)?;
    pool.end(id)?;
    pool.submit(id, lease)
}

/// Signal one pending submission at a time until told to stop, then flush.
fn spawn_completer(
    device: Arc<HeadlessBackend>,
    stop: Arc<AtomicBool>,
    max_latency_us: u64,
) -> thread::JoinHandle<u64> {
    thread::spawn(move || {
        let mut rng = rand::thread_rng();
        let mut completed = 0u64;
        while !stop.load(Ordering::Acquire) {
            if device.complete_next() {
                completed += 1;
                if max_latency_us > 0 {
                    thread::sleep(Duration::from_micros(rng.gen_range(0..=max_latency_us)));
                }
            } else {
                thread::sleep(Duration::from_micros(50));
            }
        }
        completed + device.complete_all() as u64
    })
}

pub struct FamilyReport {
    index: u32,
    queue_count: u32,
    capabilities: CapabilitySet,
    peak: usize,
    leases: usize,
}

pub struct StressReport {
    threads: usize,
    frames: u64,
    elapsed: Duration,
    submissions: u64,
    completed: u64,
    families: Vec<FamilyReport>,
    pools: usize,
    command_buffers: usize,
    swept: usize,
    destroyed: u64,
    freed_bytes: usize,
}

impl StressReport {
    pub fn print(&self) {
        println!(
            "Stress run: {} thread(s), {} frame(s) paced in {:.2?}",
            self.threads, self.frames, self.elapsed
        );
        println!(
            "Submissions: {} ({} completed by the device)",
            self.submissions, self.completed
        );
        println!();
        println!("Queue families:");
        for family in &self.families {
            let verdict = if family.peak <= family.queue_count as usize {
                "ok"
            } else {
                "EXCEEDED"
            };
            println!(
                "  Family {} [{}]: {} lease(s), peak {}/{} concurrent ({})",
                family.index,
                family.capabilities,
                family.leases,
                family.peak,
                family.queue_count,
                verdict
            );
        }
        println!();
        println!(
            "Pools: {} holding {} command buffer(s)",
            self.pools, self.command_buffers
        );
        println!(
            "Reclaimed: {} resource(s) ({} during frames), {} KiB",
            self.destroyed,
            self.swept,
            self.freed_bytes / 1024
        );
    }
}

pub fn run_stress(config: VexelConfig, options: &StressOptions) -> anyhow::Result<StressReport> {
    let device = Arc::new(
        HeadlessBackend::discrete(CompletionMode::Manual)
            .with_max_frames_in_flight(config.device.max_frames_in_flight),
    );
    let backend: Arc<dyn DeviceBackend> = device.clone();
    let prewarm = config.pool.prewarm_buffers;
    let mut ctx = DeviceContext::new(backend.clone(), config)?;

    for required in &options.requests {
        if !ctx.queues().families().any(|family| family.supports(*required)) {
            anyhow::bail!("no queue family of the headless device offers {}", required);
        }
    }

    let stats = Arc::new(LeaseStats::new(ctx.queues().family_count() as usize));
    let freed_bytes = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let completer = spawn_completer(device.clone(), stop.clone(), options.max_latency_us);

    info!(
        "stress: {} thread(s) x {} frame(s), requests [{}]",
        options.threads,
        options.frames,
        options
            .requests
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let started = Instant::now();

    let (runs_tx, runs_rx) = unbounded();
    let mut workers = Vec::with_capacity(options.threads);
    for id in 0..options.threads {
        let worker = Worker {
            id,
            backend: backend.clone(),
            queues: ctx.queues().clone(),
            bin: ctx.bin().clone(),
            stats: stats.clone(),
            freed_bytes: freed_bytes.clone(),
            prewarm,
            runs_tx: runs_tx.clone(),
        };
        let frames = options.frames;
        let requests = options.requests.clone();
        let handle = thread::Builder::new()
            .name(format!("vexel-worker-{}", id))
            .spawn(move || worker.run(frames, &requests))?;
        workers.push(handle);
    }
    drop(runs_tx);

    // A frame closes once every worker has submitted it.
    let mut open: BTreeMap<u64, Vec<RunToken>> = BTreeMap::new();
    let mut next_frame = 0u64;
    let mut swept = 0usize;
    let mut failure: Option<anyhow::Error> = None;
    for FrameRun { frame, run } in runs_rx.iter() {
        open.entry(frame).or_default().push(run);
        while open
            .get(&next_frame)
            .is_some_and(|runs| runs.len() == options.threads)
        {
            let runs = open.remove(&next_frame).unwrap_or_default();
            match ctx.end_frame(runs) {
                Ok(reclaimed) => swept += reclaimed,
                Err(e) => {
                    error!("frame {} failed: {}", next_frame, e);
                    failure = Some(e.into());
                    break;
                }
            }
            next_frame += 1;
        }
        if failure.is_some() {
            break;
        }
    }
    if failure.is_none() {
        // Frames left open by a failed worker still have to be paced.
        for (_, runs) in std::mem::take(&mut open) {
            match ctx.end_frame(runs) {
                Ok(reclaimed) => swept += reclaimed,
                Err(e) => {
                    failure = Some(e.into());
                    break;
                }
            }
        }
    }

    let mut pools = 0;
    let mut command_buffers = 0;
    for (id, handle) in workers.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(report)) => {
                pools += report.pools;
                command_buffers += report.command_buffers;
            }
            Ok(Err(e)) => {
                warn!("worker {} failed: {}", id, e);
                failure.get_or_insert(e);
            }
            Err(_) => {
                failure.get_or_insert_with(|| anyhow::anyhow!("worker {} panicked", id));
            }
        }
    }

    stop.store(true, Ordering::Release);
    let completed = completer
        .join()
        .map_err(|_| anyhow::anyhow!("completer thread panicked"))?;
    if let Some(e) = failure {
        return Err(e);
    }

    let frames = ctx.frame_index();
    ctx.bin().drain_blocking();
    let destroyed = ctx.bin().destroyed();
    drop(ctx);

    let families = device
        .queue_families()
        .iter()
        .map(|family| {
            let slot = family.index as usize;
            FamilyReport {
                index: family.index,
                queue_count: family.queue_count,
                capabilities: family.capabilities,
                peak: stats.peak[slot].load(Ordering::SeqCst),
                leases: stats.leases[slot].load(Ordering::SeqCst),
            }
        })
        .collect();

    Ok(StressReport {
        threads: options.threads,
        frames,
        elapsed: started.elapsed(),
        submissions: device.submissions(),
        completed,
        families,
        pools,
        command_buffers,
        swept,
        destroyed,
        freed_bytes: freed_bytes.load(Ordering::SeqCst),
    })
}
