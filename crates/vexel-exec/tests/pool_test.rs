//! Integration test: CommandBufferPool recycling and growth

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vexel_common::init_test_logging;
use vexel_exec::{
    CommandBufferPool, CommandBufferStatus, CompletionMode, DeviceBackend, ExecError,
    HeadlessBackend, QueueLeaseManager,
};

fn setup(mode: CompletionMode) -> (Arc<HeadlessBackend>, Arc<dyn DeviceBackend>, QueueLeaseManager) {
    init_test_logging();
    let device = Arc::new(HeadlessBackend::discrete(mode));
    let backend: Arc<dyn DeviceBackend> = device.clone();
    let manager = QueueLeaseManager::new(backend.clone());
    (device, backend, manager)
}

#[test]
fn test_finished_buffer_is_reused() {
    let (device, backend, manager) = setup(CompletionMode::Manual);
    let lease = manager.lease_queue(0);
    let mut pool = CommandBufferPool::new(backend, 0).expect("pool");

    let first = pool.begin_command_buffer(true).expect("begin");
    pool.end(first).expect("end");
    let mut run = pool.submit(first, &lease).expect("submit");
    device.complete_all();
    run.wait().expect("wait");

    let second = pool.begin_command_buffer(true).expect("begin again");
    assert_eq!(pool.len(), 1);
    assert_eq!(second.index(), first.index());
    assert_ne!(second.generation(), first.generation());
    assert_eq!(
        pool.buffer(second).expect("live id").status(),
        CommandBufferStatus::Recording
    );
}

#[test]
fn test_pool_grows_when_buffers_are_busy() {
    let (device, backend, manager) = setup(CompletionMode::Manual);
    let lease = manager.lease_queue(0);
    let mut pool = CommandBufferPool::new(backend, 0).expect("pool");

    let a = pool.begin_command_buffer(false).expect("a");
    let b = pool.begin_command_buffer(false).expect("b");
    assert_ne!(a, b);
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.in_use_count(), 2);

    // Submitted but unfinished work also keeps a buffer checked out.
    pool.end(a).expect("end a");
    pool.submit(a, &lease).expect("submit a");
    let c = pool.begin_command_buffer(false).expect("c");
    assert_eq!(pool.len(), 3);

    device.complete_all();
    pool.end(b).expect("end b");
    pool.submit(b, &lease).expect("submit b");
    pool.end(c).expect("end c");
    pool.submit(c, &lease).expect("submit c");
    device.complete_all();

    // Everything finished: the pool never shrinks, and new work reuses.
    for _ in 0..3 {
        pool.begin_command_buffer(false).expect("reuse");
    }
    assert_eq!(pool.len(), 3);
    assert_eq!(device.live_command_buffers(), 3);
}

#[test]
fn test_stale_id_no_longer_resolves() {
    let (_device, backend, manager) = setup(CompletionMode::Immediate);
    let lease = manager.lease_queue(0);
    let mut pool = CommandBufferPool::new(backend, 0).expect("pool");

    let id = pool.begin_command_buffer(true).expect("begin");
    pool.end(id).expect("end");
    pool.submit(id, &lease).expect("submit");
    assert_eq!(pool.reclaim(), 1);

    assert!(matches!(
        pool.buffer(id),
        Err(ExecError::StaleCommandBuffer { .. })
    ));
    assert!(pool.submit(id, &lease).is_err());
}

#[test]
fn test_unsubmitted_buffer_stays_checked_out() {
    let (_device, backend, manager) = setup(CompletionMode::Immediate);
    let lease = manager.lease_queue(0);
    let mut pool = CommandBufferPool::new(backend, 0).expect("pool");

    let pending = pool.begin_command_buffer(false).expect("begin");
    pool.end(pending).expect("end");
    assert_eq!(pool.reclaim(), 0);

    let other = pool.begin_command_buffer(false).expect("second");
    assert_eq!(pool.len(), 2);
    pool.submit(pending, &lease).expect("late submit still valid");
    pool.recycle(other).expect("explicit recycle");
    assert_eq!(pool.available_count(), 1);
}

#[test]
fn test_prewarmed_pool_does_not_allocate() {
    let (device, backend, _manager) = setup(CompletionMode::Immediate);
    let mut pool = CommandBufferPool::with_prewarm(backend, 1, 4).expect("pool");
    assert_eq!(pool.len(), 4);
    assert_eq!(pool.available_count(), 4);

    for _ in 0..4 {
        pool.begin_command_buffer(false).expect("begin");
    }
    assert_eq!(pool.len(), 4);
    assert_eq!(device.live_command_buffers(), 4);
}

#[test]
fn test_allocation_failure_propagates() {
    let (device, backend, _manager) = setup(CompletionMode::Immediate);
    let mut pool = CommandBufferPool::new(backend, 0).expect("pool");
    device.fail_next_allocation();
    let err = pool.begin_command_buffer(false).expect_err("must fail");
    assert!(err.is_fatal());
    assert_eq!(pool.len(), 0);
    assert_eq!(pool.in_use_count(), 0);
}

#[test]
fn test_invalid_family_is_rejected() {
    let (_device, backend, _manager) = setup(CompletionMode::Immediate);
    assert!(matches!(
        CommandBufferPool::new(backend, 9),
        Err(ExecError::InvalidFamilyIndex { index: 9, .. })
    ));
}

#[test]
fn test_wait_for_all_blocks_until_complete() {
    let (device, backend, manager) = setup(CompletionMode::Manual);
    let lease = manager.lease_queue(0);
    let mut pool = CommandBufferPool::new(backend, 0).expect("pool");
    for _ in 0..3 {
        let id = pool.begin_command_buffer(true).expect("begin");
        pool.end(id).expect("end");
        pool.submit(id, &lease).expect("submit");
    }
    assert_eq!(device.pending_submissions(), 3);

    let completer = {
        let device = device.clone();
        thread::spawn(move || {
            while device.pending_submissions() > 0 {
                thread::sleep(Duration::from_millis(5));
                device.complete_next();
            }
        })
    };
    pool.wait_for_all();
    completer.join().expect("completer panicked");
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.available_count(), 3);
}

#[test]
fn test_drop_releases_native_objects() {
    let (device, backend, manager) = setup(CompletionMode::Immediate);
    let lease = manager.lease_queue(0);
    {
        let mut pool = CommandBufferPool::new(backend, 0).expect("pool");
        let id = pool.begin_command_buffer(false).expect("begin");
        pool.end(id).expect("end");
        pool.submit(id, &lease).expect("submit");
        pool.begin_command_buffer(false).expect("second");
        assert_eq!(device.live_command_pools(), 1);
    }
    assert_eq!(device.live_command_pools(), 0);
    assert_eq!(device.live_command_buffers(), 0);
    assert_eq!(device.live_fences(), 0);
}
