//! Integration test: CommandBuffer state machine and fence tracking

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ash::vk;

mod common;

use common::HookedBackend;
use vexel_common::init_test_logging;
use vexel_exec::{
    CommandBuffer, CommandBufferPool, CommandBufferStatus, CompletionMode, DeviceBackend,
    ExecError, HeadlessBackend, QueueLeaseManager,
};

struct Fixture {
    device: Arc<HeadlessBackend>,
    backend: Arc<dyn DeviceBackend>,
    manager: QueueLeaseManager,
    pool: vk::CommandPool,
}

fn fixture(mode: CompletionMode) -> Fixture {
    init_test_logging();
    let device = Arc::new(HeadlessBackend::discrete(mode));
    let backend: Arc<dyn DeviceBackend> = device.clone();
    let manager = QueueLeaseManager::new(backend.clone());
    let pool = backend.create_command_pool(0).expect("command pool");
    Fixture {
        device,
        backend,
        manager,
        pool,
    }
}

impl Fixture {
    fn buffer(&self) -> CommandBuffer {
        CommandBuffer::allocate(self.backend.clone(), self.pool, 0).expect("allocate")
    }
}

fn expect_rejected(result: Result<(), ExecError>, operation: &str, actual: &str) {
    match result {
        Err(ExecError::InvalidStateTransition {
            operation: op,
            actual: act,
            ..
        }) => {
            assert_eq!(op, operation);
            assert_eq!(act, actual);
        }
        other => panic!("expected rejected {}, got {:?}", operation, other),
    }
}

#[test]
fn test_full_cycle_returns_to_ready() {
    let fx = fixture(CompletionMode::Immediate);
    let lease = fx.manager.lease_queue(0);
    let mut cb = fx.buffer();

    for submits in 1..=3 {
        assert_eq!(cb.status(), CommandBufferStatus::Ready);
        cb.begin(false).expect("begin");
        assert_eq!(cb.status(), CommandBufferStatus::Recording);
        cb.end().expect("end");
        for _ in 0..submits {
            cb.submit(&lease).expect("submit");
            assert_eq!(cb.status(), CommandBufferStatus::Recorded);
        }
        cb.wait().expect("wait");
        cb.reset(false).expect("reset");
        assert_eq!(cb.status(), CommandBufferStatus::Ready);
    }
    assert_eq!(fx.device.submissions(), 6);
}

#[test]
fn test_invalid_transitions_are_rejected() {
    let fx = fixture(CompletionMode::Immediate);
    let lease = fx.manager.lease_queue(0);
    let mut cb = fx.buffer();

    expect_rejected(cb.end(), "end", "READY");
    expect_rejected(cb.submit(&lease).map(|_| ()), "submit", "READY");

    cb.begin(false).expect("begin");
    expect_rejected(cb.begin(false), "begin", "RECORDING");
    expect_rejected(cb.submit(&lease).map(|_| ()), "submit", "RECORDING");

    cb.end().expect("end");
    expect_rejected(cb.end(), "end", "RECORDED");
    expect_rejected(cb.begin(false), "begin", "RECORDED");

    // Rejections leave the state untouched.
    assert_eq!(cb.status(), CommandBufferStatus::Recorded);
    cb.submit(&lease).expect("submit after rejections");
}

#[test]
fn test_is_being_used_tracks_fences_and_recycles() {
    let fx = fixture(CompletionMode::Manual);
    let lease = fx.manager.lease_queue(0);
    let mut cb = fx.buffer();

    assert!(!cb.is_being_used());
    cb.begin(false).expect("begin");
    assert!(cb.is_being_used(), "recording counts as in use");
    cb.end().expect("end");
    assert!(!cb.is_being_used());

    cb.submit(&lease).expect("submit 1");
    cb.submit(&lease).expect("submit 2");
    assert_eq!(cb.active_fences(), 2);
    assert!(cb.is_being_used());

    assert!(fx.device.complete_next());
    assert!(cb.is_being_used());
    assert_eq!(cb.active_fences(), 1);
    assert_eq!(cb.free_fences(), 1, "signaled fence recycled by the poll");

    assert!(fx.device.complete_next());
    assert!(!cb.is_being_used());
    assert_eq!(cb.active_fences(), 0);
    assert_eq!(cb.free_fences(), 2);
}

#[test]
fn test_fences_are_reused_across_submissions() {
    let fx = fixture(CompletionMode::Immediate);
    let lease = fx.manager.lease_queue(0);
    let mut cb = fx.buffer();

    for _ in 0..10 {
        cb.begin(true).expect("begin");
        cb.end().expect("end");
        cb.submit(&lease).expect("submit");
        cb.reset(false).expect("reset");
    }
    assert_eq!(fx.device.live_fences(), 1);
    assert_eq!(cb.free_fences(), 1);
}

#[test]
fn test_reset_blocks_until_fences_signal() {
    let fx = fixture(CompletionMode::Manual);
    let lease = fx.manager.lease_queue(0);
    let mut cb = fx.buffer();
    cb.begin(false).expect("begin");
    cb.end().expect("end");
    cb.submit(&lease).expect("submit");

    let completer = {
        let device = fx.device.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            device.complete_all()
        })
    };
    cb.reset(true).expect("reset");
    assert_eq!(cb.status(), CommandBufferStatus::Ready);
    assert_eq!(completer.join().expect("completer panicked"), 1);
}

#[test]
fn test_one_time_buffer_submits_once() {
    let fx = fixture(CompletionMode::Immediate);
    let lease = fx.manager.lease_queue(0);
    let mut cb = fx.buffer();
    cb.begin(true).expect("begin");
    cb.end().expect("end");
    cb.submit(&lease).expect("first submit");
    assert!(matches!(
        cb.submit(&lease),
        Err(ExecError::InvalidStateTransition { operation: "submit", .. })
    ));

    // After a reset the buffer may be recorded for multiple submits.
    cb.reset(false).expect("reset");
    cb.begin(false).expect("begin");
    cb.end().expect("end");
    cb.submit(&lease).expect("submit 1");
    cb.submit(&lease).expect("submit 2");
}

#[test]
fn test_submit_requires_matching_valid_lease() {
    let fx = fixture(CompletionMode::Immediate);
    let mut cb = fx.buffer();
    cb.begin(false).expect("begin");
    cb.end().expect("end");

    let invalid = fx.manager.lease_queue(42);
    assert!(matches!(cb.submit(&invalid), Err(ExecError::InvalidLease)));

    let transfer = fx.manager.lease_queue(2);
    assert!(matches!(
        cb.submit(&transfer),
        Err(ExecError::FamilyMismatch { buffer: 0, queue: 2 })
    ));
    assert_eq!(fx.device.submissions(), 0);
    assert!(cb.awaiting_submit());
}

#[test]
fn test_fence_allocation_failure_propagates() {
    let fx = fixture(CompletionMode::Immediate);
    let lease = fx.manager.lease_queue(0);
    let mut cb = fx.buffer();
    cb.begin(false).expect("begin");
    cb.end().expect("end");

    fx.device.fail_next_allocation();
    let err = cb.submit(&lease).expect_err("fence allocation must fail");
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        ExecError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    ));
    // Nothing was submitted and the buffer can still go out.
    assert_eq!(cb.active_fences(), 0);
    cb.submit(&lease).expect("retry");
}

#[test]
fn test_drop_waits_and_frees_native_objects() {
    let fx = fixture(CompletionMode::Manual);
    let lease = fx.manager.lease_queue(0);
    let mut cb = fx.buffer();
    cb.begin(false).expect("begin");
    cb.end().expect("end");
    cb.submit(&lease).expect("submit");
    assert_eq!(fx.device.live_command_buffers(), 1);
    assert_eq!(fx.device.live_fences(), 1);

    let completer = {
        let device = fx.device.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            device.complete_all();
        })
    };
    drop(cb);
    completer.join().expect("completer panicked");
    assert_eq!(fx.device.live_command_buffers(), 0);
    assert_eq!(fx.device.live_fences(), 0);
}

#[test]
fn test_external_buffer_is_not_freed() {
    let fx = fixture(CompletionMode::Immediate);
    let lease = fx.manager.lease_queue(0);
    let raw = fx
        .backend
        .allocate_command_buffer(fx.pool)
        .expect("caller-owned buffer");

    let mut cb = CommandBuffer::from_external(fx.backend.clone(), raw, 0);
    assert!(cb.is_external());
    cb.begin(false).expect("begin");
    cb.end().expect("end");
    cb.submit(&lease).expect("submit");
    drop(cb);

    assert_eq!(fx.device.live_command_buffers(), 1);
    assert_eq!(fx.device.live_fences(), 0);
    fx.backend.free_command_buffer(fx.pool, raw);
}

fn hooked_device() -> (Arc<HeadlessBackend>, Arc<HookedBackend>, Arc<dyn DeviceBackend>) {
    init_test_logging();
    let device = Arc::new(HeadlessBackend::discrete(CompletionMode::Manual));
    let hooked = Arc::new(HookedBackend::new(device.clone()));
    let backend: Arc<dyn DeviceBackend> = hooked.clone();
    (device, hooked, backend)
}

#[test]
fn test_device_loss_abandons_outstanding_submissions() {
    let (_device, hooked, backend) = hooked_device();
    let manager = QueueLeaseManager::new(backend.clone());
    let lease = manager.lease_queue(0);
    let mut pool = CommandBufferPool::new(backend, 0).expect("pool");

    let id = pool.begin_command_buffer(false).expect("begin");
    pool.end(id).expect("end");
    let mut token = pool.submit(id, &lease).expect("submit");
    assert!(pool.buffer(id).expect("buffer").is_being_used());

    hooked.lose_device();
    {
        let cb = pool.buffer(id).expect("buffer");
        assert!(!cb.is_being_used());
        assert_eq!(cb.active_fences(), 0);
        // Latched: later polls do not query the device again.
        assert!(!cb.is_being_used());
    }
    assert!(token.has_finished());

    match pool.submit(id, &lease) {
        Err(ExecError::DeviceLost) => {}
        other => panic!("expected DeviceLost, got {:?}", other),
    }

    // The lost buffer is recycled, not replaced by a fresh allocation.
    match pool.begin_command_buffer(false) {
        Err(ExecError::DeviceLost) => {}
        other => panic!("expected DeviceLost, got {:?}", other),
    }
    assert_eq!(pool.len(), 1);
}

#[test]
fn test_device_loss_during_wait_is_reported() {
    let (_device, hooked, backend) = hooked_device();
    let manager = QueueLeaseManager::new(backend.clone());
    let lease = manager.lease_queue(0);
    let pool = backend.create_command_pool(0).expect("command pool");
    let mut cb = CommandBuffer::allocate(backend.clone(), pool, 0).expect("allocate");

    cb.begin(false).expect("begin");
    cb.end().expect("end");
    let mut token = cb.submit(&lease).expect("submit");

    hooked.lose_device();
    assert!(matches!(cb.wait(), Err(ExecError::DeviceLost)));
    assert_eq!(cb.active_fences(), 0);
    assert!(token.has_finished());
    cb.wait().expect("nothing left to wait on");
}

#[test]
fn test_failed_teardown_wait_leaks_pending_buffer() {
    let (device, hooked, backend) = hooked_device();
    let manager = QueueLeaseManager::new(backend.clone());
    let lease = manager.lease_queue(0);
    let pool = backend.create_command_pool(0).expect("command pool");
    let mut cb = CommandBuffer::allocate(backend.clone(), pool, 0).expect("allocate");

    cb.begin(false).expect("begin");
    cb.end().expect("end");
    let mut token = cb.submit(&lease).expect("submit");
    assert_eq!(device.live_command_buffers(), 1);
    assert_eq!(device.live_fences(), 1);

    hooked.fail_waits();
    drop(cb);

    // Still possibly executing: nothing was freed and the run is not over.
    assert_eq!(device.live_command_buffers(), 1);
    assert_eq!(device.live_fences(), 1);
    assert!(!token.has_finished());

    device.complete_all();
    assert!(token.has_finished());
}

#[test]
fn test_failed_teardown_wait_leaks_command_pool() {
    let (device, hooked, backend) = hooked_device();
    let manager = QueueLeaseManager::new(backend.clone());
    let lease = manager.lease_queue(0);
    let mut pool = CommandBufferPool::new(backend, 0).expect("pool");

    let id = pool.begin_command_buffer(false).expect("begin");
    pool.end(id).expect("end");
    pool.submit(id, &lease).expect("submit");
    assert_eq!(device.live_command_pools(), 1);

    hooked.fail_waits();
    drop(pool);
    assert_eq!(device.live_command_pools(), 1);
    assert_eq!(device.live_command_buffers(), 1);
}
