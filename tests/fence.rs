// CLASSIFICATION: COMMUNITY
// Filename: fence.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pmu_rtos::fence::{
    Fence, FenceKind, FencePool, OsFence, OsFenceOps, Semaphore, WaitQueue, SYNCPT_INVALID,
};
use pmu_rtos::hal::sim::{SimPlatform, SimSyncpoints};
use pmu_rtos::PmuError;
use serial_test::serial;

/// Counts live OS fence references.
#[derive(Default)]
struct CountingOsFence {
    refs: AtomicI32,
}

impl CountingOsFence {
    fn adopt() -> (Arc<Self>, OsFence) {
        let ops = Arc::new(Self {
            refs: AtomicI32::new(1),
        });
        let handle = OsFence::new(ops.clone());
        (ops, handle)
    }

    fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }
}

impl OsFenceOps for CountingOsFence {
    fn dup(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn drop_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
#[serial]
fn three_gets_four_puts_tears_down_once() {
    init_logging();
    let (os, handle) = CountingOsFence::adopt();
    let fence = Fence::from_semaphore(Semaphore::new(1), WaitQueue::new(), handle);
    let refs: Vec<Fence> = (0..3).map(|_| fence.get()).collect();
    assert_eq!(fence.refcount(), 4);
    for r in refs {
        r.put();
        assert_eq!(os.refs(), 1);
    }
    assert_eq!(fence.refcount(), 1);
    fence.put();
    assert_eq!(os.refs(), 0);
}

#[test]
#[serial]
fn semaphore_fence_wakes_on_release() {
    init_logging();
    let platform = SimPlatform::new();
    let sema = Semaphore::new(7);
    let wq = WaitQueue::new();
    let fence = Fence::from_semaphore(Arc::clone(&sema), Arc::clone(&wq), OsFence::none());
    assert_eq!(fence.kind(), FenceKind::Semaphore);
    assert!(!fence.is_expired());

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        sema.release();
        wq.wake_all();
    });
    fence.wait(platform.as_ref(), 2000).unwrap();
    releaser.join().unwrap();
    assert!(fence.is_expired());
}

#[test]
#[serial]
fn semaphore_fence_times_out_on_silicon_only() {
    init_logging();
    let platform = SimPlatform::new();
    let sema = Semaphore::new(3);
    let wq = WaitQueue::new();
    let fence = Fence::from_semaphore(Arc::clone(&sema), Arc::clone(&wq), OsFence::none());
    assert_eq!(fence.wait(platform.as_ref(), 10).unwrap_err(), PmuError::TimedOut);

    // Emulation ignores the deadline and waits for the release.
    platform.set_silicon(false);
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        sema.release();
        wq.wake_all();
    });
    fence.wait(platform.as_ref(), 1).unwrap();
    releaser.join().unwrap();
}

#[test]
#[serial]
fn syncpoint_fence_rechecks_after_a_dropped_notification() {
    init_logging();
    let platform = SimPlatform::new();
    let sp = SimSyncpoints::new();
    let fence = Fence::from_syncpoint(sp.clone(), 4, 2, OsFence::none());
    sp.incr(4);
    assert!(!fence.is_expired());
    sp.incr_unnotified(4);
    // The cached value still says 1; the forced read finds 2.
    fence.wait(platform.as_ref(), 10).unwrap();
    assert!(fence.is_expired());
}

#[test]
#[serial]
fn syncpoint_fence_wakes_on_increment() {
    init_logging();
    let platform = SimPlatform::new();
    let sp = SimSyncpoints::new();
    let fence = Fence::from_syncpoint(sp.clone(), 1, 3, OsFence::none());
    let incr = {
        let sp = sp.clone();
        thread::spawn(move || {
            for _ in 0..3 {
                thread::sleep(Duration::from_millis(5));
                sp.incr(1);
            }
        })
    };
    fence.wait(platform.as_ref(), 2000).unwrap();
    incr.join().unwrap();
    assert_eq!(sp.value(1), 3);
}

#[test]
#[serial]
fn failed_syncpoint_read_counts_as_expired() {
    init_logging();
    let sp = SimSyncpoints::new();
    let fence = Fence::from_syncpoint(sp.clone(), 9, 100, OsFence::none());
    assert!(!fence.is_expired());
    sp.set_fail_reads(true);
    assert!(fence.is_expired());
}

#[test]
#[serial]
fn user_copy_duplicates_the_os_fence() {
    init_logging();
    let sp = SimSyncpoints::new();
    let (os, handle) = CountingOsFence::adopt();
    let fence = Fence::from_syncpoint(sp, 12, 40, handle);
    let user = fence.extract_user();
    assert_eq!((user.syncpt_id, user.syncpt_value), (12, 40));
    assert_eq!(os.refs(), 2);
    drop(fence);
    assert_eq!(os.refs(), 1);
    drop(user);
    assert_eq!(os.refs(), 0);

    let sema_fence = Fence::from_semaphore(Semaphore::new(1), WaitQueue::new(), OsFence::none());
    let user = sema_fence.extract_user();
    assert_eq!(user.syncpt_id, SYNCPT_INVALID);
    assert!(!user.os_fence.is_valid());
}

#[test]
#[serial]
fn pooled_fences_return_their_slot_on_teardown() {
    init_logging();
    let pool = FencePool::new(2).unwrap();
    let sp = SimSyncpoints::new();
    let a = pool
        .fence_from_syncpoint(sp.clone(), 0, 1, OsFence::none())
        .unwrap();
    let b = pool
        .fence_from_semaphore(Semaphore::new(1), WaitQueue::new(), OsFence::none())
        .unwrap();
    assert!(a.is_pooled() && b.is_pooled());
    assert_eq!(pool.in_use(), 2);
    assert_eq!(
        pool.fence_from_syncpoint(sp, 0, 1, OsFence::none()).unwrap_err(),
        PmuError::OutOfMemory
    );
    let extra = a.get();
    drop(a);
    assert_eq!(pool.in_use(), 2);
    drop(extra);
    assert_eq!(pool.in_use(), 1);
    drop(b);
    assert_eq!(pool.in_use(), 0);
}
