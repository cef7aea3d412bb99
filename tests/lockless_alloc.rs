// CLASSIFICATION: COMMUNITY
// Filename: lockless_alloc.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use pmu_rtos::mm::LocklessAllocator;
use pmu_rtos::PmuError;
use rand::Rng;
use serial_test::serial;

fn pool(base: u64, length: u64, blk: u64) -> LocklessAllocator {
    let _ = env_logger::builder().is_test(true).try_init();
    LocklessAllocator::init("test", base, length, blk, 0).unwrap()
}

#[test]
#[serial]
fn hands_out_blocks_in_address_order_then_lifo() {
    let a = pool(0x1000, 4096, 256);
    assert_eq!(a.node_count(), 16);
    assert_eq!(a.alloc(256), 0x1000);
    assert_eq!(a.alloc(256), 0x1100);
    let third = a.alloc(256);
    assert_eq!(third, 0x1200);
    a.free(0x1100);
    // Last freed is first reused.
    assert_eq!(a.alloc(256), 0x1100);
    assert_eq!(a.alloc(256), 0x1300);
    assert_eq!(a.alloc_count(), 4);
}

#[test]
#[serial]
fn wrong_length_and_exhaustion_return_zero() {
    let a = pool(0x1000, 1024, 256);
    assert_eq!(a.alloc(128), 0);
    assert_eq!(a.alloc(512), 0);
    let blocks: Vec<u64> = (0..4).map(|_| a.alloc(256)).collect();
    assert!(blocks.iter().all(|&b| b != 0));
    assert_eq!(a.head(), -1);
    assert_eq!(a.alloc(256), 0);
    for b in blocks {
        a.free(b);
    }
    assert_eq!(a.alloc_count(), 0);
    assert_ne!(a.alloc(256), 0);
}

#[test]
#[serial]
fn length_is_rounded_down_to_whole_blocks() {
    let a = pool(0x2000, 1000, 256);
    assert_eq!(a.node_count(), 3);
    assert_eq!(a.length(), 768);
    assert_eq!(a.end(), 0x2000 + 768);
}

#[test]
#[serial]
fn init_rejects_degenerate_ranges() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert!(matches!(
        LocklessAllocator::init("zero-blk", 0x1000, 4096, 0, 0),
        Err(PmuError::InvalidArgument(_))
    ));
    assert!(matches!(
        LocklessAllocator::init("zero-base", 0, 4096, 256, 0),
        Err(PmuError::InvalidArgument(_))
    ));
    assert!(matches!(
        LocklessAllocator::init("short", 0x1000, 255, 256, 0),
        Err(PmuError::InvalidArgument(_))
    ));
}

#[test]
#[serial]
fn init_rejects_ranges_past_the_top_of_memory() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert!(matches!(
        LocklessAllocator::init("wrap", u64::MAX - 0x100, 4096, 256, 0),
        Err(PmuError::InvalidArgument(_))
    ));

    // A range ending exactly at u64::MAX is still usable.
    let top = pool(u64::MAX - 0x200, 0x200, 0x100);
    assert_eq!(top.end(), u64::MAX);
    let a = top.alloc(0x100);
    let b = top.alloc(0x100);
    assert_eq!(a, u64::MAX - 0x200);
    assert_eq!(b, u64::MAX - 0x100);
    assert_eq!(top.alloc(0x100), 0);
    top.free(b);
    top.free(a);
    assert_eq!(top.alloc_count(), 0);
}

#[test]
#[serial]
fn foreign_frees_are_ignored() {
    let a = pool(0x1000, 4096, 256);
    let b = a.alloc(256);
    a.free(0x10);
    a.free(0x1000 + 4096);
    a.free(b + 1);
    assert_eq!(a.alloc_count(), 1);
    a.free(b);
    assert_eq!(a.alloc_count(), 0);
}

#[test]
#[serial]
fn concurrent_alloc_free_never_hands_out_a_block_twice() {
    let a = Arc::new(pool(0x10_0000, 64 * 64, 64));
    let live = Arc::new(Mutex::new(HashSet::new()));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let a = Arc::clone(&a);
            let live = Arc::clone(&live);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut held = Vec::new();
                for _ in 0..2000 {
                    if held.is_empty() || rng.gen_bool(0.55) {
                        let addr = a.alloc(64);
                        if addr != 0 {
                            assert!(live.lock().unwrap().insert(addr), "{addr:#x} handed out twice");
                            held.push(addr);
                        }
                    } else {
                        let i = rng.gen_range(0..held.len());
                        let addr = held.swap_remove(i);
                        assert!(live.lock().unwrap().remove(&addr));
                        a.free(addr);
                    }
                }
                for addr in held {
                    assert!(live.lock().unwrap().remove(&addr));
                    a.free(addr);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(a.alloc_count(), 0);
    // Every block is back on the free list exactly once.
    let mut seen = HashSet::new();
    for _ in 0..a.node_count() {
        let addr = a.alloc(64);
        assert_ne!(addr, 0);
        assert!(seen.insert(addr));
    }
    assert_eq!(a.alloc(64), 0);
}

#[test]
#[serial]
fn destroy_with_blocks_outstanding_still_completes() {
    let a = pool(0x1000, 4096, 256);
    let _ = a.alloc(256);
    let stats = a.stats();
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.nodes, 16);
    a.destroy();
}
