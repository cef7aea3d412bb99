// CLASSIFICATION: COMMUNITY
// Filename: pmu_seq.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use pmu_rtos::pmu::msg::{CtrlFlags, PmuMsg};
use pmu_rtos::pmu::seq::{SeqState, SequenceTable, PMU_MAX_NUM_SEQUENCES};
use pmu_rtos::PmuError;
use serial_test::serial;

#[test]
#[serial]
fn lowest_free_id_is_handed_out_until_exhausted() {
    let _ = env_logger::builder().is_test(true).try_init();
    let table = SequenceTable::alloc(3).unwrap();
    let a = table.acquire(None).unwrap();
    let b = table.acquire(None).unwrap();
    let c = table.acquire(None).unwrap();
    assert_eq!((a.id(), b.id(), c.id()), (0, 1, 2));
    assert_eq!(table.acquire(None).unwrap_err(), PmuError::Busy);

    drop(b);
    let again = table.acquire(None).unwrap();
    assert_eq!(again.id(), 1);
    assert_eq!(again.state(), SeqState::Pending);
    assert_eq!(table.in_use(), 3);
    a.release();
    c.release();
    drop(again);
    assert_eq!(table.in_use(), 0);
}

#[test]
#[serial]
fn capacity_is_bounded() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert!(matches!(
        SequenceTable::alloc(0),
        Err(PmuError::InvalidArgument(_))
    ));
    assert!(matches!(
        SequenceTable::alloc(PMU_MAX_NUM_SEQUENCES + 1),
        Err(PmuError::InvalidArgument(_))
    ));
    let full = SequenceTable::alloc(PMU_MAX_NUM_SEQUENCES).unwrap();
    let held: Vec<_> = (0..PMU_MAX_NUM_SEQUENCES)
        .map(|_| full.acquire(None).unwrap())
        .collect();
    assert_eq!(held.last().unwrap().id(), 255);
    assert_eq!(full.acquire(None).unwrap_err(), PmuError::Busy);
}

#[test]
#[serial]
fn release_clears_payload_and_callback() {
    let _ = env_logger::builder().is_test(true).try_init();
    let table = SequenceTable::alloc(1).unwrap();
    let seq = table.acquire(Some(Box::new(|_, _| {}))).unwrap();
    seq.set_fbq_element_index(5);
    seq.set_buffer_size_used(64);
    seq.set_out_payload(Some(Arc::new(Mutex::new(vec![0; 4]))));
    assert!(seq.has_callback());
    drop(seq);

    let seq = table.acquire(None).unwrap();
    assert_eq!(seq.id(), 0);
    assert!(!seq.has_callback());
    assert_eq!(seq.fbq_element_index(), 0);
    assert_eq!(seq.buffer_size_used(), 0);
    assert!(seq.out_payload().is_none());
}

#[test]
#[serial]
fn reply_path_reclaims_exactly_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let table = SequenceTable::alloc(4).unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&calls);
    let seq = table
        .acquire(Some(Box::new(move |msg, err| {
            log.lock().unwrap().push((msg.hdr.seq_id, err));
        })))
        .unwrap();
    let id = seq.into_inflight();
    assert_eq!(table.state_of(id), Some(SeqState::Used));
    assert_eq!(table.in_use(), 1);

    let back = table.take_inflight(id).unwrap();
    assert!(table.take_inflight(id).is_none());
    let msg = PmuMsg::new(0x05, id, CtrlFlags::empty(), vec![]).unwrap();
    back.callback(&msg, 0);
    back.callback(&msg, -1);
    drop(back);
    assert_eq!(*calls.lock().unwrap(), vec![(id, 0)]);
    // Nothing is in flight now, so cancelling finds nothing.
    assert_eq!(table.cancel_inflight(-19), 0);
    assert_eq!(table.in_use(), 0);
}

#[test]
#[serial]
fn concurrent_acquire_never_shares_a_slot() {
    let _ = env_logger::builder().is_test(true).try_init();
    let table = SequenceTable::alloc(64).unwrap();
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for _ in 0..500 {
                    let seq = table.acquire(None).unwrap();
                    assert!(seen.lock().unwrap().insert(seq.id()));
                    assert!(seen.lock().unwrap().remove(&seq.id()));
                    drop(seq);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(table.in_use(), 0);
}

#[test]
#[serial]
fn init_resets_every_slot() {
    let _ = env_logger::builder().is_test(true).try_init();
    let table = SequenceTable::alloc(8).unwrap();
    let ids: Vec<u8> = (0..3)
        .map(|_| table.acquire(None).unwrap().into_inflight())
        .collect();
    assert_eq!(table.in_use(), 3);
    table.init();
    assert_eq!(table.in_use(), 0);
    for id in ids {
        assert_eq!(table.state_of(id), Some(SeqState::Free));
        assert!(table.take_inflight(id).is_none());
    }
}
