// CLASSIFICATION: COMMUNITY
// Filename: device_table.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use pmu_rtos::device::{
    Device, DeviceList, Devices, DEVTYPE_COPY0, DEVTYPE_GRAPHICS, DEVTYPE_LCE, MAX_DEVTYPE,
};
use pmu_rtos::hal::sim::SimDeviceTable;
use pmu_rtos::hal::DeviceTableParser;
use pmu_rtos::PmuError;
use serial_test::serial;

fn lce(inst_id: u32, engine_id: u32) -> Device {
    Device {
        dev_type: DEVTYPE_LCE,
        inst_id,
        engine_id,
        ..Device::default()
    }
}

#[test]
#[serial]
fn instances_follow_table_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut table = SimDeviceTable::new(vec![lce(0, 5), lce(1, 6), lce(2, 7)]);
    let list = DeviceList::build(&mut table).unwrap();
    assert_eq!(list.count(DEVTYPE_LCE), 3);
    assert_eq!(list.get(DEVTYPE_LCE, 1).unwrap().engine_id, 6);
    assert_eq!(list.get(DEVTYPE_LCE, 2).unwrap().engine_id, 7);
    assert!(matches!(list.get(DEVTYPE_LCE, 3), Err(PmuError::NotFound(_))));
    let engines: Vec<u32> = list.iter_type(DEVTYPE_LCE).map(|d| d.engine_id).collect();
    assert_eq!(engines, vec![5, 6, 7]);
}

#[test]
#[serial]
fn out_of_range_type_is_invalid() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut table = SimDeviceTable::typical();
    let list = DeviceList::build(&mut table).unwrap();
    assert!(matches!(
        list.get(MAX_DEVTYPE, 0),
        Err(PmuError::InvalidArgument(_))
    ));
    assert_eq!(list.count(MAX_DEVTYPE + 3), 0);
    assert_eq!(list.iter_type(MAX_DEVTYPE).count(), 0);
}

#[test]
#[serial]
fn table_with_bad_type_fails_to_build() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bad = Device {
        dev_type: MAX_DEVTYPE,
        ..Device::default()
    };
    let mut table = SimDeviceTable::new(vec![lce(0, 1), bad]);
    assert!(matches!(
        DeviceList::build(&mut table),
        Err(PmuError::InvalidArgument(_))
    ));
}

#[test]
#[serial]
fn devices_init_is_idempotent_and_cleanup_drops_the_table() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut devices = Devices::new();
    assert_eq!(devices.get(DEVTYPE_GRAPHICS, 0).unwrap_err(), PmuError::NotReady);

    devices.init(&mut SimDeviceTable::typical()).unwrap();
    assert!(devices.is_initialized());
    assert!(devices.get(DEVTYPE_GRAPHICS, 0).unwrap().is_graphics_engine());
    assert!(devices.get(DEVTYPE_COPY0, 0).unwrap().is_copy_engine());
    assert_eq!(devices.count(DEVTYPE_LCE), 2);

    // A second init keeps the first table.
    devices.init(&mut SimDeviceTable::new(vec![lce(0, 9)])).unwrap();
    assert_eq!(devices.count(DEVTYPE_LCE), 2);

    devices.cleanup();
    assert!(!devices.is_initialized());
    assert_eq!(devices.count(DEVTYPE_LCE), 0);
}

#[test]
#[serial]
fn empty_table_builds_an_empty_list() {
    let _ = env_logger::builder().is_test(true).try_init();
    let list = DeviceList::build(&mut SimDeviceTable::default()).unwrap();
    assert!((0..MAX_DEVTYPE).all(|t| list.count(t) == 0));
}

/// Counts how many times a table walk starts.
struct CountingTable {
    inner: SimDeviceTable,
    walks: Arc<AtomicUsize>,
}

impl DeviceTableParser for CountingTable {
    fn parse_next_device(&mut self, cursor: &mut u32) -> Option<Device> {
        if *cursor == 0 {
            self.walks.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.parse_next_device(cursor)
    }
}

#[test]
#[serial]
fn racing_inits_parse_the_table_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let devices = Arc::new(Devices::new());
    let walks = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(8));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let devices = Arc::clone(&devices);
            let walks = Arc::clone(&walks);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let mut table = CountingTable {
                    inner: SimDeviceTable::typical(),
                    walks,
                };
                start.wait();
                devices.init(&mut table).unwrap();
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(walks.load(Ordering::SeqCst), 1);
    assert_eq!(devices.count(DEVTYPE_LCE), 2);
}

#[test]
#[serial]
fn failed_init_can_be_retried() {
    let _ = env_logger::builder().is_test(true).try_init();
    let devices = Devices::new();
    let bad = Device {
        dev_type: MAX_DEVTYPE,
        ..Device::default()
    };
    assert!(devices.init(&mut SimDeviceTable::new(vec![bad])).is_err());
    assert!(!devices.is_initialized());
    devices.init(&mut SimDeviceTable::new(vec![lce(0, 3)])).unwrap();
    assert_eq!(devices.count(DEVTYPE_LCE), 1);
}
