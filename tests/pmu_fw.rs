// CLASSIFICATION: COMMUNITY
// Filename: pmu_fw.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

use std::sync::Arc;

use pmu_rtos::hal::sim::{sim_ucode_desc, sim_ucode_image, SimFirmwareStore, SimGpu};
use pmu_rtos::hal::FirmwareSource;
use pmu_rtos::pmu::fw::{PMU_UCODE_DESC, PMU_UCODE_IMAGE, PMU_UCODE_NS, PMU_UCODE_SIG};
use pmu_rtos::pmu::fw_ver::{APP_VERSION_GP10B, APP_VERSION_TU10X, PMU_UCODE_DESC_SIZE};
use pmu_rtos::pmu::{PmuFwState, RtosFw};
use pmu_rtos::util::FencedU32;
use pmu_rtos::{Pmu, PmuConfig, PmuError};
use serial_test::serial;

fn source(store: &Arc<SimFirmwareStore>) -> Arc<dyn FirmwareSource> {
    store.clone()
}

#[test]
#[serial]
fn ns_firmware_splits_descriptor_from_ucode() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = SimFirmwareStore::with_ns_firmware(APP_VERSION_TU10X);
    {
        let mut fw = RtosFw::load(source(&store), false).unwrap();
        assert!(!fw.is_secure());
        assert_eq!(fw.desc().app_version, APP_VERSION_TU10X);
        assert_eq!(fw.desc().descriptor_size as usize, PMU_UCODE_DESC_SIZE);
        assert_eq!(fw.ucode_image(), &sim_ucode_image()[..]);
        assert!(fw.signature().is_none());
        let mem = fw.map_ucode().unwrap();
        // Mapped once, then reused.
        assert!(mem.same_region(&fw.map_ucode().unwrap()));
        assert_eq!(store.outstanding(), 1);
    }
    assert_eq!(store.outstanding(), 0);
}

#[test]
#[serial]
fn missing_ns_firmware_is_not_found() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = SimFirmwareStore::new();
    assert!(matches!(
        RtosFw::load(source(&store), false),
        Err(PmuError::NotFound(_))
    ));
    assert_eq!(store.outstanding(), 0);
}

#[test]
#[serial]
fn ns_segments_outside_the_image_release_the_blob() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = SimFirmwareStore::new();
    let mut desc = sim_ucode_desc(APP_VERSION_TU10X);
    desc.app_resident_data_size = 0x1000;
    let mut blob = desc.to_bytes();
    blob.extend_from_slice(&sim_ucode_image());
    store.insert(PMU_UCODE_NS, blob);
    assert!(matches!(
        RtosFw::load(source(&store), false),
        Err(PmuError::InvalidArgument(_))
    ));
    assert_eq!(store.outstanding(), 0);
}

#[test]
#[serial]
fn secure_load_unwinds_at_every_step() {
    let _ = env_logger::builder().is_test(true).try_init();
    for missing in [PMU_UCODE_IMAGE, PMU_UCODE_DESC, PMU_UCODE_SIG] {
        let store = SimFirmwareStore::with_secure_firmware(APP_VERSION_TU10X);
        store.remove(missing);
        match RtosFw::load(source(&store), true) {
            Err(PmuError::NoEntry(name)) => assert_eq!(name, missing),
            other => panic!("expected NoEntry for {missing}, got {other:?}"),
        }
        assert_eq!(store.outstanding(), 0, "leak after missing {missing}");
    }
}

#[test]
#[serial]
fn unsupported_app_version_releases_all_blobs() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = SimFirmwareStore::with_secure_firmware(0x1234);
    assert!(matches!(
        RtosFw::load(source(&store), true),
        Err(PmuError::InvalidArgument(_))
    ));
    assert_eq!(store.outstanding(), 0);
    assert_eq!(
        store.requested(),
        vec![PMU_UCODE_IMAGE, PMU_UCODE_DESC, PMU_UCODE_SIG]
    );
}

#[test]
#[serial]
fn secure_firmware_keeps_signature_until_dropped() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = SimFirmwareStore::with_secure_firmware(APP_VERSION_GP10B);
    let fw = RtosFw::load(source(&store), true).unwrap();
    assert!(fw.is_secure());
    assert_eq!(fw.signature().map(<[u8]>::len), Some(0x100));
    assert!(!fw.ops().supports_super_surface());
    assert_eq!(store.outstanding(), 3);
    drop(fw);
    assert_eq!(store.outstanding(), 0);
}

#[test]
#[serial]
fn firmware_survives_until_deinit() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = PmuConfig::default();
    let gpu = SimGpu::new(&cfg);
    let pmu = Pmu::new(cfg, gpu.hal()).unwrap();
    assert_eq!(pmu.fw_ops().unwrap_err(), PmuError::NotReady);
    pmu.init_pmu_fw().unwrap();
    pmu.init_pmu_fw().unwrap();
    assert_eq!(gpu.firmware.requested().len(), 1);
    assert!(pmu.is_fw_loaded());
    pmu.fw_deinit();
    pmu.fw_deinit();
    assert!(!pmu.is_fw_loaded());
    assert_eq!(gpu.firmware.outstanding(), 0);
}

#[test]
#[serial]
fn state_changes_and_running_predicate() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = PmuConfig::default();
    let gpu = SimGpu::new(&cfg);
    let pmu = Pmu::new(cfg, gpu.hal()).unwrap();
    assert_eq!(pmu.get_fw_state(), PmuFwState::Off);
    assert!(!pmu.is_running());
    pmu.fw_state_change(PmuFwState::Starting, false);
    assert!(!pmu.is_running());
    pmu.set_fw_ready(true);
    assert!(pmu.is_running());
    pmu.fw_state_change(PmuFwState::Exit, true);
    assert!(!pmu.is_running());
}

#[test]
#[serial]
fn waits_time_out_unless_shutting_down() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = PmuConfig::default();
    let gpu = SimGpu::new(&cfg);
    let pmu = Pmu::new(cfg, gpu.hal()).unwrap();
    let var = FencedU32::new(0);
    assert_eq!(pmu.wait_message_cond(20, &var, 5).unwrap_err(), PmuError::TimedOut);
    assert_eq!(pmu.wait_fw_ready(20).unwrap_err(), PmuError::TimedOut);

    gpu.platform.begin_shutdown();
    pmu.wait_message_cond(u64::MAX, &var, 5).unwrap();
    assert_eq!(var.observe(), 5);
    pmu.wait_fw_ready(u64::MAX).unwrap();
    assert!(pmu.get_fw_ready());
}
