// CLASSIFICATION: COMMUNITY
// Filename: rtos_bringup.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

use std::sync::{Arc, Mutex};

use pmu_rtos::hal::sim::{sim_ucode_image, SimFirmwareStore, SimGpu, SIM_UCODE_ENTRY};
use pmu_rtos::hal::RegisterIo;
use pmu_rtos::pmu::fw_ver::APP_VERSION_GP10B;
use pmu_rtos::pmu::lsfm::{FALCON_ID_FECS, FALCON_ID_GPCCS, FALCON_ID_INVALID};
use pmu_rtos::pmu::mutex::pwr_pmu_mutex_r;
use pmu_rtos::pmu::{mutex_id, PmuCallback, PmuCmd, PmuFwState, PmuMsg, QueueId};
use pmu_rtos::{Pmu, PmuConfig, PmuError};
use serial_test::serial;

fn start(cfg: PmuConfig) -> (SimGpu, Pmu) {
    let _ = env_logger::builder().is_test(true).try_init();
    let gpu = SimGpu::new(&cfg);
    let pmu = Pmu::new(cfg, gpu.hal()).unwrap();
    (gpu, pmu)
}

fn boot(cfg: PmuConfig) -> (SimGpu, Pmu) {
    let (gpu, pmu) = start(cfg);
    pmu.rtos_early_init().unwrap();
    pmu.rtos_init().unwrap();
    pmu.wait_fw_ready(2000).unwrap();
    (gpu, pmu)
}

fn secure() -> PmuConfig {
    PmuConfig {
        secure_boot: true,
        ..PmuConfig::default()
    }
}

#[test]
#[serial]
fn ns_boot_loads_ucode_and_reaches_ready() {
    let (gpu, pmu) = boot(PmuConfig::default());
    let stats = gpu.falcon.stats();
    assert_eq!(stats.boots, 1);
    assert_eq!(stats.secure_starts, 0);
    assert_eq!(stats.boot_vector, SIM_UCODE_ENTRY);
    assert_eq!(stats.imem_bytes as usize, sim_ucode_image().len() / 2);

    let mut code = [0u8; 16];
    gpu.falcon.read_imem(0, &mut code).unwrap();
    assert_eq!(code, [0xC0; 16]);

    assert!(pmu.is_pmu_ready());
    assert!(pmu.is_sw_ready());
    assert!(pmu.is_running());
    assert_eq!(pmu.get_fw_state(), PmuFwState::InitReceived);
    assert!(!pmu.queues().unwrap().is_fb_mode());
    // Software managed DMEM area, 256-byte blocks.
    let dmem = pmu.dmem_allocator().unwrap();
    assert_eq!(dmem.block_size(), 256);
    assert_eq!(dmem.node_count(), 0x8000 / 256);
}

#[test]
#[serial]
fn secure_boot_starts_without_loading_imem() {
    let (gpu, pmu) = boot(secure());
    let stats = gpu.falcon.stats();
    assert_eq!(stats.secure_starts, 1);
    assert_eq!(stats.imem_bytes, 0);
    assert_eq!(stats.sec2_bootstraps, 0);
    assert_eq!(stats.halt_clears, 1);
    assert_eq!(stats.aperture_setups, 1);
    assert!(pmu.is_running());
    assert_eq!(gpu.firmware.outstanding(), 3);
}

#[test]
#[serial]
fn sec2_bootstrap_precedes_secure_start() {
    let (gpu, pmu) = boot(PmuConfig {
        sec2_rtos: true,
        ..secure()
    });
    let stats = gpu.falcon.stats();
    assert_eq!(stats.sec2_bootstraps, 1);
    assert_eq!(stats.secure_starts, 1);
    assert!(pmu.is_running());
}

#[test]
#[serial]
fn sec2_without_secure_boot_is_a_config_error() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = PmuConfig {
        sec2_rtos: true,
        ..PmuConfig::default()
    };
    let gpu = SimGpu::new(&cfg);
    assert!(matches!(Pmu::new(cfg, gpu.hal()), Err(PmuError::Config(_))));
}

#[test]
#[serial]
fn super_surface_boot_uses_fb_queues() {
    let (gpu, pmu) = boot(PmuConfig {
        super_surface: true,
        ..PmuConfig::default()
    });
    assert!(gpu.falcon.has_super_surface());
    assert!(pmu.super_surface().is_some());
    assert!(pmu.queues().unwrap().is_fb_mode());
    assert!(pmu.is_running());

    pmu.remove_support();
    assert!(!gpu.falcon.has_super_surface());
    assert!(pmu.super_surface().is_none());
}

#[test]
#[serial]
fn silent_rtos_times_out_waiting_for_ready() {
    let (gpu, pmu) = start(PmuConfig::default());
    gpu.falcon.set_silent_boot(true);
    pmu.rtos_early_init().unwrap();
    pmu.rtos_init().unwrap();
    assert_eq!(pmu.wait_fw_ready(30), Err(PmuError::TimedOut));
    assert_eq!(pmu.get_fw_state(), PmuFwState::Starting);
    assert!(!pmu.is_running());
    assert!(!pmu.is_pmu_ready());
}

#[test]
#[serial]
fn shutdown_forces_pending_waits() {
    let (gpu, pmu) = start(PmuConfig::default());
    gpu.falcon.set_silent_boot(true);
    pmu.rtos_early_init().unwrap();
    pmu.rtos_init().unwrap();
    gpu.platform.begin_shutdown();
    pmu.wait_fw_ready(u64::MAX).unwrap();
    assert!(pmu.get_fw_ready());
}

#[test]
#[serial]
fn early_init_unwinds_when_firmware_lacks_super_surface() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = SimFirmwareStore::with_ns_firmware(APP_VERSION_GP10B);
    let gpu = SimGpu::with_firmware(store);
    let cfg = PmuConfig {
        super_surface: true,
        ..PmuConfig::default()
    };
    let pmu = Pmu::new(cfg, gpu.hal()).unwrap();
    assert!(matches!(
        pmu.rtos_early_init(),
        Err(PmuError::InvalidArgument(_))
    ));
    assert_eq!(gpu.firmware.outstanding(), 0);
    assert!(!pmu.is_fw_loaded());
    assert!(pmu.sequences().is_err());
    assert!(pmu.lsfm().is_err());
    assert!(pmu.pg().is_none());
    assert!(pmu.super_surface().is_none());
}

#[test]
#[serial]
fn without_ls_pmu_nothing_is_touched() {
    let (gpu, pmu) = start(PmuConfig {
        support_ls_pmu: false,
        ..PmuConfig::default()
    });
    pmu.rtos_early_init().unwrap();
    pmu.rtos_init().unwrap();
    assert!(gpu.firmware.requested().is_empty());
    assert_eq!(gpu.falcon.stats().resets, 0);
    let lock = pmu.lock_acquire(mutex_id::PG).unwrap();
    assert!(!lock.is_held());
    assert_eq!(gpu.regs.tokens_outstanding(), 0);
}

#[test]
#[serial]
fn lock_acquire_needs_power_gating_set_up() {
    let (gpu, pmu) = start(PmuConfig::default());
    pmu.rtos_early_init().unwrap();
    assert!(matches!(
        pmu.lock_acquire(mutex_id::PG),
        Err(PmuError::InvalidArgument(_))
    ));

    pmu.rtos_init().unwrap();
    pmu.wait_fw_ready(2000).unwrap();
    {
        let lock = pmu.lock_acquire(mutex_id::PG).unwrap();
        assert!(lock.is_held());
        assert_eq!(gpu.regs.read32(pwr_pmu_mutex_r(mutex_id::PG)), lock.token());
        assert_eq!(gpu.regs.tokens_outstanding(), 1);
    }
    assert_eq!(gpu.regs.tokens_outstanding(), 0);
    assert_eq!(gpu.regs.read32(pwr_pmu_mutex_r(mutex_id::PG)), 0);
}

#[test]
#[serial]
fn lock_is_a_no_op_without_elpg() {
    let (gpu, pmu) = boot(PmuConfig {
        can_elpg: false,
        ..PmuConfig::default()
    });
    assert!(pmu.pg().is_none());
    let lock = pmu.lock_acquire(mutex_id::GR).unwrap();
    assert!(!lock.is_held());
    assert_eq!(lock.id(), mutex_id::GR);
    assert_eq!(gpu.regs.tokens_outstanding(), 0);
}

#[test]
#[serial]
fn firmware_held_mutex_reports_busy() {
    let (gpu, pmu) = boot(PmuConfig {
        mutex_retries: 3,
        ..PmuConfig::default()
    });
    gpu.regs.hold_mutex_for_firmware(mutex_id::CLK, 0x42);
    assert_eq!(pmu.lock_acquire(mutex_id::CLK).unwrap_err(), PmuError::Busy);
    gpu.regs.hold_mutex_for_firmware(mutex_id::CLK, 0);
    assert!(pmu.lock_acquire(mutex_id::CLK).unwrap().is_held());
}

#[test]
#[serial]
fn lsfm_bootstraps_falcons_after_one_wpr_init() {
    let (gpu, pmu) = boot(secure());
    let lsfm = pmu.lsfm().unwrap();
    assert_eq!(lsfm.wpr_init_done().observe(), 0);

    pmu.lsfm_bootstrap_ls_falcon(FALCON_ID_FECS).unwrap();
    assert_eq!(lsfm.wpr_init_done().observe(), 1);
    assert_eq!(lsfm.loaded_falcon_id().observe(), FALCON_ID_FECS);

    pmu.lsfm_bootstrap_ls_falcon(FALCON_ID_GPCCS).unwrap();
    assert_eq!(lsfm.loaded_falcon_id().observe(), FALCON_ID_GPCCS);
    assert_eq!(
        gpu.falcon.bootstrapped_falcons(),
        vec![FALCON_ID_FECS, FALCON_ID_GPCCS]
    );
    // WPR init, then one bootstrap per falcon.
    assert_eq!(gpu.falcon.stats().rpcs, 3);
}

#[test]
#[serial]
fn lsfm_bootstrap_times_out_when_rtos_is_mute() {
    let (gpu, pmu) = boot(PmuConfig {
        cmd_timeout_ms: 30,
        ..secure()
    });
    gpu.falcon.set_drop_replies(true);
    assert_eq!(
        pmu.lsfm_bootstrap_ls_falcon(FALCON_ID_FECS),
        Err(PmuError::TimedOut)
    );
    assert_eq!(pmu.lsfm().unwrap().wpr_init_done().observe(), 0);
}

#[test]
#[serial]
fn destroy_and_reboot_reuses_loaded_firmware() {
    let (gpu, pmu) = boot(PmuConfig::default());
    pmu.lsfm_bootstrap_ls_falcon(FALCON_ID_FECS).unwrap();

    pmu.destroy();
    assert_eq!(pmu.get_fw_state(), PmuFwState::Off);
    assert!(!pmu.is_running());
    assert!(!pmu.is_pmu_ready());
    assert!(pmu.queues().is_err());
    assert!(!pmu.pg().unwrap().is_initialized());
    let lsfm = pmu.lsfm().unwrap();
    assert_eq!(lsfm.wpr_init_done().observe(), 0);
    assert_eq!(lsfm.loaded_falcon_id().observe(), FALCON_ID_INVALID);

    pmu.rtos_init().unwrap();
    pmu.wait_fw_ready(2000).unwrap();
    assert!(pmu.is_running());
    assert_eq!(gpu.firmware.requested().len(), 1);
    assert_eq!(gpu.falcon.stats().boots, 2);

    // The reset RTOS needs its WPR region set up again.
    pmu.lsfm_bootstrap_ls_falcon(FALCON_ID_FECS).unwrap();
    assert_eq!(gpu.falcon.stats().rpcs, 4);
}

#[test]
#[serial]
fn rtos_reinit_completes_commands_left_in_flight() {
    let (gpu, pmu) = boot(PmuConfig::default());
    gpu.falcon.set_drop_replies(true);
    let errs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errs);
    let cb: PmuCallback = Box::new(move |_: &PmuMsg, err: i32| sink.lock().unwrap().push(err));
    let cmd = PmuCmd::new(0x05, vec![1; 4]).unwrap();
    pmu.cmd_post(cmd, None, QueueId::Lpq, Some(cb)).unwrap();
    assert_eq!(pmu.sequences().unwrap().in_use(), 1);

    // Boot again without a destroy in between.
    pmu.rtos_init().unwrap();
    assert_eq!(*errs.lock().unwrap(), vec![PmuError::NotReady.errno()]);
    assert_eq!(pmu.sequences().unwrap().in_use(), 0);
}

#[test]
#[serial]
fn shutdown_marks_power_gating_for_destroy() {
    let (_gpu, pmu) = boot(PmuConfig::default());
    let pg = pmu.pg().unwrap();
    let seen = pg.generation();
    assert!(!pg.state_destroy());

    pmu.shutdown();
    assert_eq!(pmu.get_fw_state(), PmuFwState::Exit);
    assert!(pg.state_destroy());
    assert!(pg.generation() > seen);
    assert!(!pmu.is_running());
}

#[test]
#[serial]
fn remove_support_releases_everything() {
    let (gpu, pmu) = boot(secure());
    assert_eq!(gpu.firmware.outstanding(), 3);

    pmu.remove_support();
    assert_eq!(gpu.firmware.outstanding(), 0);
    assert!(!pmu.is_fw_loaded());
    assert!(!pmu.is_sw_ready());
    assert!(pmu.sequences().is_err());
    assert!(pmu.lsfm().is_err());
    assert!(pmu.pg().is_none());
    assert_eq!(pmu.get_fw_state(), PmuFwState::Off);
    assert_eq!(pmu.fw_ops().unwrap_err(), PmuError::NotReady);
}
