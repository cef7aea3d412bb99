// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! In-process implementations of every HAL trait.
//!
//! Tests and `pmuctl` bring the PMU runtime up against these instead of a
//! GPU. [`SimGpu`] wires a full set together for a given [`PmuConfig`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::config::PmuConfig;
use crate::device::{Device, DEVTYPE_COPY0, DEVTYPE_COPY1, DEVTYPE_GRAPHICS, DEVTYPE_LCE};
use crate::error::{PmuError, PmuResult};
use crate::fence::syncpt::{syncpt_reached, SyncpointDevice};
use crate::hal::{DeviceTableParser, FalconHal, FirmwareBlob, FirmwareSource, Platform, RegisterIo};
use crate::pmu::fw::{PMU_UCODE_DESC, PMU_UCODE_IMAGE, PMU_UCODE_NS, PMU_UCODE_SIG};
use crate::pmu::fw_ver::{PmuUcodeDesc, APP_VERSION_TU10X, PMU_UCODE_DESC_SIZE};
use crate::pmu::mutex::{
    pwr_pmu_mutex_r, MUTEX_ID_NOT_AVAILABLE, PMU_MUTEX_COUNT, PWR_PMU_MUTEX_ID_R,
    PWR_PMU_MUTEX_ID_RELEASE_R,
};
use crate::pmu::PmuHal;
use crate::util::Timeout;

pub mod falcon;

pub use falcon::{SimCmdCtx, SimCmdHandler, SimFalcon, SimStats};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegState {
    regs: HashMap<u32, u32>,
    tokens: HashSet<u32>,
    next_token: u32,
    exhausted: bool,
}

/// Register file with the PMU mutex token generator behind it.
pub struct SimRegisters {
    state: Mutex<RegState>,
}

impl SimRegisters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegState {
                next_token: 1,
                ..RegState::default()
            }),
        })
    }

    /// Make the token generator report "not available".
    pub fn set_tokens_exhausted(&self, exhausted: bool) {
        lock(&self.state).exhausted = exhausted;
    }

    /// Tokens handed out and not yet released.
    #[must_use]
    pub fn tokens_outstanding(&self) -> usize {
        lock(&self.state).tokens.len()
    }

    /// Firmware side of the mutex protocol: own `id` with `token`, or let
    /// it go with token 0.
    pub fn hold_mutex_for_firmware(&self, id: u32, token: u32) {
        lock(&self.state).regs.insert(pwr_pmu_mutex_r(id), token);
    }

    fn next_token(st: &mut RegState) -> u32 {
        if st.exhausted || st.tokens.len() >= (MUTEX_ID_NOT_AVAILABLE - 1) as usize {
            return MUTEX_ID_NOT_AVAILABLE;
        }
        loop {
            let t = st.next_token;
            st.next_token = if t >= MUTEX_ID_NOT_AVAILABLE - 1 { 1 } else { t + 1 };
            if st.tokens.insert(t) {
                return t;
            }
        }
    }

    fn is_mutex_reg(offset: u32) -> bool {
        (0..PMU_MUTEX_COUNT as u32).any(|i| pwr_pmu_mutex_r(i) == offset)
    }
}

impl RegisterIo for SimRegisters {
    fn read32(&self, offset: u32) -> u32 {
        let mut st = lock(&self.state);
        if offset == PWR_PMU_MUTEX_ID_R {
            let t = Self::next_token(&mut st);
            trace!("sim regs: mutex token {t:#x}");
            return t;
        }
        st.regs.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut st = lock(&self.state);
        if offset == PWR_PMU_MUTEX_ID_RELEASE_R {
            st.tokens.remove(&value);
            return;
        }
        if Self::is_mutex_reg(offset) {
            let cur = st.regs.get(&offset).copied().unwrap_or(0);
            // Owned mutexes only accept a release.
            if cur == 0 || value == 0 {
                st.regs.insert(offset, value);
            }
            return;
        }
        st.regs.insert(offset, value);
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

pub struct SimPlatform {
    silicon: AtomicBool,
    shutting_down: AtomicBool,
}

impl SimPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            silicon: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Emulation platforms never time out.
    pub fn set_silicon(&self, silicon: bool) {
        self.silicon.store(silicon, Ordering::Release);
    }

    /// Blocking waits give up from now on.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }
}

impl Platform for SimPlatform {
    fn is_silicon(&self) -> bool {
        self.silicon.load(Ordering::Acquire)
    }

    fn can_busy(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Firmware
// ---------------------------------------------------------------------------

pub const SIM_UCODE_APP_SIZE: u32 = 0x200;
pub const SIM_UCODE_ENTRY: u32 = 0x10;

/// Descriptor of the firmware image the simulated store serves.
#[must_use]
pub fn sim_ucode_desc(app_version: u32) -> PmuUcodeDesc {
    PmuUcodeDesc {
        descriptor_size: PMU_UCODE_DESC_SIZE as u32,
        image_size: SIM_UCODE_APP_SIZE,
        tools_version: 1,
        app_version,
        date: "2026-10-18".into(),
        app_start_offset: 0,
        app_size: SIM_UCODE_APP_SIZE,
        app_imem_offset: 0,
        app_imem_entry: SIM_UCODE_ENTRY,
        app_dmem_offset: 0,
        app_resident_code_offset: 0,
        app_resident_code_size: SIM_UCODE_APP_SIZE / 2,
        app_resident_data_offset: SIM_UCODE_APP_SIZE / 2,
        app_resident_data_size: SIM_UCODE_APP_SIZE / 2,
        ..PmuUcodeDesc::default()
    }
}

/// Recognisable ucode bytes: code is `0xC0`, data is `0xDA`.
#[must_use]
pub fn sim_ucode_image() -> Vec<u8> {
    let half = (SIM_UCODE_APP_SIZE / 2) as usize;
    let mut img = vec![0xC0u8; half];
    img.extend(std::iter::repeat(0xDAu8).take(half));
    img
}

/// Named blob store that counts outstanding requests.
#[derive(Default)]
pub struct SimFirmwareStore {
    blobs: Mutex<HashMap<String, Arc<FirmwareBlob>>>,
    outstanding: AtomicUsize,
    requests: Mutex<Vec<String>>,
}

impl SimFirmwareStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store holding the single non-secure blob: descriptor then ucode.
    pub fn with_ns_firmware(app_version: u32) -> Arc<Self> {
        let store = Self::new();
        let mut blob = sim_ucode_desc(app_version).to_bytes();
        blob.extend_from_slice(&sim_ucode_image());
        store.insert(PMU_UCODE_NS, blob);
        store
    }

    /// Store holding the image, descriptor and signature blobs.
    pub fn with_secure_firmware(app_version: u32) -> Arc<Self> {
        let store = Self::new();
        store.insert(PMU_UCODE_IMAGE, sim_ucode_image());
        store.insert(PMU_UCODE_DESC, sim_ucode_desc(app_version).to_bytes());
        store.insert(PMU_UCODE_SIG, vec![0x5A; 0x100]);
        store
    }

    pub fn insert(&self, name: &str, data: Vec<u8>) {
        lock(&self.blobs).insert(name.to_owned(), Arc::new(FirmwareBlob::new(name, data)));
    }

    pub fn remove(&self, name: &str) {
        lock(&self.blobs).remove(name);
    }

    /// Blobs requested and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Every name ever requested, in order.
    #[must_use]
    pub fn requested(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

impl FirmwareSource for SimFirmwareStore {
    fn request(&self, name: &str) -> Option<Arc<FirmwareBlob>> {
        lock(&self.requests).push(name.to_owned());
        let blob = lock(&self.blobs).get(name).cloned()?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        debug!("sim firmware: {name} handed out ({} bytes)", blob.len());
        Some(blob)
    }

    fn release(&self, blob: Arc<FirmwareBlob>) {
        let prev = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev.is_err() {
            warn!("sim firmware: {} released more often than requested", blob.name());
        }
    }
}

// ---------------------------------------------------------------------------
// Syncpoints
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Default)]
struct SyncptCounter {
    hw: u32,
    cached: u32,
}

/// host1x syncpoints with a host-side cache that can miss updates.
#[derive(Default)]
pub struct SimSyncpoints {
    counters: Mutex<HashMap<u32, SyncptCounter>>,
    cond: Condvar,
    fail_reads: AtomicBool,
}

impl SimSyncpoints {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Advance `id` and notify waiters. Returns the new value.
    pub fn incr(&self, id: u32) -> u32 {
        let mut c = lock(&self.counters);
        let ctr = c.entry(id).or_default();
        ctr.hw = ctr.hw.wrapping_add(1);
        ctr.cached = ctr.hw;
        let v = ctr.hw;
        drop(c);
        self.cond.notify_all();
        v
    }

    /// Advance the hardware counter without the host noticing.
    pub fn incr_unnotified(&self, id: u32) -> u32 {
        let mut c = lock(&self.counters);
        let ctr = c.entry(id).or_default();
        ctr.hw = ctr.hw.wrapping_add(1);
        ctr.hw
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    #[must_use]
    pub fn value(&self, id: u32) -> u32 {
        lock(&self.counters).get(&id).map_or(0, |c| c.hw)
    }
}

impl SyncpointDevice for SimSyncpoints {
    fn is_expired(&self, id: u32, thresh: u32) -> bool {
        let cached = lock(&self.counters).get(&id).map_or(0, |c| c.cached);
        syncpt_reached(cached, thresh)
    }

    fn read_ext_check(&self, id: u32) -> PmuResult<u32> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(PmuError::Io(format!("syncpt {id} read failed")));
        }
        let mut c = lock(&self.counters);
        let ctr = c.entry(id).or_default();
        ctr.cached = ctr.hw;
        Ok(ctr.hw)
    }

    fn wait_timeout_ext(&self, id: u32, thresh: u32, timeout: Timeout) -> PmuResult<()> {
        let mut c = lock(&self.counters);
        loop {
            let cached = c.get(&id).map_or(0, |ctr| ctr.cached);
            if syncpt_reached(cached, thresh) {
                return Ok(());
            }
            let wait = match timeout.remaining() {
                Some(d) if d.is_zero() => return Err(PmuError::TimedOut),
                Some(d) => d,
                None => Duration::from_millis(100),
            };
            c = self
                .cond
                .wait_timeout(c, wait)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

// ---------------------------------------------------------------------------
// Device table
// ---------------------------------------------------------------------------

/// Device table served from a list.
#[derive(Clone, Debug, Default)]
pub struct SimDeviceTable {
    entries: Vec<Device>,
}

impl SimDeviceTable {
    #[must_use]
    pub fn new(entries: Vec<Device>) -> Self {
        Self { entries }
    }

    /// Graphics, two copy engines and two LCEs, as a small dGPU reports.
    #[must_use]
    pub fn typical() -> Self {
        let dev = |dev_type, inst_id, engine_id, runlist_id, pri_base| Device {
            dev_type,
            inst_id,
            engine_id,
            runlist_id,
            intr_id: engine_id,
            reset_id: engine_id + 12,
            pri_base,
            fault_id: engine_id + 0x40,
        };
        Self::new(vec![
            dev(DEVTYPE_GRAPHICS, 0, 0, 0, 0x0040_0000),
            dev(DEVTYPE_COPY0, 0, 1, 1, 0x0010_4000),
            dev(DEVTYPE_COPY1, 0, 2, 2, 0x0010_5000),
            dev(DEVTYPE_LCE, 0, 3, 3, 0x0010_4000),
            dev(DEVTYPE_LCE, 1, 4, 3, 0x0010_5000),
        ])
    }
}

impl DeviceTableParser for SimDeviceTable {
    fn parse_next_device(&mut self, cursor: &mut u32) -> Option<Device> {
        let dev = self.entries.get(*cursor as usize).cloned()?;
        *cursor += 1;
        Some(dev)
    }
}

// ---------------------------------------------------------------------------
// Whole GPU
// ---------------------------------------------------------------------------

/// One simulated GPU: falcon, registers, platform and firmware store.
#[derive(Clone)]
pub struct SimGpu {
    pub falcon: Arc<SimFalcon>,
    pub regs: Arc<SimRegisters>,
    pub platform: Arc<SimPlatform>,
    pub firmware: Arc<SimFirmwareStore>,
}

impl SimGpu {
    /// Firmware matching `cfg.secure_boot`, from a family that supports
    /// FB queues.
    #[must_use]
    pub fn new(cfg: &PmuConfig) -> Self {
        let firmware = if cfg.secure_boot {
            SimFirmwareStore::with_secure_firmware(APP_VERSION_TU10X)
        } else {
            SimFirmwareStore::with_ns_firmware(APP_VERSION_TU10X)
        };
        Self::with_firmware(firmware)
    }

    #[must_use]
    pub fn with_firmware(firmware: Arc<SimFirmwareStore>) -> Self {
        Self {
            falcon: SimFalcon::new(),
            regs: SimRegisters::new(),
            platform: SimPlatform::new(),
            firmware,
        }
    }

    #[must_use]
    pub fn hal(&self) -> PmuHal {
        let falcon: Arc<dyn FalconHal> = self.falcon.clone();
        let regs: Arc<dyn RegisterIo> = self.regs.clone();
        let platform: Arc<dyn Platform> = self.platform.clone();
        let firmware: Arc<dyn FirmwareSource> = self.firmware.clone();
        PmuHal {
            falcon,
            regs,
            platform,
            firmware,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_register_ignores_foreign_writes_while_owned() {
        let regs = SimRegisters::new();
        let a = regs.read32(PWR_PMU_MUTEX_ID_R);
        let b = regs.read32(PWR_PMU_MUTEX_ID_R);
        assert_ne!(a, b);
        regs.write32(pwr_pmu_mutex_r(3), a);
        regs.write32(pwr_pmu_mutex_r(3), b);
        assert_eq!(regs.read32(pwr_pmu_mutex_r(3)), a);
        regs.write32(pwr_pmu_mutex_r(3), 0);
        regs.write32(PWR_PMU_MUTEX_ID_RELEASE_R, a);
        regs.write32(PWR_PMU_MUTEX_ID_RELEASE_R, b);
        assert_eq!(regs.tokens_outstanding(), 0);
    }

    #[test]
    fn firmware_store_tracks_outstanding_blobs() {
        let store = SimFirmwareStore::with_secure_firmware(APP_VERSION_TU10X);
        let img = store.request(PMU_UCODE_IMAGE).unwrap();
        assert!(store.request("missing.bin").is_none());
        assert_eq!(store.outstanding(), 1);
        store.release(img);
        assert_eq!(store.outstanding(), 0);
        assert_eq!(store.requested().len(), 2);
    }

    #[test]
    fn unnotified_increment_needs_a_recheck() {
        let sp = SimSyncpoints::new();
        sp.incr_unnotified(7);
        assert!(!sp.is_expired(7, 1));
        assert_eq!(sp.read_ext_check(7).unwrap(), 1);
        assert!(sp.is_expired(7, 1));
    }
}
