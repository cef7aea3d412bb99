// CLASSIFICATION: COMMUNITY
// Filename: fw.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! PMU firmware loading and RTOS lifecycle flags.
//!
//! A non-secure GPU boots from one blob that starts with its own
//! descriptor. A secure GPU needs three: the ucode image, the descriptor
//! and the signature. Whatever was requested is released again when the
//! [`RtosFw`] goes away, in reverse order of the requests.

use std::fmt;
use std::sync::{Arc, MutexGuard};

use log::{debug, error, info, warn};

use super::Pmu;
use crate::error::{PmuError, PmuResult};
use crate::hal::{FirmwareBlob, FirmwareSource};
use crate::mm::MemRegion;
use crate::pmu::fw_ver::{init_fw_ver_ops, FwVersionOps, PmuUcodeDesc};
use crate::util::{Backoff, FencedBool, FencedU32, Rollback, Timeout};

pub const PMU_UCODE_NS: &str = "gpmu_ucode.bin";
pub const PMU_UCODE_IMAGE: &str = "gpmu_ucode_image.bin";
pub const PMU_UCODE_DESC: &str = "gpmu_ucode_desc.bin";
pub const PMU_UCODE_SIG: &str = "pmu_sig.bin";

/// RTOS lifecycle as tracked by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum PmuFwState {
    Off = 0,
    Starting = 1,
    InitReceived = 2,
    Exit = 8,
}

impl PmuFwState {
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(PmuFwState::Off),
            1 => Some(PmuFwState::Starting),
            2 => Some(PmuFwState::InitReceived),
            8 => Some(PmuFwState::Exit),
            _ => None,
        }
    }
}

/// Loaded firmware and the layout ops its version selects.
pub struct RtosFw {
    source: Arc<dyn FirmwareSource>,
    image: Option<Arc<FirmwareBlob>>,
    desc_blob: Option<Arc<FirmwareBlob>>,
    sig: Option<Arc<FirmwareBlob>>,
    desc: PmuUcodeDesc,
    ops: Arc<dyn FwVersionOps>,
    ucode: Option<MemRegion>,
    secure: bool,
}

fn release_on_unwind(
    source: &Arc<dyn FirmwareSource>,
    blob: &Arc<FirmwareBlob>,
) -> impl FnOnce() + 'static {
    let source = Arc::clone(source);
    let blob = Arc::clone(blob);
    move || source.release(blob)
}

impl RtosFw {
    /// Request and parse the firmware for the given privilege level.
    pub fn load(source: Arc<dyn FirmwareSource>, secure: bool) -> PmuResult<Self> {
        if secure {
            Self::load_secure(source)
        } else {
            Self::load_ns(source)
        }
    }

    fn load_ns(source: Arc<dyn FirmwareSource>) -> PmuResult<Self> {
        let image = source.request(PMU_UCODE_NS).ok_or_else(|| {
            error!("failed to load pmu ucode {PMU_UCODE_NS}");
            PmuError::NotFound(PMU_UCODE_NS.into())
        })?;
        let mut rb = Rollback::new();
        rb.push("pmu ucode", release_on_unwind(&source, &image));

        let desc = PmuUcodeDesc::parse(image.data())?;
        let ucode_len = image
            .len()
            .checked_sub(desc.descriptor_size as usize)
            .ok_or(PmuError::InvalidArgument("descriptor larger than ucode blob"))?;
        desc.check_segments(ucode_len)?;
        let ops: Arc<dyn FwVersionOps> = init_fw_ver_ops(desc.app_version)?.into();
        rb.commit();

        info!("PMU ucode {PMU_UCODE_NS} loaded, app version {}", desc.app_version);
        Ok(Self {
            source,
            image: Some(image),
            desc_blob: None,
            sig: None,
            desc,
            ops,
            ucode: None,
            secure: false,
        })
    }

    fn load_secure(source: Arc<dyn FirmwareSource>) -> PmuResult<Self> {
        let request = |name: &str| {
            source.request(name).ok_or_else(|| {
                error!("failed to load pmu ucode {name}");
                PmuError::NoEntry(name.into())
            })
        };
        let mut rb = Rollback::new();
        let image = request(PMU_UCODE_IMAGE)?;
        rb.push("pmu ucode image", release_on_unwind(&source, &image));
        let desc_blob = request(PMU_UCODE_DESC)?;
        rb.push("pmu ucode desc", release_on_unwind(&source, &desc_blob));
        let sig = request(PMU_UCODE_SIG)?;
        rb.push("pmu signature", release_on_unwind(&source, &sig));

        let desc = PmuUcodeDesc::parse(desc_blob.data())?;
        desc.check_segments(image.len())?;
        let ops: Arc<dyn FwVersionOps> = init_fw_ver_ops(desc.app_version)?.into();
        rb.commit();

        info!("secure PMU ucode loaded, app version {}", desc.app_version);
        Ok(Self {
            source,
            image: Some(image),
            desc_blob: Some(desc_blob),
            sig: Some(sig),
            desc,
            ops,
            ucode: None,
            secure: true,
        })
    }

    #[must_use]
    pub fn desc(&self) -> &PmuUcodeDesc {
        &self.desc
    }

    #[must_use]
    pub fn ops(&self) -> Arc<dyn FwVersionOps> {
        Arc::clone(&self.ops)
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Bytes the descriptor's segment offsets are relative to.
    #[must_use]
    pub fn ucode_image(&self) -> &[u8] {
        let data = self.image.as_ref().map_or(&[][..], |b| b.data());
        if self.secure {
            data
        } else {
            data.get(self.desc.descriptor_size as usize..).unwrap_or(&[])
        }
    }

    #[must_use]
    pub fn signature(&self) -> Option<&[u8]> {
        self.sig.as_ref().map(|s| s.data())
    }

    /// GPU-visible copy of the ucode, created on first use.
    pub fn map_ucode(&mut self) -> PmuResult<MemRegion> {
        if let Some(mem) = &self.ucode {
            return Ok(mem.clone());
        }
        let mem = MemRegion::from_bytes(self.ucode_image())?;
        debug!("PMU ucode mapped at {:#x}", mem.gpu_va());
        self.ucode = Some(mem.clone());
        Ok(mem)
    }
}

impl Drop for RtosFw {
    fn drop(&mut self) {
        for blob in [self.sig.take(), self.desc_blob.take(), self.image.take()]
            .into_iter()
            .flatten()
        {
            debug!("releasing {}", blob.name());
            self.source.release(blob);
        }
        self.ucode = None;
    }
}

impl fmt::Debug for RtosFw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtosFw")
            .field("app_version", &self.desc.app_version)
            .field("secure", &self.secure)
            .field("mapped", &self.ucode.is_some())
            .finish()
    }
}

impl Pmu {
    fn lock_fw(&self) -> PmuResult<MutexGuard<'_, Option<RtosFw>>> {
        self.fw.lock().map_err(|_| PmuError::LockPoisoned)
    }

    /// Load the firmware unless it survived from an earlier power cycle.
    pub fn init_pmu_fw(&self) -> PmuResult<()> {
        let mut fw = self.lock_fw()?;
        if fw.is_some() {
            debug!("PMU firmware already loaded, skipping reload");
            return Ok(());
        }
        *fw = Some(RtosFw::load(
            Arc::clone(&self.hal.firmware),
            self.cfg.secure_boot,
        )?);
        Ok(())
    }

    /// Drop the firmware and release its blobs. No-op when none is loaded.
    pub fn fw_deinit(&self) {
        let fw = match self.fw.lock() {
            Ok(mut g) => g.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(fw) = fw {
            debug!("PMU firmware deinit: {fw:?}");
        }
    }

    #[must_use]
    pub fn is_fw_loaded(&self) -> bool {
        self.fw.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    pub fn fw_ops(&self) -> PmuResult<Arc<dyn FwVersionOps>> {
        self.lock_fw()?
            .as_ref()
            .map(RtosFw::ops)
            .ok_or(PmuError::NotReady)
    }

    /// Run `f` against the loaded firmware.
    pub fn with_fw<R>(&self, f: impl FnOnce(&mut RtosFw) -> PmuResult<R>) -> PmuResult<R> {
        let mut fw = self.lock_fw()?;
        match fw.as_mut() {
            Some(fw) => f(fw),
            None => Err(PmuError::NotReady),
        }
    }

    pub fn fw_state_change(&self, state: PmuFwState, post_event: bool) {
        debug!("pmu fw state -> {state:?}");
        self.fw_state.publish(state as u32);
        if let Some(pg) = self.pg.try_get() {
            if state == PmuFwState::Exit {
                pg.set_state_destroy();
            }
            if post_event && self.cfg.can_elpg {
                pg.signal_state_change();
            }
        }
    }

    #[must_use]
    pub fn get_fw_state(&self) -> PmuFwState {
        PmuFwState::from_u32(self.fw_state.observe()).unwrap_or(PmuFwState::Off)
    }

    pub fn set_fw_ready(&self, ready: bool) {
        self.fw_ready.publish(ready);
    }

    #[must_use]
    pub fn get_fw_ready(&self) -> bool {
        self.fw_ready.observe()
    }

    /// The RTOS is up once it has reported ready and has not been told to
    /// exit. There is no separate running state.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.get_fw_ready()
            && matches!(
                self.get_fw_state(),
                PmuFwState::Starting | PmuFwState::InitReceived
            )
    }

    /// Poll until the RTOS reports ready, servicing its interrupt meanwhile.
    pub fn wait_fw_ready(&self, timeout_ms: u64) -> PmuResult<()> {
        self.poll_flag(timeout_ms, "PMU firmware ready", &|| self.fw_ready.observe(), &|| {
            self.fw_ready.publish(true)
        })
    }

    /// Poll until `var == val`. The synchronous building block for every
    /// "wait for the RTOS to acknowledge" step.
    pub fn wait_message_cond(&self, timeout_ms: u64, var: &FencedU32, val: u32) -> PmuResult<()> {
        self.poll_flag(timeout_ms, "PMU message", &|| var.observe() == val, &|| {
            var.publish(val)
        })
    }

    /// Same as [`Pmu::wait_message_cond`] for a boolean flag.
    pub fn wait_message_flag(&self, timeout_ms: u64, var: &FencedBool) -> PmuResult<()> {
        self.poll_flag(timeout_ms, "PMU message", &|| var.observe(), &|| {
            var.publish(true)
        })
    }

    fn poll_flag(
        &self,
        timeout_ms: u64,
        what: &str,
        done: &dyn Fn() -> bool,
        force: &dyn Fn(),
    ) -> PmuResult<()> {
        let timeout = Timeout::from_ms(timeout_ms);
        let mut backoff = Backoff::new();
        loop {
            // Shutdown must never hang on the RTOS.
            if !self.hal.platform.can_busy() {
                warn!("wait for {what} skipped, shutting down");
                force();
                return Ok(());
            }
            if done() {
                return Ok(());
            }
            if self.hal.falcon.is_interrupted() {
                if let Err(e) = self.isr() {
                    warn!("PMU isr during wait failed: {e}");
                }
                if done() {
                    return Ok(());
                }
            }
            if timeout.expired() {
                error!("wait for {what} timed out");
                return Err(PmuError::TimedOut);
            }
            backoff.sleep(&timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_values_match_wire_encoding() {
        assert_eq!(PmuFwState::from_u32(8), Some(PmuFwState::Exit));
        assert_eq!(PmuFwState::from_u32(3), None);
        assert!(PmuFwState::Starting < PmuFwState::InitReceived);
    }
}
