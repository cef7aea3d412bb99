// CLASSIFICATION: COMMUNITY
// Filename: rtos.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! RTOS bring-up and teardown.
//!
//! `OFF -> STARTING -> (INIT received, fw ready) -> EXIT`. Early init
//! allocates the long-lived pieces in a fixed order and unwinds them in
//! reverse if any step fails. `rtos_init` loads the ucode and starts the
//! falcon; the RTOS then announces itself with the INIT message, which
//! `wait_fw_ready` waits for.

use std::sync::Arc;

use log::{debug, error, info};

use super::Pmu;
use crate::error::{PmuError, PmuResult};
use crate::pmu::fw::PmuFwState;
use crate::pmu::lsfm::LsfManager;
use crate::pmu::mutex::PmuMutexes;
use crate::pmu::pg::PgState;
use crate::pmu::seq::SequenceTable;
use crate::pmu::super_surface::SuperSurface;
use crate::util::Rollback;

impl Pmu {
    /// Allocate firmware, mutexes, sequences, power gating, LSF manager and
    /// the super surface, in that order.
    pub fn rtos_early_init(&self) -> PmuResult<()> {
        if !self.cfg.support_ls_pmu {
            debug!("LS PMU not supported, skipping early init");
            return Ok(());
        }
        let mut rb = Rollback::new();

        self.init_pmu_fw()?;
        rb.push("pmu firmware", || self.fw_deinit());

        self.mutexes.set(PmuMutexes::new(
            Arc::clone(&self.hal.regs),
            self.cfg.mutex_retries,
        )?);
        rb.push("pmu mutexes", || {
            self.mutexes.take();
        });

        self.sequences
            .set(SequenceTable::alloc(self.cfg.num_sequences)?);
        rb.push("pmu sequences", || {
            self.sequences.take();
        });

        if self.cfg.can_elpg {
            self.pg.set(Arc::new(PgState::new()));
            rb.push("pmu pg", || {
                self.pg.take();
            });
        }

        self.lsfm.set(Arc::new(LsfManager::new()));
        rb.push("lsfm", || {
            self.lsfm.take();
        });

        if self.cfg.super_surface {
            let ops = self.fw_ops()?;
            if !ops.supports_super_surface() {
                error!(
                    "PMU app version {} has no super surface support",
                    ops.app_version()
                );
                return Err(PmuError::InvalidArgument(
                    "firmware does not support the super surface",
                ));
            }
            self.super_surface.set(Arc::new(SuperSurface::new()));
            rb.push("super surface", || {
                self.super_surface.take();
            });
        }

        rb.commit();
        info!("PMU early init done");
        Ok(())
    }

    /// Reset software state for a fresh boot. Buffers are allocated once.
    fn pmu_sw_setup(&self) -> PmuResult<()> {
        if let Some(m) = self.mutexes.try_get() {
            m.reset();
        }
        let seqs = self.sequences.get()?;
        // Commands still parked from a previous boot never get a reply now.
        seqs.cancel_inflight(PmuError::NotReady.errno());
        seqs.init();
        if let Some(pg) = self.pg.try_get() {
            pg.sw_setup();
        }
        if self.sw_ready.observe() {
            debug!("PMU sw already set up, skipping buffer allocation");
            return Ok(());
        }
        if let Some(ss) = self.super_surface.try_get() {
            ss.alloc_buf()?;
        }
        self.sw_ready.publish(true);
        Ok(())
    }

    fn bind_super_surface(&self) {
        let mem = self
            .super_surface
            .try_get()
            .and_then(|ss| ss.mem().ok().cloned());
        self.hal.falcon.bind_super_surface(mem);
    }

    fn ns_bootstrap(&self) -> PmuResult<()> {
        let falcon = &self.hal.falcon;
        let (desc, ucode) = self.with_fw(|fw| {
            let mem = fw.map_ucode()?;
            Ok((fw.desc().clone(), mem))
        })?;

        falcon.reset()?;
        self.bind_super_surface();
        self.ls_pmu_cmdline_args_copy()?;

        let app = desc.app_start_offset as usize;
        let mut code = vec![0u8; desc.app_resident_code_size as usize];
        ucode.read(app + desc.app_resident_code_offset as usize, &mut code)?;
        falcon.copy_to_imem(desc.app_imem_offset, &code)?;

        let mut data = vec![0u8; desc.app_resident_data_size as usize];
        ucode.read(app + desc.app_resident_data_offset as usize, &mut data)?;
        falcon.copy_to_dmem(desc.app_dmem_offset, &data)?;

        falcon.enable_irq(true);
        debug!(
            "PMU ns bootstrap: {:#x} code bytes at IMEM {:#x}, entry {:#x}",
            code.len(),
            desc.app_imem_offset,
            desc.app_imem_entry
        );
        falcon.bootstrap(desc.app_imem_entry)
    }

    fn secure_bootstrap(&self) -> PmuResult<()> {
        let falcon = &self.hal.falcon;
        falcon.reset()?;
        if self.cfg.sec2_rtos {
            falcon.bootstrap_via_sec2()?;
        }
        falcon.clear_halt_intr_status()?;
        falcon.setup_apertures()?;
        self.bind_super_surface();
        self.ls_pmu_cmdline_args_copy()?;
        falcon.enable_irq(true);
        falcon.start_secure()
    }

    /// Set up software state and start the RTOS.
    pub fn rtos_init(&self) -> PmuResult<()> {
        if !self.cfg.support_ls_pmu {
            return Ok(());
        }
        let res = self.pmu_sw_setup().and_then(|()| {
            if self.cfg.secure_boot {
                self.secure_bootstrap()
            } else {
                self.ns_bootstrap()
            }
        });
        if let Err(e) = &res {
            error!("PMU RTOS init failed: {e}");
            return res;
        }
        self.fw_state_change(PmuFwState::Starting, false);
        info!("PMU RTOS started");
        Ok(())
    }

    /// Tear down what the RTOS handed over and return to `Off`.
    ///
    /// Commands still in flight are completed with `-ENODEV`.
    pub fn destroy(&self) {
        if let Some(pg) = self.pg.try_get() {
            pg.destroy();
        }
        self.hal.falcon.enable_irq(false);
        if let Some(seqs) = self.sequences.try_get() {
            seqs.cancel_inflight(PmuError::NotReady.errno());
        }
        self.queues.take();
        if let Some(dmem) = self.dmem.take() {
            if let Ok(dmem) = Arc::try_unwrap(dmem) {
                dmem.destroy();
            }
        }
        self.fw_state_change(PmuFwState::Off, false);
        self.set_fw_ready(false);
        if let Some(lsfm) = self.lsfm.try_get() {
            lsfm.clean();
        }
        self.pmu_ready.publish(false);
        info!("PMU destroyed");
    }

    /// Undo everything `rtos_early_init` and `rtos_init` set up.
    pub fn remove_support(&self) {
        self.destroy();
        if self.super_surface.take().is_some() {
            self.hal.falcon.bind_super_surface(None);
        }
        self.lsfm.take();
        self.pg.take();
        self.sequences.take();
        self.mutexes.take();
        self.fw_deinit();
        self.sw_ready.publish(false);
        debug!("PMU support removed");
    }

    /// Tell waiters the RTOS is going away.
    pub fn shutdown(&self) {
        self.fw_state_change(PmuFwState::Exit, true);
    }
}
