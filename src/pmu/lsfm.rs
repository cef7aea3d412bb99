// CLASSIFICATION: COMMUNITY
// Filename: lsfm.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Light-secure falcon manager.
//!
//! Once the RTOS runs it owns the write-protected region and can bootstrap
//! LS falcons such as FECS and GPCCS on the host's behalf. The handshake is
//! two ACR RPCs whose completions land in the flags below.

use log::{debug, info};

use super::Pmu;
use crate::error::{PmuError, PmuResult};
use crate::pmu::fw_ver::CmdLineArgs;
use crate::pmu::ipc::RpcRequest;
use crate::pmu::msg::{
    PMU_UNIT_ACR, NV_PMU_RPC_ID_ACR_BOOTSTRAP_FALCON, NV_PMU_RPC_ID_ACR_INIT_WPR_REGION,
};
use crate::util::FencedU32;

pub const FALCON_ID_FECS: u32 = 2;
pub const FALCON_ID_GPCCS: u32 = 3;
pub const FALCON_ID_INVALID: u32 = 0xffff_ffff;

/// WPR region the RTOS is asked to initialise.
pub const LSF_WPR_REGION_ID: u32 = 1;
/// Reset the falcon before loading it.
pub const ACR_BOOTSTRAP_FLAGS_RESET_YES: u32 = 0;

/// PMU clock reported to the RTOS through its boot arguments.
pub const PMU_CPU_FREQ_HZ: u32 = 204_000_000;

#[derive(Debug)]
pub struct LsfManager {
    wpr_init_done: FencedU32,
    loaded_falcon_id: FencedU32,
}

impl Default for LsfManager {
    fn default() -> Self {
        Self {
            wpr_init_done: FencedU32::new(0),
            loaded_falcon_id: FencedU32::new(FALCON_ID_INVALID),
        }
    }
}

impl LsfManager {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn wpr_init_done(&self) -> &FencedU32 {
        &self.wpr_init_done
    }

    #[must_use]
    pub fn loaded_falcon_id(&self) -> &FencedU32 {
        &self.loaded_falcon_id
    }

    pub(crate) fn complete_wpr_init(&self) {
        self.wpr_init_done.publish(1);
    }

    pub(crate) fn complete_bootstrap(&self, falcon_id: u32) {
        self.loaded_falcon_id.publish(falcon_id);
    }

    pub fn clean(&self) {
        self.wpr_init_done.publish(0);
        self.loaded_falcon_id.publish(FALCON_ID_INVALID);
    }
}

impl Pmu {
    /// Write the boot arguments to the top of DMEM.
    pub fn ls_pmu_cmdline_args_copy(&self) -> PmuResult<()> {
        let ops = self.fw_ops()?;
        let mut args = CmdLineArgs {
            cpu_freq_hz: PMU_CPU_FREQ_HZ,
            secure_mode: self.cfg.secure_boot,
            raise_priv_sec: self.cfg.secure_boot,
            ..CmdLineArgs::default()
        };
        if let Some(ss) = self.super_surface.try_get() {
            if let Ok(mem) = ss.mem() {
                args.super_surface_base = mem.gpu_va();
                args.super_surface_size = ss.size();
            }
        }
        let bytes = ops.encode_cmd_line_args(&args);
        let dmem_size = self.hal.falcon.dmem_size();
        let offset = dmem_size
            .checked_sub(ops.cmd_line_args_size())
            .ok_or(PmuError::InvalidArgument("boot arguments larger than DMEM"))?;
        debug!("PMU boot arguments at DMEM {offset:#x}, {} bytes", bytes.len());
        self.hal.falcon.copy_to_dmem(offset, &bytes)
    }

    /// Ask the RTOS to set up the WPR region.
    pub fn lsfm_init_wpr_region(&self) -> PmuResult<()> {
        let mut params = Vec::with_capacity(8);
        params.extend_from_slice(&LSF_WPR_REGION_ID.to_le_bytes());
        params.extend_from_slice(&0u32.to_le_bytes());
        self.rpc_execute(
            RpcRequest::new(PMU_UNIT_ACR, NV_PMU_RPC_ID_ACR_INIT_WPR_REGION, params),
            false,
            None,
        )?;
        Ok(())
    }

    /// Have the RTOS load LS falcon `falcon_id` out of the WPR region.
    pub fn lsfm_bootstrap_ls_falcon(&self, falcon_id: u32) -> PmuResult<()> {
        let lsfm = self.lsfm.get()?;
        let timeout = self.cfg.cmd_timeout_ms;
        if lsfm.wpr_init_done().observe() == 0 {
            self.lsfm_init_wpr_region()?;
            self.wait_message_cond(timeout, lsfm.wpr_init_done(), 1)?;
        }
        lsfm.loaded_falcon_id().publish(FALCON_ID_INVALID);

        let mut params = Vec::with_capacity(8);
        params.extend_from_slice(&falcon_id.to_le_bytes());
        params.extend_from_slice(&ACR_BOOTSTRAP_FLAGS_RESET_YES.to_le_bytes());
        self.rpc_execute(
            RpcRequest::new(PMU_UNIT_ACR, NV_PMU_RPC_ID_ACR_BOOTSTRAP_FALCON, params),
            false,
            None,
        )?;
        self.wait_message_cond(timeout, lsfm.loaded_falcon_id(), falcon_id)?;
        info!("LS falcon {falcon_id} bootstrapped by PMU");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_resets_handshake_flags() {
        let lsfm = LsfManager::new();
        lsfm.complete_wpr_init();
        lsfm.complete_bootstrap(FALCON_ID_FECS);
        lsfm.clean();
        assert_eq!(lsfm.wpr_init_done().observe(), 0);
        assert_eq!(lsfm.loaded_falcon_id().observe(), FALCON_ID_INVALID);
    }
}
