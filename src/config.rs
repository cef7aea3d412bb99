// CLASSIFICATION: COMMUNITY
// Filename: config.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Per-GPU PMU feature switches.
//!
//! Defaults mirror a non-secure integrated GPU with power gating. Values can
//! be loaded from a TOML file and overridden through `PMU_*` environment
//! variables.

use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PmuError, PmuResult};
use crate::pmu::seq::PMU_MAX_NUM_SEQUENCES;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmuConfig {
    /// LS PMU firmware is supported on this GPU.
    pub support_ls_pmu: bool,
    /// Secure privilege: boot from the signed multi-blob firmware.
    pub secure_boot: bool,
    /// Bootstrap the PMU through SEC2 instead of starting it directly.
    pub sec2_rtos: bool,
    /// Engine-level power gating is enabled.
    pub can_elpg: bool,
    /// Use system-memory FB queues instead of DMEM queues.
    pub super_surface: bool,
    pub num_sequences: usize,
    pub dmem_block_size: u64,
    pub fw_ready_timeout_ms: u64,
    pub cmd_timeout_ms: u64,
    pub mutex_retries: u32,
}

impl Default for PmuConfig {
    fn default() -> Self {
        Self {
            support_ls_pmu: true,
            secure_boot: false,
            sec2_rtos: false,
            can_elpg: true,
            super_surface: false,
            num_sequences: PMU_MAX_NUM_SEQUENCES,
            dmem_block_size: 256,
            fw_ready_timeout_ms: 2000,
            cmd_timeout_ms: 2000,
            mutex_retries: 40,
        }
    }
}

impl PmuConfig {
    /// Parse a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> PmuResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PmuError::Config(format!("{}: {e}", path.display())))?;
        let cfg: PmuConfig =
            toml::from_str(&text).map_err(|e| PmuError::Config(e.to_string()))?;
        debug!("loaded PMU config from {}", path.display());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> PmuResult<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("PMU_SECURE_BOOT") {
            self.secure_boot = v;
        }
        if let Some(v) = env_bool("PMU_SEC2_RTOS") {
            self.sec2_rtos = v;
        }
        if let Some(v) = env_bool("PMU_CAN_ELPG") {
            self.can_elpg = v;
        }
        if let Some(v) = env_bool("PMU_SUPER_SURFACE") {
            self.super_surface = v;
        }
        if let Some(v) = env_parse::<usize>("PMU_NUM_SEQUENCES") {
            self.num_sequences = v;
        }
        if let Some(v) = env_parse::<u64>("PMU_FW_READY_TIMEOUT_MS") {
            self.fw_ready_timeout_ms = v;
        }
    }

    pub fn validate(&self) -> PmuResult<()> {
        if self.num_sequences == 0 || self.num_sequences > PMU_MAX_NUM_SEQUENCES {
            return Err(PmuError::Config(format!(
                "num_sequences must be in 1..={PMU_MAX_NUM_SEQUENCES}, got {}",
                self.num_sequences
            )));
        }
        if self.dmem_block_size == 0 {
            return Err(PmuError::Config("dmem_block_size must be non-zero".into()));
        }
        if self.fw_ready_timeout_ms == 0 || self.cmd_timeout_ms == 0 {
            return Err(PmuError::Config("timeouts must be non-zero".into()));
        }
        if self.sec2_rtos && !self.secure_boot {
            return Err(PmuError::Config("sec2_rtos requires secure_boot".into()));
        }
        Ok(())
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!("ignoring {key}={other}: not a boolean");
            None
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw}: not a number");
            None
        }
    }
}
