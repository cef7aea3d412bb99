// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Host-side runtime for the GPU PMU RTOS.
//!
//! Brings the PMU falcon up from firmware, exchanges commands and RPCs with
//! the RTOS over DMEM or FB queues, and carries the small GPU services the
//! runtime leans on: a lock-free block allocator, the device catalog and
//! completion fences.

/// Errors and errno mapping shared by every module
pub mod error;

/// Feature switches loaded from TOML and the environment
pub mod config;

/// Fenced flags, rollback stacks, timeouts
pub mod util;

/// Traits the runtime uses to reach hardware, plus the in-process simulator
pub mod hal;

/// GPU memory regions and the lock-free block allocator
pub mod mm;

/// Hardware device catalog
pub mod device;

/// Completion fences over semaphores and syncpoints
pub mod fence;

/// PMU RTOS bring-up, queues, sequences and RPC
pub mod pmu;

pub use config::PmuConfig;
pub use error::{PmuError, PmuResult};
pub use pmu::{Pmu, PmuHal};

/// Route `log` output through `env_logger`. Safe to call more than once.
#[cfg(feature = "logging")]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
