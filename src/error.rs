// CLASSIFICATION: COMMUNITY
// Filename: error.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Crate-wide error type for the PMU runtime.

use thiserror::Error;

const EIO: i32 = 5;
const ENOENT: i32 = 2;
const EAGAIN: i32 = 11;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const ENOSPC: i32 = 28;
const ENODEV: i32 = 19;
const ETIMEDOUT: i32 = 110;

/// Errors surfaced by the allocator, device table, fences and PMU runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PmuError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("out of memory")]
    OutOfMemory,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no such entry: {0}")]
    NoEntry(String),
    #[error("resource busy, try again")]
    Busy,
    #[error("timed out")]
    TimedOut,
    #[error("queue has no space")]
    NoSpace,
    #[error("firmware reported status {0:#x}")]
    Firmware(u32),
    #[error("PMU not ready")]
    NotReady,
    #[error("hardware access failed: {0}")]
    Io(String),
    #[error("PMU lock poisoned")]
    LockPoisoned,
    #[error("configuration error: {0}")]
    Config(String),
}

impl PmuError {
    /// Negative errno equivalent, as handed to reply callbacks.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            PmuError::InvalidArgument(_) | PmuError::Config(_) => -EINVAL,
            PmuError::OutOfMemory => -ENOMEM,
            PmuError::NotFound(_) | PmuError::NoEntry(_) => -ENOENT,
            PmuError::Busy => -EAGAIN,
            PmuError::TimedOut => -ETIMEDOUT,
            PmuError::NoSpace => -ENOSPC,
            PmuError::Firmware(_) | PmuError::Io(_) => -EIO,
            PmuError::NotReady => -ENODEV,
            PmuError::LockPoisoned => -EBUSY,
        }
    }

    /// Error code used for RC "unhandled command" replies.
    #[must_use]
    pub const fn einval() -> i32 {
        -EINVAL
    }
}

pub type PmuResult<T> = Result<T, PmuError>;
