// CLASSIFICATION: COMMUNITY
// Filename: syncpt.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Syncpoint-backed fences.

use std::sync::Arc;

use log::{debug, warn};

use super::{FenceKind, FenceOps};
use crate::error::{PmuError, PmuResult};
use crate::util::Timeout;

/// Reported for fences that carry no syncpoint.
pub const SYNCPT_INVALID: u32 = u32::MAX;

/// host1x syncpoint device.
pub trait SyncpointDevice: Send + Sync {
    /// Cheap check against the last value the host observed.
    fn is_expired(&self, id: u32, thresh: u32) -> bool;
    /// Force a read of the hardware counter, refreshing the cached value.
    fn read_ext_check(&self, id: u32) -> PmuResult<u32>;
    fn wait_timeout_ext(&self, id: u32, thresh: u32, timeout: Timeout) -> PmuResult<()>;
}

/// Wrap-safe `value >= thresh`.
#[must_use]
pub fn syncpt_reached(value: u32, thresh: u32) -> bool {
    (value.wrapping_sub(thresh) as i32) >= 0
}

pub struct SyncpointFence {
    dev: Arc<dyn SyncpointDevice>,
    id: u32,
    value: u32,
}

impl SyncpointFence {
    pub fn new(dev: Arc<dyn SyncpointDevice>, id: u32, value: u32) -> Self {
        Self { dev, id, value }
    }

    /// Re-read the counter in case a notification was dropped. A failed read
    /// counts as expired so a broken syncpoint cannot wedge its waiters.
    fn recheck(&self) -> bool {
        match self.dev.read_ext_check(self.id) {
            Ok(_) => self.dev.is_expired(self.id, self.value),
            Err(e) => {
                warn!("syncpt {} read failed: {e}", self.id);
                true
            }
        }
    }
}

impl FenceOps for SyncpointFence {
    fn kind(&self) -> FenceKind {
        FenceKind::Syncpoint
    }

    fn wait(&self, timeout: Timeout) -> PmuResult<()> {
        match self.dev.wait_timeout_ext(self.id, self.value, timeout) {
            Err(PmuError::TimedOut) if self.recheck() => {
                debug!("syncpt {} reached {} on forced read", self.id, self.value);
                Ok(())
            }
            other => other,
        }
    }

    fn is_expired(&self) -> bool {
        if self.dev.is_expired(self.id, self.value) {
            return true;
        }
        self.recheck()
    }

    fn syncpt(&self) -> Option<(u32, u32)> {
        Some((self.id, self.value))
    }
}
