// CLASSIFICATION: COMMUNITY
// Filename: pg.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Power-gating bookkeeping the RTOS lifecycle touches.

use std::sync::{Condvar, Mutex};

use log::debug;

use crate::error::{PmuError, PmuResult};
use crate::util::{FencedBool, Timeout};

#[derive(Debug, Default)]
pub struct PgState {
    initialized: FencedBool,
    /// Sticky once the RTOS is told to exit.
    state_destroy: FencedBool,
    state_change: Mutex<u64>,
    changed: Condvar,
}

impl PgState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sw_setup(&self) {
        self.state_destroy.publish(false);
        self.initialized.publish(true);
        debug!("power gating state set up");
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.observe()
    }

    #[must_use]
    pub fn state_destroy(&self) -> bool {
        self.state_destroy.observe()
    }

    pub fn set_state_destroy(&self) {
        self.state_destroy.publish(true);
    }

    /// Wake whoever waits for an RTOS state change.
    pub fn signal_state_change(&self) {
        let mut gen = match self.state_change.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *gen = gen.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Number of state-change signals so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state_change.lock().map(|g| *g).unwrap_or(0)
    }

    /// Block until a signal newer than `seen` arrives.
    pub fn wait_state_change(&self, seen: u64, timeout: Timeout) -> PmuResult<u64> {
        let mut gen = self.state_change.lock().map_err(|_| PmuError::LockPoisoned)?;
        while *gen == seen {
            match timeout.remaining() {
                None => {
                    gen = self.changed.wait(gen).map_err(|_| PmuError::LockPoisoned)?;
                }
                Some(left) if left.is_zero() => return Err(PmuError::TimedOut),
                Some(left) => {
                    gen = self
                        .changed
                        .wait_timeout(gen, left)
                        .map_err(|_| PmuError::LockPoisoned)?
                        .0;
                }
            }
        }
        Ok(*gen)
    }

    pub fn destroy(&self) {
        self.initialized.publish(false);
        self.signal_state_change();
    }
}
