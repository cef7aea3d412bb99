// CLASSIFICATION: COMMUNITY
// Filename: timeout.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

use std::time::{Duration, Instant};

/// First sleep of a polling wait.
pub const POLL_DELAY_MIN_US: u64 = 10;
/// Backoff cap of a polling wait.
pub const POLL_DELAY_MAX_US: u64 = 200;

/// Deadline used by every polling wait in the crate.
#[derive(Clone, Copy, Debug)]
pub struct Timeout {
    deadline: Option<Instant>,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(duration),
        }
    }

    /// `u64::MAX` means wait forever.
    pub fn from_ms(ms: u64) -> Self {
        if ms == u64::MAX {
            Self::infinite()
        } else {
            Self::new(Duration::from_millis(ms))
        }
    }

    pub fn infinite() -> Self {
        Self { deadline: None }
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        match self.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }

    /// Time left, `None` when infinite.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Doubling sleep between `POLL_DELAY_MIN_US` and `POLL_DELAY_MAX_US`.
#[derive(Debug)]
pub struct Backoff {
    delay_us: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay_us: POLL_DELAY_MIN_US,
        }
    }

    #[must_use]
    pub fn current_us(&self) -> u64 {
        self.delay_us
    }

    /// Sleep for the current delay (never past `timeout`), then double it.
    pub fn sleep(&mut self, timeout: &Timeout) {
        let mut d = Duration::from_micros(self.delay_us);
        if let Some(left) = timeout.remaining() {
            d = d.min(left);
        }
        std::thread::sleep(d);
        self.delay_us = (self.delay_us << 1).min(POLL_DELAY_MAX_US);
    }
}
