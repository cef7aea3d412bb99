// CLASSIFICATION: COMMUNITY
// Filename: sema.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Semaphore-backed fences.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::warn;

use super::{FenceKind, FenceOps};
use crate::error::{PmuError, PmuResult};
use crate::util::Timeout;

/// GPU semaphore slot. It stays acquired until the GPU writes a payload at
/// or past the threshold captured when the job was submitted.
#[derive(Debug)]
pub struct Semaphore {
    payload: AtomicU32,
    threshold: u32,
}

impl Semaphore {
    pub fn new(threshold: u32) -> Arc<Self> {
        Arc::new(Self {
            payload: AtomicU32::new(threshold.wrapping_sub(1)),
            threshold,
        })
    }

    #[must_use]
    pub fn is_acquired(&self) -> bool {
        (self.payload.load(Ordering::Acquire).wrapping_sub(self.threshold) as i32) < 0
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// GPU-side release. Waiters on the queue are woken by the caller.
    pub fn release(&self) {
        self.payload.store(self.threshold, Ordering::Release);
    }
}

/// Semaphore wake-up queue.
#[derive(Debug, Default)]
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wake_all(&self) {
        // Taking the lock orders the wake-up after a waiter's predicate check.
        let _g = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until `done` holds or `timeout` expires.
    pub fn wait_until(&self, timeout: Timeout, mut done: impl FnMut() -> bool) -> PmuResult<()> {
        let mut guard = self.lock.lock().map_err(|_| PmuError::LockPoisoned)?;
        loop {
            if done() {
                return Ok(());
            }
            match timeout.remaining() {
                None => {
                    guard = self.cond.wait(guard).map_err(|_| PmuError::LockPoisoned)?;
                }
                Some(left) if left.is_zero() => return Err(PmuError::TimedOut),
                Some(left) => {
                    guard = self
                        .cond
                        .wait_timeout(guard, left)
                        .map_err(|_| PmuError::LockPoisoned)?
                        .0;
                }
            }
        }
    }
}

pub struct SemaphoreFence {
    sema: Arc<Semaphore>,
    wq: Arc<WaitQueue>,
}

impl SemaphoreFence {
    pub fn new(sema: Arc<Semaphore>, wq: Arc<WaitQueue>) -> Self {
        Self { sema, wq }
    }
}

impl FenceOps for SemaphoreFence {
    fn kind(&self) -> FenceKind {
        FenceKind::Semaphore
    }

    fn wait(&self, timeout: Timeout) -> PmuResult<()> {
        if !self.sema.is_acquired() {
            return Ok(());
        }
        self.wq.wait_until(timeout, || !self.sema.is_acquired()).map_err(|e| {
            if e == PmuError::TimedOut {
                warn!("semaphore fence wait timed out, threshold {}", self.sema.threshold());
            }
            e
        })
    }

    fn is_expired(&self) -> bool {
        !self.sema.is_acquired()
    }
}
