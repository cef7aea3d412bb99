// CLASSIFICATION: COMMUNITY
// Filename: mutex.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! PMU hardware mutexes.
//!
//! Sixteen mutex registers arbitrate resources the host shares with the
//! RTOS. A token is drawn from the ID register, written into the mutex
//! register and read back; the writer whose token sticks owns the mutex.
//! A software lock per mutex keeps host threads from racing each other for
//! the same register.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, error, warn};

use crate::error::{PmuError, PmuResult};
use crate::hal::RegisterIo;

pub const PWR_PMU_MUTEX_ID_R: u32 = 0x0010_a488;
pub const PWR_PMU_MUTEX_ID_RELEASE_R: u32 = 0x0010_a48c;
const PWR_PMU_MUTEX_BASE: u32 = 0x0010_a580;

/// Register of hardware mutex `index`.
#[must_use]
pub const fn pwr_pmu_mutex_r(index: u32) -> u32 {
    PWR_PMU_MUTEX_BASE + index * 4
}

pub const PMU_MUTEX_COUNT: u32 = 16;
pub const MUTEX_VALUE_MASK: u32 = 0xff;
/// Value of the mutex register when nobody holds it.
pub const MUTEX_VALUE_INITIAL: u32 = 0;
/// ID register value when the token pool is exhausted.
pub const MUTEX_ID_NOT_AVAILABLE: u32 = 0xff;

const RETRY_DELAY: Duration = Duration::from_micros(20);

/// Logical mutex ids; each maps onto the register with the same index.
pub mod mutex_id {
    pub const RSVD1: u32 = 0;
    pub const GPUSER: u32 = 1;
    pub const QUEUE_BIOS: u32 = 2;
    pub const QUEUE_SMI: u32 = 3;
    pub const GPMUTEX: u32 = 4;
    pub const I2C: u32 = 5;
    pub const RMLOCK: u32 = 6;
    pub const MSGBOX: u32 = 7;
    pub const FIFO: u32 = 8;
    pub const PG: u32 = 9;
    pub const GR: u32 = 10;
    pub const CLK: u32 = 11;
}

struct HwMutex {
    held: Mutex<bool>,
    released: Condvar,
    token: Mutex<u32>,
}

pub struct PmuMutexes {
    regs: Arc<dyn RegisterIo>,
    retries: u32,
    slots: Vec<HwMutex>,
}

impl PmuMutexes {
    pub fn new(regs: Arc<dyn RegisterIo>, retries: u32) -> PmuResult<Arc<Self>> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(PMU_MUTEX_COUNT as usize)
            .map_err(|_| PmuError::OutOfMemory)?;
        slots.extend((0..PMU_MUTEX_COUNT).map(|_| HwMutex {
            held: Mutex::new(false),
            released: Condvar::new(),
            token: Mutex::new(MUTEX_VALUE_INITIAL),
        }));
        Ok(Arc::new(Self {
            regs,
            retries: retries.max(1),
            slots,
        }))
    }

    /// Forget tokens from a previous boot.
    pub fn reset(&self) {
        for slot in &self.slots {
            if let Ok(mut t) = slot.token.lock() {
                *t = MUTEX_VALUE_INITIAL;
            }
        }
    }

    fn slot(&self, id: u32) -> PmuResult<&HwMutex> {
        self.slots
            .get(id as usize)
            .ok_or(PmuError::InvalidArgument("pmu mutex id"))
    }

    /// Acquire mutex `id`, blocking other host threads first and then
    /// competing with the RTOS. `Busy` when the register never yields.
    pub fn acquire(self: &Arc<Self>, id: u32) -> PmuResult<PmuLock> {
        let slot = self.slot(id)?;
        {
            let mut held = slot.held.lock().map_err(|_| PmuError::LockPoisoned)?;
            while *held {
                held = slot
                    .released
                    .wait(held)
                    .map_err(|_| PmuError::LockPoisoned)?;
            }
            *held = true;
        }
        match self.acquire_hw(id) {
            Ok(token) => {
                if let Ok(mut t) = slot.token.lock() {
                    *t = token;
                }
                Ok(PmuLock {
                    mutexes: Some(Arc::clone(self)),
                    id,
                    token,
                })
            }
            Err(e) => {
                self.unlock_sw(id);
                Err(e)
            }
        }
    }

    fn acquire_hw(&self, id: u32) -> PmuResult<u32> {
        let reg = pwr_pmu_mutex_r(id);
        for _ in 0..self.retries {
            let token = self.regs.read32(PWR_PMU_MUTEX_ID_R) & MUTEX_VALUE_MASK;
            if token == MUTEX_VALUE_INITIAL || token == MUTEX_ID_NOT_AVAILABLE {
                warn!("fail to generate mutex token: val {token:#x}");
                std::thread::sleep(RETRY_DELAY);
                continue;
            }
            self.regs.write32(reg, token);
            let owner = self.regs.read32(reg) & MUTEX_VALUE_MASK;
            if owner == token {
                debug!("mutex acquired: id={id}, token={token:#x}");
                return Ok(token);
            }
            debug!("fail to acquire mutex {id}, owner {owner:#x}");
            self.regs.write32(PWR_PMU_MUTEX_ID_RELEASE_R, token);
            std::thread::sleep(RETRY_DELAY);
        }
        error!("mutex {id} still busy after {} attempts", self.retries);
        Err(PmuError::Busy)
    }

    fn release_hw(&self, id: u32, token: u32) {
        let reg = pwr_pmu_mutex_r(id);
        let owner = self.regs.read32(reg) & MUTEX_VALUE_MASK;
        if owner != token {
            error!("requester {token:#x} not owner of mutex {id} (owner {owner:#x})");
        }
        self.regs.write32(reg, MUTEX_VALUE_INITIAL);
        self.regs.write32(PWR_PMU_MUTEX_ID_RELEASE_R, token);
        if let Ok(slot) = self.slot(id) {
            if let Ok(mut t) = slot.token.lock() {
                *t = MUTEX_VALUE_INITIAL;
            }
        }
        debug!("mutex released: id={id}, token={token:#x}");
    }

    fn unlock_sw(&self, id: u32) {
        if let Ok(slot) = self.slot(id) {
            let mut held = match slot.held.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            *held = false;
            slot.released.notify_one();
        }
    }

    /// Token currently holding mutex `id`, 0 when free.
    #[must_use]
    pub fn token_of(&self, id: u32) -> u32 {
        self.slot(id)
            .ok()
            .and_then(|s| s.token.lock().ok().map(|t| *t))
            .unwrap_or(MUTEX_VALUE_INITIAL)
    }
}

impl fmt::Debug for PmuMutexes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmuMutexes")
            .field("count", &self.slots.len())
            .field("retries", &self.retries)
            .finish()
    }
}

/// Held PMU mutex. Dropping it releases the register, then the host lock.
#[must_use = "the mutex is released when the guard is dropped"]
pub struct PmuLock {
    mutexes: Option<Arc<PmuMutexes>>,
    id: u32,
    token: u32,
}

impl PmuLock {
    /// Guard that holds nothing, for configurations without PMU locking.
    pub fn unlocked(id: u32) -> Self {
        Self {
            mutexes: None,
            id,
            token: MUTEX_VALUE_INITIAL,
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn token(&self) -> u32 {
        self.token
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.mutexes.is_some()
    }
}

impl Drop for PmuLock {
    fn drop(&mut self) {
        if let Some(m) = self.mutexes.take() {
            m.release_hw(self.id, self.token);
            m.unlock_sw(self.id);
        }
    }
}

impl fmt::Debug for PmuLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmuLock")
            .field("id", &self.id)
            .field("token", &format_args!("{:#x}", self.token))
            .field("held", &self.is_held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimRegisters;

    #[test]
    fn guard_releases_register_and_token() {
        let regs = SimRegisters::new();
        let mutexes = PmuMutexes::new(regs.clone(), 4).unwrap();
        {
            let lock = mutexes.acquire(mutex_id::FIFO).unwrap();
            assert!(lock.is_held());
            assert_eq!(regs.read32(pwr_pmu_mutex_r(mutex_id::FIFO)), lock.token());
            assert_eq!(mutexes.token_of(mutex_id::FIFO), lock.token());
        }
        assert_eq!(regs.read32(pwr_pmu_mutex_r(mutex_id::FIFO)), MUTEX_VALUE_INITIAL);
        assert_eq!(regs.tokens_outstanding(), 0);
    }

    #[test]
    fn register_held_by_firmware_reports_busy() {
        let regs = SimRegisters::new();
        regs.hold_mutex_for_firmware(mutex_id::PG, 0x42);
        let mutexes = PmuMutexes::new(regs.clone(), 3).unwrap();
        assert_eq!(mutexes.acquire(mutex_id::PG).unwrap_err(), PmuError::Busy);
        // The host lock was dropped with the failure.
        regs.hold_mutex_for_firmware(mutex_id::PG, MUTEX_VALUE_INITIAL);
        assert!(mutexes.acquire(mutex_id::PG).is_ok());
    }

    #[test]
    fn out_of_range_id_is_rejected() {
        let regs = SimRegisters::new();
        let mutexes = PmuMutexes::new(regs, 1).unwrap();
        assert!(matches!(
            mutexes.acquire(PMU_MUTEX_COUNT),
            Err(PmuError::InvalidArgument(_))
        ));
    }
}
