// CLASSIFICATION: COMMUNITY
// Filename: pool.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Preallocated fence slots for submission paths that must not allocate.

use std::sync::Arc;

use log::warn;

use super::{Fence, OsFence, Semaphore, SemaphoreFence, SyncpointDevice, SyncpointFence, WaitQueue};
use crate::error::{PmuError, PmuResult};
use crate::mm::LocklessAllocator;

/// Slots are addressed as blocks of this size from a synthetic base.
const FENCE_SLOT_SIZE: u64 = 64;
const FENCE_POOL_BASE: u64 = 0x1000;

/// A reserved pool slot, returned to the pool on drop.
#[derive(Debug)]
pub struct FenceSlot {
    pool: Arc<LocklessAllocator>,
    addr: u64,
}

impl FenceSlot {
    #[must_use]
    pub fn index(&self) -> u32 {
        ((self.addr - self.pool.base()) / FENCE_SLOT_SIZE) as u32
    }
}

impl Drop for FenceSlot {
    fn drop(&mut self) {
        self.pool.free(self.addr);
    }
}

#[derive(Debug, Clone)]
pub struct FencePool {
    alloc: Arc<LocklessAllocator>,
}

impl FencePool {
    pub fn new(count: u32) -> PmuResult<Self> {
        let alloc = LocklessAllocator::init(
            "fence_pool",
            FENCE_POOL_BASE,
            u64::from(count) * FENCE_SLOT_SIZE,
            FENCE_SLOT_SIZE,
            0,
        )?;
        Ok(Self {
            alloc: Arc::new(alloc),
        })
    }

    pub fn reserve(&self) -> PmuResult<FenceSlot> {
        match self.alloc.alloc(FENCE_SLOT_SIZE) {
            0 => {
                warn!("fence pool exhausted ({} slots)", self.capacity());
                Err(PmuError::OutOfMemory)
            }
            addr => Ok(FenceSlot {
                pool: Arc::clone(&self.alloc),
                addr,
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.alloc.node_count()
    }

    #[must_use]
    pub fn in_use(&self) -> u32 {
        self.alloc.alloc_count().max(0) as u32
    }

    pub fn fence_from_semaphore(
        &self,
        sema: Arc<Semaphore>,
        wq: Arc<WaitQueue>,
        os_fence: OsFence,
    ) -> PmuResult<Fence> {
        let slot = self.reserve()?;
        Ok(Fence::build(
            Box::new(SemaphoreFence::new(sema, wq)),
            os_fence,
            Some(slot),
        ))
    }

    pub fn fence_from_syncpoint(
        &self,
        dev: Arc<dyn SyncpointDevice>,
        id: u32,
        value: u32,
        os_fence: OsFence,
    ) -> PmuResult<Fence> {
        let slot = self.reserve()?;
        Ok(Fence::build(
            Box::new(SyncpointFence::new(dev, id, value)),
            os_fence,
            Some(slot),
        ))
    }
}
