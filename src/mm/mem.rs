// CLASSIFICATION: COMMUNITY
// Filename: mem.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Host model of a GPU memory region (system memory mapped into the GPU).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::error;

use crate::error::{PmuError, PmuResult};

const GPU_VA_START: u64 = 0x1_0000_0000;
const GPU_VA_ALIGN: u64 = 0x1000;

static NEXT_GPU_VA: AtomicU64 = AtomicU64::new(GPU_VA_START);

struct MemInner {
    gpu_va: u64,
    data: RwLock<Vec<u8>>,
}

/// Shared handle to a zero-initialised memory region. Clones alias the same
/// backing storage.
#[derive(Clone)]
pub struct MemRegion {
    inner: Arc<MemInner>,
}

impl MemRegion {
    pub fn alloc(size: usize) -> PmuResult<Self> {
        if size == 0 {
            return Err(PmuError::InvalidArgument("zero sized memory region"));
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| {
            error!("cannot allocate {size:#x} byte memory region");
            PmuError::OutOfMemory
        })?;
        data.resize(size, 0);
        let span = (size as u64).div_ceil(GPU_VA_ALIGN) * GPU_VA_ALIGN;
        let gpu_va = NEXT_GPU_VA.fetch_add(span, Ordering::Relaxed);
        Ok(Self {
            inner: Arc::new(MemInner {
                gpu_va,
                data: RwLock::new(data),
            }),
        })
    }

    /// Region initialised with `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> PmuResult<Self> {
        let mem = Self::alloc(bytes.len())?;
        mem.write(0, bytes)?;
        Ok(mem)
    }

    #[must_use]
    pub fn gpu_va(&self) -> u64 {
        self.inner.gpu_va
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> PmuResult<()> {
        let data = self.inner.data.read().map_err(|_| PmuError::LockPoisoned)?;
        let end = offset
            .checked_add(buf.len())
            .filter(|&e| e <= data.len())
            .ok_or(PmuError::InvalidArgument("read past end of memory region"))?;
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> PmuResult<()> {
        let mut data = self.inner.data.write().map_err(|_| PmuError::LockPoisoned)?;
        let end = offset
            .checked_add(src.len())
            .filter(|&e| e <= data.len())
            .ok_or(PmuError::InvalidArgument("write past end of memory region"))?;
        data[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// True when both handles alias one region.
    #[must_use]
    pub fn same_region(&self, other: &MemRegion) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRegion")
            .field("gpu_va", &format_args!("{:#x}", self.gpu_va()))
            .field("size", &self.size())
            .finish()
    }
}
