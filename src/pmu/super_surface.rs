// CLASSIFICATION: COMMUNITY
// Filename: super_surface.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! System-memory region shared with FB-queue capable firmware.
//!
//! The layout is fixed: HPQ elements, then LPQ elements, then message
//! elements. The RTOS is told the base and size through the boot arguments.

use once_cell::sync::OnceCell;

use log::info;

use crate::error::{PmuError, PmuResult};
use crate::mm::MemRegion;
use crate::pmu::queue::{
    QueueId, FBQ_CMD_ELEMENT_SIZE, FBQ_CMD_NUM_ELEMENTS, FBQ_MSG_ELEMENT_SIZE,
    FBQ_MSG_NUM_ELEMENTS,
};

const CMDQ_BYTES: u32 = FBQ_CMD_NUM_ELEMENTS * FBQ_CMD_ELEMENT_SIZE;
pub const SS_HPQ_OFFSET: u32 = 0;
pub const SS_LPQ_OFFSET: u32 = SS_HPQ_OFFSET + CMDQ_BYTES;
pub const SS_MSGQ_OFFSET: u32 = SS_LPQ_OFFSET + CMDQ_BYTES;
pub const SUPER_SURFACE_SIZE: u32 = SS_MSGQ_OFFSET + FBQ_MSG_NUM_ELEMENTS * FBQ_MSG_ELEMENT_SIZE;

#[derive(Debug, Default)]
pub struct SuperSurface {
    buf: OnceCell<MemRegion>,
}

impl SuperSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the backing buffer. Later calls keep the first buffer.
    pub fn alloc_buf(&self) -> PmuResult<&MemRegion> {
        let mem = self
            .buf
            .get_or_try_init(|| MemRegion::alloc(SUPER_SURFACE_SIZE as usize))?;
        info!(
            "super surface at {:#x}, {:#x} bytes",
            mem.gpu_va(),
            SUPER_SURFACE_SIZE
        );
        Ok(mem)
    }

    pub fn mem(&self) -> PmuResult<&MemRegion> {
        self.buf.get().ok_or(PmuError::NotReady)
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        SUPER_SURFACE_SIZE
    }

    /// Offset of a queue's element array, `None` for queues not in the surface.
    #[must_use]
    pub fn fbq_offset(id: QueueId) -> Option<u32> {
        match id {
            QueueId::Hpq => Some(SS_HPQ_OFFSET),
            QueueId::Lpq => Some(SS_LPQ_OFFSET),
            QueueId::Msg => Some(SS_MSGQ_OFFSET),
            QueueId::Bios | QueueId::Smi => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_packs_queues_back_to_back() {
        assert_eq!(SuperSurface::fbq_offset(QueueId::Lpq), Some(0x4000));
        assert_eq!(SuperSurface::fbq_offset(QueueId::Msg), Some(0x8000));
        assert_eq!(SUPER_SURFACE_SIZE, 0x8800);
        assert_eq!(SuperSurface::fbq_offset(QueueId::Smi), None);
    }

    #[test]
    fn buffer_is_allocated_once() {
        let ss = SuperSurface::new();
        assert_eq!(ss.mem().unwrap_err(), PmuError::NotReady);
        let a = ss.alloc_buf().unwrap().clone();
        let b = ss.alloc_buf().unwrap();
        assert!(a.same_region(b));
        assert_eq!(b.size(), SUPER_SURFACE_SIZE as usize);
    }
}
