// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! PMU command and message queues.

use std::sync::Arc;

use log::{error, info};

use crate::error::{PmuError, PmuResult};
use crate::hal::FalconHal;
use crate::mm::MemRegion;
use crate::pmu::msg::PmuInitMsg;

pub mod emem;
pub mod fbq;

pub use emem::{EngineMemQueue, MemKind};
pub use fbq::{FbQueue, FbqHdr, FbqWorkBuffer, FBQ_HDR_SIZE};

pub const PMU_QUEUE_COUNT: usize = 5;
pub const QUEUE_ALIGNMENT: u32 = 4;

pub const FBQ_CMD_NUM_ELEMENTS: u32 = 16;
pub const FBQ_CMD_ELEMENT_SIZE: u32 = 0x400;
pub const FBQ_MSG_NUM_ELEMENTS: u32 = 16;
pub const FBQ_MSG_ELEMENT_SIZE: u32 = 0x80;

#[must_use]
pub fn align_up(v: u32, align: u32) -> u32 {
    (v + align - 1) & !(align - 1)
}

/// Logical queue ids. Only HPQ and LPQ accept host commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QueueId {
    Hpq = 0,
    Lpq = 1,
    Bios = 2,
    Smi = 3,
    Msg = 4,
}

impl QueueId {
    pub const ALL: [QueueId; PMU_QUEUE_COUNT] = [
        QueueId::Hpq,
        QueueId::Lpq,
        QueueId::Bios,
        QueueId::Smi,
        QueueId::Msg,
    ];

    #[must_use]
    pub fn from_u8(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    #[must_use]
    pub fn is_sw_command_queue(self) -> bool {
        matches!(self, QueueId::Hpq | QueueId::Lpq)
    }
}

/// Who advances the cursor on the host side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OFlag {
    /// Host pushes, firmware pops.
    Write,
    /// Firmware pushes, host pops.
    Read,
}

pub enum PmuQueue {
    Dmem(EngineMemQueue),
    Fb(FbQueue),
}

impl PmuQueue {
    #[must_use]
    pub fn id(&self) -> QueueId {
        match self {
            PmuQueue::Dmem(q) => q.id(),
            PmuQueue::Fb(q) => q.id(),
        }
    }

    /// Capacity in bytes; for FB queues the element size.
    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            PmuQueue::Dmem(q) => q.size(),
            PmuQueue::Fb(q) => q.element_size(),
        }
    }

    pub fn pop(&self, buf: &mut [u8]) -> PmuResult<usize> {
        match self {
            PmuQueue::Dmem(q) => q.pop(buf),
            PmuQueue::Fb(q) => q.pop(buf),
        }
    }

    pub fn rewind(&self) -> PmuResult<()> {
        match self {
            PmuQueue::Dmem(q) => q.rewind(),
            // FB queues wrap by element index and never see REWIND.
            PmuQueue::Fb(_) => Ok(()),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            PmuQueue::Dmem(q) => q.is_empty(),
            PmuQueue::Fb(q) => q.is_empty(),
        }
    }
}

/// Queue set described by the RTOS INIT message.
pub struct PmuQueues {
    queues: Vec<Option<PmuQueue>>,
    fb_mode: bool,
}

impl PmuQueues {
    pub fn init(
        falcon: &Arc<dyn FalconHal>,
        init: &PmuInitMsg,
        surface: Option<&MemRegion>,
    ) -> PmuResult<Self> {
        let mut queues = Vec::with_capacity(PMU_QUEUE_COUNT);
        if init.fb_queues && surface.is_none() {
            error!("RTOS requested FB queues but no super surface is set up");
            return Err(PmuError::InvalidArgument("fb queues without super surface"));
        }
        for id in QueueId::ALL {
            let info = init.queue(id);
            if info.size == 0 {
                queues.push(None);
                continue;
            }
            let q = match surface {
                Some(surface) if init.fb_queues => {
                    let element_size = if id == QueueId::Msg {
                        FBQ_MSG_ELEMENT_SIZE
                    } else {
                        FBQ_CMD_ELEMENT_SIZE
                    };
                    PmuQueue::Fb(FbQueue::new(
                        Arc::clone(falcon),
                        surface.clone(),
                        id,
                        u32::from(info.index),
                        info.offset,
                        u32::from(info.size),
                        element_size,
                    )?)
                }
                _ => PmuQueue::Dmem(EngineMemQueue::new(
                    Arc::clone(falcon),
                    id,
                    u32::from(info.index),
                    info.offset,
                    u32::from(info.size),
                    MemKind::Dmem,
                )?),
            };
            queues.push(Some(q));
        }
        if queues[QueueId::Msg as usize].is_none() {
            error!("RTOS init message carries no message queue");
            return Err(PmuError::InvalidArgument("missing message queue"));
        }
        info!(
            "PMU queues ready ({} mode)",
            if init.fb_queues { "FB queue" } else { "DMEM" }
        );
        Ok(Self {
            queues,
            fb_mode: init.fb_queues,
        })
    }

    pub fn get(&self, id: QueueId) -> PmuResult<&PmuQueue> {
        self.queues[id as usize]
            .as_ref()
            .ok_or(PmuError::InvalidArgument("queue not initialised"))
    }

    #[must_use]
    pub fn is_fb_mode(&self) -> bool {
        self.fb_mode
    }

    pub fn queue_size(&self, id: QueueId) -> PmuResult<u32> {
        Ok(self.get(id)?.size())
    }

    pub fn message_queue(&self) -> PmuResult<&PmuQueue> {
        self.get(QueueId::Msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up_to_queue_alignment() {
        assert_eq!(align_up(0, QUEUE_ALIGNMENT), 0);
        assert_eq!(align_up(1, QUEUE_ALIGNMENT), 4);
        assert_eq!(align_up(8, QUEUE_ALIGNMENT), 8);
        assert_eq!(align_up(13, QUEUE_ALIGNMENT), 16);
    }

    #[test]
    fn only_hpq_and_lpq_take_commands() {
        let sw: Vec<_> = QueueId::ALL
            .iter()
            .filter(|q| q.is_sw_command_queue())
            .collect();
        assert_eq!(sw, vec![&QueueId::Hpq, &QueueId::Lpq]);
        assert_eq!(QueueId::from_u8(4), Some(QueueId::Msg));
        assert_eq!(QueueId::from_u8(5), None);
    }
}
