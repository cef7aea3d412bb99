// CLASSIFICATION: COMMUNITY
// Filename: emem.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Ring queues in falcon DMEM/EMEM.
//!
//! The host writes command queues and reads the message queue; the RTOS
//! does the opposite. Head and tail live in falcon registers. A writer that
//! runs out of room at the end of the ring writes a REWIND header and wraps
//! to `offset`; the reader follows when it sees that header.

use std::sync::{Arc, Mutex};

use log::{debug, error, warn};

use super::{align_up, OFlag, QueueId, QUEUE_ALIGNMENT};
use crate::error::{PmuError, PmuResult};
use crate::hal::FalconHal;
use crate::pmu::msg::{PmuHdr, PMU_CMD_HDR_SIZE, PMU_UNIT_REWIND};

/// Which falcon memory backs the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemKind {
    Dmem,
    Emem,
}

pub struct EngineMemQueue {
    id: QueueId,
    index: u32,
    offset: u32,
    size: u32,
    oflag: OFlag,
    mem: MemKind,
    falcon: Arc<dyn FalconHal>,
    lock: Mutex<()>,
}

impl EngineMemQueue {
    pub fn new(
        falcon: Arc<dyn FalconHal>,
        id: QueueId,
        index: u32,
        offset: u32,
        size: u32,
        mem: MemKind,
    ) -> PmuResult<Self> {
        if size < PMU_CMD_HDR_SIZE * 2 || offset % QUEUE_ALIGNMENT != 0 {
            error!("queue {id:?}: bad geometry offset={offset:#x} size={size:#x}");
            return Err(PmuError::InvalidArgument("queue geometry"));
        }
        let oflag = if id.is_sw_command_queue() {
            OFlag::Write
        } else {
            OFlag::Read
        };
        debug!("queue {id:?}: index={index} offset={offset:#x} size={size:#x} {oflag:?}");
        Ok(Self {
            id,
            index,
            offset,
            size,
            oflag,
            mem,
            falcon,
            lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn oflag(&self) -> OFlag {
        self.oflag
    }

    fn head(&self) -> u32 {
        match self.id {
            QueueId::Msg => self.falcon.msgq_head(),
            _ => self.falcon.queue_head(self.index),
        }
    }

    fn set_head(&self, head: u32) {
        match self.id {
            QueueId::Msg => self.falcon.set_msgq_head(head),
            _ => self.falcon.set_queue_head(self.index, head),
        }
    }

    fn tail(&self) -> u32 {
        match self.id {
            QueueId::Msg => self.falcon.msgq_tail(),
            _ => self.falcon.queue_tail(self.index),
        }
    }

    fn set_tail(&self, tail: u32) {
        match self.id {
            QueueId::Msg => self.falcon.set_msgq_tail(tail),
            _ => self.falcon.set_queue_tail(self.index, tail),
        }
    }

    fn copy_to(&self, dst: u32, data: &[u8]) -> PmuResult<()> {
        match self.mem {
            MemKind::Dmem => self.falcon.copy_to_dmem(dst, data),
            MemKind::Emem => self.falcon.copy_to_emem(dst, data),
        }
    }

    fn copy_from(&self, src: u32, buf: &mut [u8]) -> PmuResult<()> {
        match self.mem {
            MemKind::Dmem => self.falcon.copy_from_dmem(src, buf),
            MemKind::Emem => self.falcon.copy_from_emem(src, buf),
        }
    }

    fn in_ring(&self, pos: u32) -> bool {
        pos >= self.offset && pos < self.offset + self.size
    }

    /// `(room, need_rewind)` for an aligned write of `size` bytes.
    fn has_room(&self, size: u32) -> (bool, bool) {
        let mut head = self.head();
        let tail = self.tail();
        let size = align_up(size, QUEUE_ALIGNMENT);
        let mut q_free = 0u32;
        let mut rewind = false;

        if head >= tail {
            q_free = (self.offset + self.size)
                .saturating_sub(head)
                .saturating_sub(PMU_CMD_HDR_SIZE);
            if size > q_free {
                rewind = true;
                head = self.offset;
            }
        }
        if head < tail {
            q_free = tail - head - 1;
        }
        (size <= q_free, rewind)
    }

    /// Room check without writing, for callers that want to throttle.
    #[must_use]
    pub fn has_room_for(&self, size: u32) -> bool {
        self.has_room(size).0
    }

    /// Write one packet at the head. `NoSpace` when the ring is full.
    pub fn push(&self, data: &[u8]) -> PmuResult<()> {
        if self.oflag != OFlag::Write {
            error!("queue {:?}: push on a read queue", self.id);
            return Err(PmuError::InvalidArgument("push on read queue"));
        }
        let _guard = self.lock.lock().map_err(|_| PmuError::LockPoisoned)?;

        let (room, rewind) = self.has_room(data.len() as u32);
        if !room {
            debug!("queue {:?}: no room for {} bytes", self.id, data.len());
            return Err(PmuError::NoSpace);
        }
        if rewind {
            self.write_rewind()?;
        }
        let head = self.head();
        if !self.in_ring(head) {
            error!("queue {:?}: head {head:#x} outside ring", self.id);
            return Err(PmuError::Io("queue head corrupted".into()));
        }
        self.copy_to(head, data)?;
        self.set_head(head + align_up(data.len() as u32, QUEUE_ALIGNMENT));
        Ok(())
    }

    fn write_rewind(&self) -> PmuResult<()> {
        let hdr = PmuHdr {
            unit_id: PMU_UNIT_REWIND,
            size: PMU_CMD_HDR_SIZE as u8,
            ctrl_flags: 0,
            seq_id: 0,
        };
        self.copy_to(self.head(), &hdr.to_bytes())?;
        self.set_head(self.offset);
        debug!("queue {:?}: rewound", self.id);
        Ok(())
    }

    /// Read up to `buf.len()` bytes from the tail. Returns the bytes read,
    /// zero when empty.
    pub fn pop(&self, buf: &mut [u8]) -> PmuResult<usize> {
        if self.oflag != OFlag::Read {
            error!("queue {:?}: pop on a write queue", self.id);
            return Err(PmuError::InvalidArgument("pop on write queue"));
        }
        let _guard = self.lock.lock().map_err(|_| PmuError::LockPoisoned)?;

        let head = self.head();
        let tail = self.tail();
        if head == tail {
            return Ok(0);
        }
        if !self.in_ring(tail) {
            error!("queue {:?}: tail {tail:#x} outside ring", self.id);
            return Err(PmuError::Io("queue tail corrupted".into()));
        }
        let used = if head > tail {
            head - tail
        } else {
            self.offset + self.size - tail
        };
        let mut size = buf.len() as u32;
        if size > used {
            warn!("queue {:?}: requested {size} bytes, only {used} used", self.id);
            size = used;
        }
        self.copy_from(tail, &mut buf[..size as usize])?;
        self.set_tail(tail + align_up(size, QUEUE_ALIGNMENT));
        Ok(size as usize)
    }

    /// Reader: jump the tail back to the ring start. Writer: emit a REWIND
    /// header and wrap the head.
    pub fn rewind(&self) -> PmuResult<()> {
        let _guard = self.lock.lock().map_err(|_| PmuError::LockPoisoned)?;
        match self.oflag {
            OFlag::Write => self.write_rewind(),
            OFlag::Read => {
                self.set_tail(self.offset);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimFalcon;

    fn queue(falcon: &Arc<SimFalcon>, id: QueueId, offset: u32, size: u32) -> EngineMemQueue {
        let hal: Arc<dyn FalconHal> = falcon.clone();
        match id {
            QueueId::Msg => {
                falcon.set_msgq_head(offset);
                falcon.set_msgq_tail(offset);
            }
            _ => {
                falcon.set_queue_head(0, offset);
                falcon.set_queue_tail(0, offset);
            }
        }
        EngineMemQueue::new(hal, id, 0, offset, size, MemKind::Dmem).unwrap()
    }

    #[test]
    fn write_side_rewinds_when_tail_end_is_short() {
        let falcon = SimFalcon::new();
        let q = queue(&falcon, QueueId::Hpq, 0x100, 0x40);
        q.push(&[1u8; 0x28]).unwrap();
        // Firmware consumed everything.
        falcon.set_queue_tail(0, 0x128);
        // 0x40 - 0x28 - hdr leaves 0x14 bytes at the end of the ring.
        assert_eq!(q.has_room(0x10), (true, false));
        assert_eq!(q.has_room(0x18), (true, true));
        q.push(&[2u8; 0x18]).unwrap();
        assert_eq!(falcon.queue_head(0), 0x118);
        let mut hdr = [0u8; 4];
        falcon.copy_from_dmem(0x128, &mut hdr).unwrap();
        assert_eq!(hdr, [PMU_UNIT_REWIND, PMU_CMD_HDR_SIZE as u8, 0, 0]);
        let mut first = [0u8; 1];
        falcon.copy_from_dmem(0x100, &mut first).unwrap();
        assert_eq!(first[0], 2);
    }

    #[test]
    fn full_ring_reports_no_space() {
        let falcon = SimFalcon::new();
        let q = queue(&falcon, QueueId::Lpq, 0x200, 0x40);
        q.push(&[0u8; 0x30]).unwrap();
        assert_eq!(q.push(&[0u8; 0x10]), Err(PmuError::NoSpace));
    }

    #[test]
    fn read_side_clamps_to_used_bytes() {
        let falcon = SimFalcon::new();
        let q = queue(&falcon, QueueId::Msg, 0x300, 0x40);
        falcon.copy_to_dmem(0x300, &[7u8; 8]).unwrap();
        falcon.set_msgq_head(0x308);
        let mut buf = [0u8; 16];
        assert_eq!(q.pop(&mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], &[7u8; 8]);
        assert!(q.is_empty());
        assert_eq!(q.pop(&mut buf).unwrap(), 0);
    }
}
