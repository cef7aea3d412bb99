// CLASSIFICATION: COMMUNITY
// Filename: fbq.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Element rings in the system-memory super surface.
//!
//! A command FB queue element carries an [`FbqHdr`], the command, and a
//! payload heap, so large payloads travel with the command instead of
//! through DMEM. The host builds an element in the work buffer, pushes it,
//! and keeps it marked in use until the reply arrives; only then may the
//! tail sweep past it. Message FB queue elements hold one message each.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, trace};

use super::{OFlag, QueueId};
use crate::error::{PmuError, PmuResult};
use crate::hal::FalconHal;
use crate::mm::MemRegion;
use crate::pmu::msg::{PmuHdr, PMU_MSG_HDR_SIZE};

pub const FBQ_HDR_SIZE: u32 = 8;

/// Element header of a command FB queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FbqHdr {
    pub heap_size: u16,
    pub heap_offset: u16,
    pub element_index: u8,
}

impl FbqHdr {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FBQ_HDR_SIZE as usize] {
        let hs = self.heap_size.to_le_bytes();
        let ho = self.heap_offset.to_le_bytes();
        [hs[0], hs[1], ho[0], ho[1], self.element_index, 0, 0, 0]
    }

    #[must_use]
    pub fn from_bytes(b: &[u8]) -> Self {
        Self {
            heap_size: u16::from_le_bytes([b[0], b[1]]),
            heap_offset: u16::from_le_bytes([b[2], b[3]]),
            element_index: b[4],
        }
    }
}

struct FbqState {
    /// Host-tracked tail of a command queue.
    tail: u32,
    element_in_use: Vec<bool>,
    read_position: u32,
}

pub struct FbQueue {
    id: QueueId,
    index: u32,
    fb_offset: u32,
    size: u32,
    element_size: u32,
    oflag: OFlag,
    falcon: Arc<dyn FalconHal>,
    surface: MemRegion,
    state: Mutex<FbqState>,
    work_buffer: Mutex<Vec<u8>>,
}

/// Exclusive access to a queue's work buffer. Held from element build until
/// the push completes.
pub type FbqWorkBuffer<'a> = MutexGuard<'a, Vec<u8>>;

impl FbQueue {
    pub fn new(
        falcon: Arc<dyn FalconHal>,
        surface: MemRegion,
        id: QueueId,
        index: u32,
        fb_offset: u32,
        size: u32,
        element_size: u32,
    ) -> PmuResult<Self> {
        let end = u64::from(fb_offset) + u64::from(size) * u64::from(element_size);
        if size < 2 || element_size <= FBQ_HDR_SIZE || end > surface.size() as u64 {
            error!("fbq {id:?}: bad geometry offset={fb_offset:#x} {size}x{element_size:#x}");
            return Err(PmuError::InvalidArgument("fb queue geometry"));
        }
        let oflag = if id.is_sw_command_queue() {
            OFlag::Write
        } else {
            OFlag::Read
        };
        let mut work = Vec::new();
        work.try_reserve_exact(element_size as usize)
            .map_err(|_| PmuError::OutOfMemory)?;
        work.resize(element_size as usize, 0);
        debug!("fbq {id:?}: index={index} offset={fb_offset:#x} {size}x{element_size:#x} {oflag:?}");
        Ok(Self {
            id,
            index,
            fb_offset,
            size,
            element_size,
            oflag,
            falcon,
            surface,
            state: Mutex::new(FbqState {
                tail: 0,
                element_in_use: vec![false; size as usize],
                read_position: 0,
            }),
            work_buffer: Mutex::new(work),
        })
    }

    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Elements in the ring.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    /// Byte offset of element `index` inside the super surface.
    #[must_use]
    pub fn element_offset(&self, index: u32) -> u32 {
        self.fb_offset + index * self.element_size
    }

    /// System memory address of element `index`, as the RTOS sees it.
    #[must_use]
    pub fn element_gpu_va(&self, index: u32) -> u64 {
        self.surface.gpu_va() + u64::from(self.element_offset(index))
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

    fn lock_state(&self) -> PmuResult<MutexGuard<'_, FbqState>> {
        self.state.lock().map_err(|_| PmuError::LockPoisoned)
    }

    pub fn work_buffer_lock(&self) -> PmuResult<FbqWorkBuffer<'_>> {
        self.work_buffer.lock().map_err(|_| PmuError::LockPoisoned)
    }

    /// Index the next push will land in.
    #[must_use]
    pub fn next_element(&self) -> u32 {
        self.head()
    }

    fn sweep(&self, st: &mut FbqState) {
        let head = self.head();
        let mut tail = st.tail;
        while tail != head && !st.element_in_use[tail as usize] {
            tail = (tail + 1) % self.size;
        }
        st.tail = tail;
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        match self.lock_state() {
            Ok(mut st) => {
                self.sweep(&mut st);
                (self.head() + 1) % self.size == st.tail
            }
            Err(_) => true,
        }
    }

    /// Copy the work buffer into the head element and publish it.
    pub fn push(&self, work: &FbqWorkBuffer<'_>) -> PmuResult<u32> {
        if self.oflag != OFlag::Write {
            return Err(PmuError::InvalidArgument("push on read fb queue"));
        }
        let mut st = self.lock_state()?;
        self.sweep(&mut st);
        let head = self.head();
        if (head + 1) % self.size == st.tail {
            debug!("fbq {:?}: full", self.id);
            return Err(PmuError::NoSpace);
        }
        self.surface
            .write(self.element_offset(head) as usize, &work[..self.element_size as usize])?;
        st.element_in_use[head as usize] = true;
        self.set_head((head + 1) % self.size);
        trace!("fbq {:?}: pushed element {head}", self.id);
        Ok(head)
    }

    /// The firmware is done with `index`; let the tail move past it.
    pub fn free_element(&self, index: u32) -> PmuResult<()> {
        if index >= self.size {
            return Err(PmuError::InvalidArgument("fb queue element index"));
        }
        let mut st = self.lock_state()?;
        st.element_in_use[index as usize] = false;
        self.sweep(&mut st);
        Ok(())
    }

    /// Read payload bytes back out of element `index`.
    pub fn read_element(&self, index: u32, offset: u32, buf: &mut [u8]) -> PmuResult<()> {
        if index >= self.size || offset as usize + buf.len() > self.element_size as usize {
            return Err(PmuError::InvalidArgument("fb queue element range"));
        }
        self.surface
            .read((self.element_offset(index) + offset) as usize, buf)
    }

    /// Message side: copy up to `buf.len()` bytes of the current element.
    /// The tail advances once the whole message has been consumed.
    pub fn pop(&self, buf: &mut [u8]) -> PmuResult<usize> {
        if self.oflag != OFlag::Read {
            return Err(PmuError::InvalidArgument("pop on write fb queue"));
        }
        let mut st = self.lock_state()?;
        let head = self.head();
        let tail = self.falcon.msgq_tail();
        if head == tail {
            return Ok(0);
        }
        let mut work = self.work_buffer_lock()?;
        if st.read_position == 0 {
            self.surface.read(self.element_offset(tail) as usize, &mut work[..])?;
        }
        let rp = st.read_position as usize;
        let n = buf.len().min(self.element_size as usize - rp);
        buf[..n].copy_from_slice(&work[rp..rp + n]);
        st.read_position += n as u32;

        let hdr = PmuHdr::from_bytes([work[0], work[1], work[2], work[3]]);
        // A header may claim more than one element holds.
        let msg_size = u32::from(hdr.size).clamp(PMU_MSG_HDR_SIZE, self.element_size);
        if st.read_position >= msg_size {
            if u32::from(hdr.size) > self.element_size {
                error!(
                    "fbq {:?}: element {tail} claims {:#x} bytes, element is {:#x}",
                    self.id, hdr.size, self.element_size
                );
            }
            st.read_position = 0;
            self.falcon.set_msgq_tail((tail + 1) % self.size);
        }
        Ok(n)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self.id {
            QueueId::Msg => self.head() == self.falcon.msgq_tail(),
            _ => self.lock_state().map(|st| st.tail == self.head()).unwrap_or(true),
        }
    }

    /// Elements still awaiting a reply.
    #[must_use]
    pub fn elements_in_use(&self) -> usize {
        self.lock_state()
            .map(|st| st.element_in_use.iter().filter(|u| **u).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimFalcon;

    #[test]
    fn tail_sweeps_only_past_freed_elements() {
        let falcon = SimFalcon::new();
        let surface = MemRegion::alloc(4 * 0x40).unwrap();
        let hal: Arc<dyn FalconHal> = falcon.clone();
        let q = FbQueue::new(hal, surface, QueueId::Hpq, 0, 0, 4, 0x40).unwrap();
        let a = { let wb = q.work_buffer_lock().unwrap(); q.push(&wb).unwrap() };
        let b = { let wb = q.work_buffer_lock().unwrap(); q.push(&wb).unwrap() };
        let _c = { let wb = q.work_buffer_lock().unwrap(); q.push(&wb).unwrap() };
        assert!(q.is_full());
        // Freeing out of order does not move the tail past a busy element.
        q.free_element(b).unwrap();
        assert!(q.is_full());
        q.free_element(a).unwrap();
        assert!(!q.is_full());
        assert_eq!(q.elements_in_use(), 1);
    }

    #[test]
    fn oversized_message_still_releases_its_element() {
        let falcon = SimFalcon::new();
        let surface = MemRegion::alloc(4 * 0x80).unwrap();
        let hal: Arc<dyn FalconHal> = falcon.clone();
        let q = FbQueue::new(hal, surface.clone(), QueueId::Msg, 0, 0, 4, 0x80).unwrap();

        let big = PmuHdr { unit_id: 0x05, size: 0xC0, ctrl_flags: 0, seq_id: 1 };
        let small = PmuHdr { unit_id: 0x05, size: 8, ctrl_flags: 0, seq_id: 2 };
        surface.write(0, &big.to_bytes()).unwrap();
        surface.write(0x80, &small.to_bytes()).unwrap();
        surface.write(0x84, &[7, 7, 7, 7]).unwrap();
        falcon.set_msgq_head(2);

        let mut hdr = [0u8; 4];
        assert_eq!(q.pop(&mut hdr).unwrap(), 4);
        let mut body = vec![0u8; 0xC0 - 4];
        assert_eq!(q.pop(&mut body).unwrap(), 0x80 - 4);
        assert_eq!(falcon.msgq_tail(), 1);

        assert_eq!(q.pop(&mut hdr).unwrap(), 4);
        assert_eq!(PmuHdr::from_bytes(hdr).seq_id, 2);
        let mut body = [0u8; 4];
        assert_eq!(q.pop(&mut body).unwrap(), 4);
        assert_eq!(body, [7; 4]);
        assert!(q.is_empty());
    }
}
