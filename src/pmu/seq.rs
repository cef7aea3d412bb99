// CLASSIFICATION: COMMUNITY
// Filename: seq.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! In-flight command tracking.
//!
//! Every command posted to the PMU owns one sequence slot from acquire until
//! its reply has been dispatched. The slot id travels in the command header
//! and comes back in the reply, which is how the reply finds its callback.
//!
//! Slot reservation is a bitmap guarded by the table mutex. Acquire hands
//! out a move-only [`SeqHandle`]; dropping it releases the slot. While a
//! command is with the firmware the handle is parked in the table
//! (`into_inflight`) and the reply path takes it back with `take_inflight`,
//! so exactly one party owns a slot at any time.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, trace, warn};

use crate::error::{PmuError, PmuResult};
use crate::pmu::fw_ver::PmuAllocation;
use crate::pmu::msg::{CtrlFlags, PmuMsg, PMU_UNIT_NULL};
use crate::pmu::queue::QueueId;

pub const PMU_MAX_NUM_SEQUENCES: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SeqState {
    #[default]
    Free,
    Pending,
    Used,
    Cancelled,
}

/// Reply callback: the decoded message and a negative errno, or 0.
pub type PmuCallback = Box<dyn FnOnce(&PmuMsg, i32) + Send>;

/// Caller-owned buffer the reply payload is copied into.
pub type PayloadBuffer = Arc<Mutex<Vec<u8>>>;

#[derive(Default)]
struct SeqSlot {
    id: u8,
    state: SeqState,
    /// Held by the table on behalf of the firmware, not by a handle.
    parked: bool,
    callback: Option<PmuCallback>,
    in_mem: Option<PmuAllocation>,
    out_mem: Option<PmuAllocation>,
    out_payload: Option<PayloadBuffer>,
    fbq_out_offset: u32,
    fbq_element_index: u32,
    fbq_heap_offset: u16,
    buffer_size_used: u16,
    in_payload_fb_queue: bool,
    out_payload_fb_queue: bool,
    cmd_queue: Option<QueueId>,
}

impl SeqSlot {
    fn clear_payload(&mut self) {
        self.in_mem = None;
        self.out_mem = None;
        self.out_payload = None;
        self.fbq_out_offset = 0;
        self.fbq_element_index = 0;
        self.fbq_heap_offset = 0;
        self.buffer_size_used = 0;
        self.in_payload_fb_queue = false;
        self.out_payload_fb_queue = false;
    }
}

pub struct SequenceTable {
    slots: Box<[Mutex<SeqSlot>]>,
    bitmap: Mutex<Vec<u64>>,
}

impl SequenceTable {
    /// Allocate and initialise a table of `capacity` slots.
    pub fn alloc(capacity: usize) -> PmuResult<Arc<Self>> {
        if capacity == 0 || capacity > PMU_MAX_NUM_SEQUENCES {
            return Err(PmuError::InvalidArgument("sequence table capacity"));
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|_| {
            error!("failed to allocate {capacity} PMU sequences");
            PmuError::OutOfMemory
        })?;
        slots.resize_with(capacity, || Mutex::new(SeqSlot::default()));

        let words = capacity.div_ceil(64);
        let mut bitmap = Vec::new();
        bitmap.try_reserve_exact(words).map_err(|_| {
            error!("failed to allocate PMU sequence bitmap");
            PmuError::OutOfMemory
        })?;
        bitmap.resize(words, 0u64);

        let table = Arc::new(Self {
            slots: slots.into_boxed_slice(),
            bitmap: Mutex::new(bitmap),
        });
        table.init();
        Ok(table)
    }

    /// Zero every slot and fix `slot[i].id = i`. Any handle still alive
    /// from before must not be used afterwards.
    pub fn init(&self) {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut s = lock_slot(slot);
            *s = SeqSlot::default();
            s.id = i as u8;
        }
        let mut map = self.bitmap.lock().unwrap_or_else(PoisonError::into_inner);
        map.iter_mut().for_each(|w| *w = 0);
        debug!("PMU sequence table initialised, {} slots", self.slots.len());
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently reserved.
    #[must_use]
    pub fn in_use(&self) -> usize {
        let map = self.bitmap.lock().unwrap_or_else(PoisonError::into_inner);
        map.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Reserve the lowest free slot. `Busy` when every slot is taken.
    pub fn acquire(self: &Arc<Self>, callback: Option<PmuCallback>) -> PmuResult<SeqHandle> {
        let index = {
            let mut map = self.bitmap.lock().map_err(|_| PmuError::LockPoisoned)?;
            let index = (0..self.slots.len()).find(|&i| map[i / 64] & (1u64 << (i % 64)) == 0);
            match index {
                Some(i) => {
                    map[i / 64] |= 1u64 << (i % 64);
                    i
                }
                None => {
                    warn!("no free sequence available");
                    return Err(PmuError::Busy);
                }
            }
        };

        // The bit grants exclusive ownership; fill the slot outside the table lock.
        let mut s = lock_slot(&self.slots[index]);
        s.state = SeqState::Pending;
        s.parked = false;
        s.callback = callback;
        s.cmd_queue = None;
        s.clear_payload();
        let id = s.id;
        drop(s);
        trace!("acquired sequence {id}");
        Ok(SeqHandle {
            table: Arc::clone(self),
            id,
        })
    }

    /// Take back a slot parked by [`SeqHandle::into_inflight`]. `None` if the
    /// id is out of range or the slot is not waiting for a reply.
    pub fn take_inflight(self: &Arc<Self>, id: u8) -> Option<SeqHandle> {
        let slot = self.slots.get(id as usize)?;
        let mut s = lock_slot(slot);
        if !s.parked || s.state != SeqState::Used {
            return None;
        }
        s.parked = false;
        drop(s);
        Some(SeqHandle {
            table: Arc::clone(self),
            id,
        })
    }

    #[must_use]
    pub fn state_of(&self, id: u8) -> Option<SeqState> {
        self.slots.get(id as usize).map(|s| lock_slot(s).state)
    }

    /// Release every parked slot, telling its callback the PMU went away.
    pub fn cancel_inflight(self: &Arc<Self>, err: i32) -> usize {
        let mut n = 0;
        for id in 0..self.slots.len() {
            if let Some(seq) = self.take_inflight(id as u8) {
                seq.set_state(SeqState::Cancelled);
                let msg = PmuMsg::new(PMU_UNIT_NULL, seq.id(), CtrlFlags::empty(), Vec::new())
                    .unwrap_or_default();
                seq.callback(&msg, err);
                n += 1;
            }
        }
        if n > 0 {
            warn!("cancelled {n} in-flight PMU sequences");
        }
        n
    }

    fn release(&self, id: u8) {
        {
            let mut s = lock_slot(&self.slots[id as usize]);
            s.state = SeqState::Free;
            s.parked = false;
            s.callback = None;
            s.cmd_queue = None;
            s.clear_payload();
        }
        // Fields are clean before the bit can be handed out again.
        let mut map = self.bitmap.lock().unwrap_or_else(PoisonError::into_inner);
        let i = id as usize;
        map[i / 64] &= !(1u64 << (i % 64));
        trace!("released sequence {id}");
    }
}

impl fmt::Debug for SequenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceTable")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

fn lock_slot(slot: &Mutex<SeqSlot>) -> MutexGuard<'_, SeqSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive ownership of one sequence slot. Dropping it releases the slot.
pub struct SeqHandle {
    table: Arc<SequenceTable>,
    id: u8,
}

impl SeqHandle {
    fn slot(&self) -> MutexGuard<'_, SeqSlot> {
        lock_slot(&self.table.slots[self.id as usize])
    }

    #[must_use]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SeqState {
        self.slot().state
    }

    pub fn set_state(&self, state: SeqState) {
        self.slot().state = state;
    }

    /// Invoke the registered callback, at most once. No-op without one.
    pub fn callback(&self, msg: &PmuMsg, err: i32) {
        let cb = self.slot().callback.take();
        if let Some(cb) = cb {
            cb(msg, err);
        }
    }

    #[must_use]
    pub fn has_callback(&self) -> bool {
        self.slot().callback.is_some()
    }

    #[must_use]
    pub fn in_mem(&self) -> Option<PmuAllocation> {
        self.slot().in_mem
    }

    pub fn set_in_mem(&self, mem: Option<PmuAllocation>) {
        self.slot().in_mem = mem;
    }

    #[must_use]
    pub fn out_mem(&self) -> Option<PmuAllocation> {
        self.slot().out_mem
    }

    pub fn set_out_mem(&self, mem: Option<PmuAllocation>) {
        self.slot().out_mem = mem;
    }

    #[must_use]
    pub fn out_payload(&self) -> Option<PayloadBuffer> {
        self.slot().out_payload.clone()
    }

    pub fn set_out_payload(&self, buf: Option<PayloadBuffer>) {
        self.slot().out_payload = buf;
    }

    /// Offset of the out payload inside the FB queue element.
    #[must_use]
    pub fn fbq_out_offset(&self) -> u32 {
        self.slot().fbq_out_offset
    }

    pub fn set_fbq_out_offset(&self, offset: u32) {
        self.slot().fbq_out_offset = offset;
    }

    #[must_use]
    pub fn fbq_element_index(&self) -> u32 {
        self.slot().fbq_element_index
    }

    pub fn set_fbq_element_index(&self, index: u32) {
        self.slot().fbq_element_index = index;
    }

    #[must_use]
    pub fn fbq_heap_offset(&self) -> u16 {
        self.slot().fbq_heap_offset
    }

    pub fn set_fbq_heap_offset(&self, offset: u16) {
        self.slot().fbq_heap_offset = offset;
    }

    #[must_use]
    pub fn buffer_size_used(&self) -> u16 {
        self.slot().buffer_size_used
    }

    pub fn set_buffer_size_used(&self, size: u16) {
        self.slot().buffer_size_used = size;
    }

    #[must_use]
    pub fn in_payload_fb_queue(&self) -> bool {
        self.slot().in_payload_fb_queue
    }

    pub fn set_in_payload_fb_queue(&self, v: bool) {
        self.slot().in_payload_fb_queue = v;
    }

    #[must_use]
    pub fn out_payload_fb_queue(&self) -> bool {
        self.slot().out_payload_fb_queue
    }

    pub fn set_out_payload_fb_queue(&self, v: bool) {
        self.slot().out_payload_fb_queue = v;
    }

    #[must_use]
    pub fn cmd_queue(&self) -> Option<QueueId> {
        self.slot().cmd_queue
    }

    pub fn set_cmd_queue(&self, queue: Option<QueueId>) {
        self.slot().cmd_queue = queue;
    }

    /// Forget the payload description; state and callback are kept.
    pub fn payload_free(&self) {
        self.slot().clear_payload();
    }

    /// Park the slot in the table while the firmware holds the command.
    /// The state becomes `Used`; the reply path reclaims it by id.
    pub fn into_inflight(self) -> u8 {
        let id = self.id;
        {
            let mut s = self.slot();
            s.state = SeqState::Used;
            s.parked = true;
        }
        std::mem::forget(self);
        id
    }

    /// Explicit release, same as dropping the handle.
    pub fn release(self) {}
}

impl Drop for SeqHandle {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

impl fmt::Debug for SeqHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
