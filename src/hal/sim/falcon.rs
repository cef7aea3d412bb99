// CLASSIFICATION: COMMUNITY
// Filename: falcon.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Simulated PMU falcon with a small RTOS model.
//!
//! Memories and queue registers behave like the hardware. Once booted, the
//! RTOS model reacts to command queue head writes synchronously: it drains
//! the queue, answers each command on the message queue and latches the
//! interrupt. Messages that do not fit wait until the host moves the
//! message queue tail.
//!
//! Command handlers run with the falcon state locked and must not call
//! back into the falcon.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};

use crate::error::{PmuError, PmuResult};
use crate::hal::FalconHal;
use crate::mm::MemRegion;
use crate::pmu::msg::{
    parse_rpc_cmd_body, CtrlFlags, PmuCmd, PmuHdr, PmuInitMsg, PmuMsg, QueueInfo, RpcHeader,
    NV_PMU_RPC_ID_ACR_BOOTSTRAP_FALCON, NV_PMU_RPC_ID_ACR_INIT_WPR_REGION, PMU_CMD_HDR_SIZE,
    PMU_RC_MSG_TYPE_UNHANDLED_CMD, PMU_RPC_HDR_SIZE, PMU_UNIT_ACR, PMU_UNIT_INIT, PMU_UNIT_RC,
    PMU_UNIT_REWIND,
};
use crate::pmu::queue::{
    align_up, QueueId, FBQ_CMD_ELEMENT_SIZE, FBQ_CMD_NUM_ELEMENTS, FBQ_HDR_SIZE,
    FBQ_MSG_ELEMENT_SIZE, FBQ_MSG_NUM_ELEMENTS, PMU_QUEUE_COUNT, QUEUE_ALIGNMENT,
};
use crate::pmu::super_surface::{SS_HPQ_OFFSET, SS_LPQ_OFFSET, SS_MSGQ_OFFSET};

pub const SIM_DMEM_SIZE: u32 = 0x1_0000;
pub const SIM_IMEM_SIZE: u32 = 0x1_0000;
pub const SIM_EMEM_SIZE: u32 = 0x2000;

pub const SIM_HPQ_OFFSET: u32 = 0x1000;
pub const SIM_LPQ_OFFSET: u32 = 0x1800;
pub const SIM_CMDQ_SIZE: u32 = 0x800;
pub const SIM_MSGQ_OFFSET: u32 = 0x2000;
pub const SIM_MSGQ_SIZE: u32 = 0x800;
pub const SIM_SW_MANAGED_OFFSET: u32 = 0x4000;
pub const SIM_SW_MANAGED_SIZE: u32 = 0x8000;

const QUEUE_REGS: usize = 4;
const CMD_QUEUES: usize = 2;
/// flcn_status the model reports for a refused RPC.
pub const SIM_FLCN_STATUS_ERROR: u8 = 0x1;

/// Where a command's payload records point.
enum PayloadMem<'a> {
    Dmem(&'a mut [u8]),
    Fb { surface: &'a MemRegion, base: usize },
}

/// What a command handler sees: the command and the memory its payload
/// allocation records are relative to.
pub struct SimCmdCtx<'a> {
    cmd: &'a PmuCmd,
    mem: PayloadMem<'a>,
}

impl SimCmdCtx<'_> {
    #[must_use]
    pub fn cmd(&self) -> &PmuCmd {
        self.cmd
    }

    /// True when payload offsets are inside the command's FB queue element.
    #[must_use]
    pub fn is_fb_queue(&self) -> bool {
        matches!(self.mem, PayloadMem::Fb { .. })
    }

    /// `len` bytes at payload `offset`; empty when out of range.
    #[must_use]
    pub fn read(&self, offset: u32, len: usize) -> Vec<u8> {
        let o = offset as usize;
        match &self.mem {
            PayloadMem::Dmem(d) => d.get(o..o + len).map(<[u8]>::to_vec).unwrap_or_default(),
            PayloadMem::Fb { surface, base } => {
                let mut b = vec![0u8; len];
                match surface.read(base + o, &mut b) {
                    Ok(()) => b,
                    Err(_) => Vec::new(),
                }
            }
        }
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> bool {
        let o = offset as usize;
        match &mut self.mem {
            PayloadMem::Dmem(d) => match d.get_mut(o..o + data.len()) {
                Some(dst) => {
                    dst.copy_from_slice(data);
                    true
                }
                None => false,
            },
            PayloadMem::Fb { surface, base } => surface.write(*base + o, data).is_ok(),
        }
    }
}

/// Per-unit command behaviour. The returned body becomes the reply; `None`
/// suppresses it.
pub type SimCmdHandler = Box<dyn FnMut(&mut SimCmdCtx<'_>) -> Option<Vec<u8>> + Send>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub resets: u32,
    pub boots: u32,
    pub secure_starts: u32,
    pub sec2_bootstraps: u32,
    pub halt_clears: u32,
    pub aperture_setups: u32,
    pub commands: u32,
    pub rpcs: u32,
    pub replies: u32,
    pub events: u32,
    pub boot_vector: u32,
    pub imem_bytes: u32,
}

#[derive(Default)]
struct SimRtos {
    booted: bool,
    fb_mode: bool,
    silent_boot: bool,
    stalled: bool,
    drop_replies: bool,
    unhandled_units: HashSet<u8>,
    handlers: HashMap<u8, SimCmdHandler>,
    fbq_read: [u32; CMD_QUEUES],
    pending: VecDeque<Vec<u8>>,
    wpr_ready: bool,
    bootstrapped: Vec<u32>,
}

struct FalconState {
    dmem: Vec<u8>,
    imem: Vec<u8>,
    emem: Vec<u8>,
    queue_head: [u32; QUEUE_REGS],
    queue_tail: [u32; QUEUE_REGS],
    msgq_head: u32,
    msgq_tail: u32,
    super_surface: Option<MemRegion>,
    stats: SimStats,
    rtos: SimRtos,
}

pub struct SimFalcon {
    state: Mutex<FalconState>,
    irq: AtomicBool,
    irq_enabled: AtomicBool,
}

fn mem_write(mem: &mut [u8], off: u32, data: &[u8]) -> PmuResult<()> {
    let o = off as usize;
    mem.get_mut(o..o + data.len())
        .ok_or_else(|| PmuError::Io(format!("falcon write {off:#x}+{:#x} out of range", data.len())))?
        .copy_from_slice(data);
    Ok(())
}

fn mem_read(mem: &[u8], off: u32, buf: &mut [u8]) -> PmuResult<()> {
    let o = off as usize;
    buf.copy_from_slice(
        mem.get(o..o + buf.len())
            .ok_or_else(|| PmuError::Io(format!("falcon read {off:#x}+{:#x} out of range", buf.len())))?,
    );
    Ok(())
}

impl SimFalcon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FalconState {
                dmem: vec![0; SIM_DMEM_SIZE as usize],
                imem: vec![0; SIM_IMEM_SIZE as usize],
                emem: vec![0; SIM_EMEM_SIZE as usize],
                queue_head: [0; QUEUE_REGS],
                queue_tail: [0; QUEUE_REGS],
                msgq_head: 0,
                msgq_tail: 0,
                super_surface: None,
                stats: SimStats::default(),
                rtos: SimRtos::default(),
            }),
            irq: AtomicBool::new(false),
            irq_enabled: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FalconState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn raise_irq(&self) {
        self.irq.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }

    #[must_use]
    pub fn is_booted(&self) -> bool {
        self.lock().rtos.booted
    }

    /// Boot without announcing INIT, as a wedged RTOS would.
    pub fn set_silent_boot(&self, silent: bool) {
        self.lock().rtos.silent_boot = silent;
    }

    /// Stop consuming commands. Resuming drains whatever queued up.
    pub fn set_stalled(&self, stalled: bool) {
        let mut st = self.lock();
        st.rtos.stalled = stalled;
        if !stalled && st.rtos.booted {
            for i in 0..CMD_QUEUES {
                self.process_cmd_queue(&mut st, i);
            }
        }
    }

    /// Consume commands without answering them.
    pub fn set_drop_replies(&self, drop: bool) {
        self.lock().rtos.drop_replies = drop;
    }

    /// Answer commands for `unit_id` with an RC "unhandled command" message.
    pub fn set_unhandled_unit(&self, unit_id: u8, unhandled: bool) {
        let mut st = self.lock();
        if unhandled {
            st.rtos.unhandled_units.insert(unit_id);
        } else {
            st.rtos.unhandled_units.remove(&unit_id);
        }
    }

    pub fn register_handler(&self, unit_id: u8, handler: SimCmdHandler) {
        self.lock().rtos.handlers.insert(unit_id, handler);
    }

    /// Falcons the RTOS model has bootstrapped through ACR.
    #[must_use]
    pub fn bootstrapped_falcons(&self) -> Vec<u32> {
        self.lock().rtos.bootstrapped.clone()
    }

    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.lock().rtos.pending.len()
    }

    #[must_use]
    pub fn has_super_surface(&self) -> bool {
        self.lock().super_surface.is_some()
    }

    pub fn read_imem(&self, off: u32, buf: &mut [u8]) -> PmuResult<()> {
        mem_read(&self.lock().imem, off, buf)
    }

    /// Send an unsolicited event from `unit_id`.
    pub fn post_event(&self, unit_id: u8, body: Vec<u8>) -> PmuResult<()> {
        let mut st = self.lock();
        if !st.rtos.booted {
            return Err(PmuError::NotReady);
        }
        let msg = PmuMsg::new(unit_id, 0, CtrlFlags::EVENT, body)?;
        st.stats.events += 1;
        self.post_msg(&mut st, msg.to_bytes());
        Ok(())
    }

    fn boot(&self, st: &mut FalconState) {
        let rtos = &mut st.rtos;
        rtos.booted = true;
        rtos.fb_mode = st.super_surface.is_some();
        rtos.fbq_read = [0; CMD_QUEUES];
        rtos.pending.clear();
        st.stats.boots += 1;

        let mut init = PmuInitMsg {
            fb_queues: rtos.fb_mode,
            sw_managed_area_offset: SIM_SW_MANAGED_OFFSET,
            sw_managed_area_size: SIM_SW_MANAGED_SIZE,
            ..PmuInitMsg::default()
        };
        let info = |offset: u32, size: u32, index: u8, id: QueueId| QueueInfo {
            offset,
            size: size as u16,
            index,
            id: id as u8,
        };
        if rtos.fb_mode {
            init.queue_info[QueueId::Hpq as usize] =
                info(SS_HPQ_OFFSET, FBQ_CMD_NUM_ELEMENTS, 0, QueueId::Hpq);
            init.queue_info[QueueId::Lpq as usize] =
                info(SS_LPQ_OFFSET, FBQ_CMD_NUM_ELEMENTS, 1, QueueId::Lpq);
            init.queue_info[QueueId::Msg as usize] =
                info(SS_MSGQ_OFFSET, FBQ_MSG_NUM_ELEMENTS, 0, QueueId::Msg);
            st.queue_head = [0; QUEUE_REGS];
            st.queue_tail = [0; QUEUE_REGS];
            st.msgq_head = 0;
            st.msgq_tail = 0;
        } else {
            init.queue_info[QueueId::Hpq as usize] =
                info(SIM_HPQ_OFFSET, SIM_CMDQ_SIZE, 0, QueueId::Hpq);
            init.queue_info[QueueId::Lpq as usize] =
                info(SIM_LPQ_OFFSET, SIM_CMDQ_SIZE, 1, QueueId::Lpq);
            init.queue_info[QueueId::Msg as usize] =
                info(SIM_MSGQ_OFFSET, SIM_MSGQ_SIZE, 0, QueueId::Msg);
            st.queue_head[0] = SIM_HPQ_OFFSET;
            st.queue_tail[0] = SIM_HPQ_OFFSET;
            st.queue_head[1] = SIM_LPQ_OFFSET;
            st.queue_tail[1] = SIM_LPQ_OFFSET;
            st.msgq_head = SIM_MSGQ_OFFSET;
            st.msgq_tail = SIM_MSGQ_OFFSET;
        }
        debug_assert_eq!(init.queue_info.len(), PMU_QUEUE_COUNT);
        debug!(
            "sim rtos booted ({} queues)",
            if st.rtos.fb_mode { "FB" } else { "DMEM" }
        );
        if st.rtos.silent_boot {
            return;
        }
        match PmuMsg::new(PMU_UNIT_INIT, 0, CtrlFlags::empty(), init.encode_body()) {
            Ok(msg) => self.post_msg(st, msg.to_bytes()),
            Err(e) => warn!("sim rtos cannot build init message: {e}"),
        }
    }

    fn post_msg(&self, st: &mut FalconState, bytes: Vec<u8>) {
        if !st.rtos.pending.is_empty() || !Self::try_write_msg(st, &bytes) {
            trace!("sim rtos: message queue full, deferring");
            st.rtos.pending.push_back(bytes);
            return;
        }
        self.raise_irq();
    }

    fn flush_pending(&self, st: &mut FalconState) {
        let mut wrote = false;
        while let Some(front) = st.rtos.pending.pop_front() {
            if Self::try_write_msg(st, &front) {
                wrote = true;
            } else {
                st.rtos.pending.push_front(front);
                break;
            }
        }
        if wrote {
            self.raise_irq();
        }
    }

    fn try_write_msg(st: &mut FalconState, bytes: &[u8]) -> bool {
        if st.rtos.fb_mode {
            let Some(surface) = st.super_surface.clone() else {
                return false;
            };
            let head = st.msgq_head;
            if (head + 1) % FBQ_MSG_NUM_ELEMENTS == st.msgq_tail {
                return false;
            }
            let off = (SS_MSGQ_OFFSET + head * FBQ_MSG_ELEMENT_SIZE) as usize;
            let n = bytes.len().min(FBQ_MSG_ELEMENT_SIZE as usize);
            if surface.write(off, &bytes[..n]).is_err() {
                return false;
            }
            st.msgq_head = (head + 1) % FBQ_MSG_NUM_ELEMENTS;
            return true;
        }

        let size = align_up(bytes.len() as u32, QUEUE_ALIGNMENT);
        let end = SIM_MSGQ_OFFSET + SIM_MSGQ_SIZE;
        let tail = st.msgq_tail;
        let mut head = st.msgq_head;
        let mut free = 0;
        let mut rewind = false;
        if head >= tail {
            free = end.saturating_sub(head).saturating_sub(PMU_CMD_HDR_SIZE);
            if size > free {
                rewind = true;
                head = SIM_MSGQ_OFFSET;
            }
        }
        if head < tail {
            free = tail - head - 1;
        }
        if size > free {
            return false;
        }
        if rewind {
            let hdr = PmuHdr {
                unit_id: PMU_UNIT_REWIND,
                size: PMU_CMD_HDR_SIZE as u8,
                ctrl_flags: 0,
                seq_id: 0,
            };
            if mem_write(&mut st.dmem, st.msgq_head, &hdr.to_bytes()).is_err() {
                return false;
            }
        }
        if mem_write(&mut st.dmem, head, bytes).is_err() {
            return false;
        }
        st.msgq_head = head + size;
        true
    }

    fn process_cmd_queue(&self, st: &mut FalconState, index: usize) {
        if index >= CMD_QUEUES || st.rtos.stalled || !st.rtos.booted {
            return;
        }
        if st.rtos.fb_mode {
            self.process_fb_cmd_queue(st, index);
            return;
        }
        let offset = if index == 0 { SIM_HPQ_OFFSET } else { SIM_LPQ_OFFSET };
        let end = offset + SIM_CMDQ_SIZE;
        loop {
            let head = st.queue_head[index];
            let tail = st.queue_tail[index];
            if head == tail {
                break;
            }
            if tail < offset || tail + PMU_CMD_HDR_SIZE > end {
                warn!("sim rtos: queue {index} tail {tail:#x} outside ring");
                break;
            }
            let mut hb = [0u8; PMU_CMD_HDR_SIZE as usize];
            if mem_read(&st.dmem, tail, &mut hb).is_err() {
                break;
            }
            let hdr = PmuHdr::from_bytes(hb);
            if hdr.unit_id == PMU_UNIT_REWIND {
                st.queue_tail[index] = offset;
                continue;
            }
            let size = u32::from(hdr.size).max(PMU_CMD_HDR_SIZE);
            let mut raw = vec![0u8; size as usize];
            if mem_read(&st.dmem, tail, &mut raw).is_err() {
                break;
            }
            st.queue_tail[index] = tail + align_up(size, QUEUE_ALIGNMENT);
            match PmuCmd::from_bytes(&raw) {
                Ok(cmd) => self.handle_cmd(st, &cmd, None),
                Err(e) => warn!("sim rtos: bad command: {e}"),
            }
        }
    }

    fn process_fb_cmd_queue(&self, st: &mut FalconState, index: usize) {
        let Some(surface) = st.super_surface.clone() else {
            return;
        };
        let base = if index == 0 { SS_HPQ_OFFSET } else { SS_LPQ_OFFSET };
        while st.rtos.fbq_read[index] != st.queue_head[index] {
            let e = st.rtos.fbq_read[index];
            let elem_base = (base + e * FBQ_CMD_ELEMENT_SIZE) as usize;
            let mut elem = vec![0u8; FBQ_CMD_ELEMENT_SIZE as usize];
            if surface.read(elem_base, &mut elem).is_err() {
                break;
            }
            match PmuCmd::from_bytes(&elem[FBQ_HDR_SIZE as usize..]) {
                Ok(cmd) => self.handle_cmd(st, &cmd, Some((&surface, elem_base))),
                Err(e) => warn!("sim rtos: bad fb queue element {e}"),
            }
            st.rtos.fbq_read[index] = (e + 1) % FBQ_CMD_NUM_ELEMENTS;
        }
    }

    fn handle_cmd(&self, st: &mut FalconState, cmd: &PmuCmd, fb: Option<(&MemRegion, usize)>) {
        st.stats.commands += 1;
        let unit = cmd.hdr.unit_id;
        let seq = cmd.hdr.seq_id;
        trace!("sim rtos: cmd unit {unit:#x} seq {seq}");

        let reply = if st.rtos.unhandled_units.contains(&unit) {
            PmuMsg::new(
                PMU_UNIT_RC,
                seq,
                CtrlFlags::STATUS,
                vec![PMU_RC_MSG_TYPE_UNHANDLED_CMD, 0, 0, 0],
            )
            .ok()
        } else {
            let body = if cmd.is_rpc() {
                Self::handle_rpc(st, cmd, fb)
            } else {
                let FalconState { dmem, rtos, .. } = st;
                match rtos.handlers.get_mut(&unit) {
                    Some(handler) => {
                        let mem = match fb {
                            Some((surface, base)) => PayloadMem::Fb { surface, base },
                            None => PayloadMem::Dmem(&mut dmem[..]),
                        };
                        let mut ctx = SimCmdCtx { cmd, mem };
                        handler(&mut ctx)
                    }
                    None => Some(cmd.body.clone()),
                }
            };
            body.and_then(|mut body| {
                let max = if st.rtos.fb_mode {
                    FBQ_MSG_ELEMENT_SIZE as usize
                } else {
                    usize::from(u8::MAX)
                } - PMU_CMD_HDR_SIZE as usize;
                body.truncate(max);
                PmuMsg::new(unit, seq, CtrlFlags::STATUS, body).ok()
            })
        };

        if st.rtos.drop_replies {
            return;
        }
        if let Some(msg) = reply {
            st.stats.replies += 1;
            self.post_msg(st, msg.to_bytes());
        }
    }

    fn handle_rpc(
        st: &mut FalconState,
        cmd: &PmuCmd,
        fb: Option<(&MemRegion, usize)>,
    ) -> Option<Vec<u8>> {
        let (size, ptr) = parse_rpc_cmd_body(&cmd.body).ok()?;
        let mut buf = vec![0u8; usize::from(size)];
        match fb {
            Some((surface, base)) => surface.read(base + ptr as usize, &mut buf).ok()?,
            None => mem_read(&st.dmem, ptr, &mut buf).ok()?,
        }
        let mut hdr = RpcHeader::from_bytes(&buf).ok()?;
        st.stats.rpcs += 1;
        hdr.flcn_status = 0;
        if hdr.unit_id == PMU_UNIT_ACR {
            match hdr.function {
                NV_PMU_RPC_ID_ACR_INIT_WPR_REGION => st.rtos.wpr_ready = true,
                NV_PMU_RPC_ID_ACR_BOOTSTRAP_FALCON if st.rtos.wpr_ready => {
                    let id = buf
                        .get(PMU_RPC_HDR_SIZE..PMU_RPC_HDR_SIZE + 4)
                        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))?;
                    st.rtos.bootstrapped.push(id);
                }
                _ => hdr.flcn_status = SIM_FLCN_STATUS_ERROR,
            }
        }
        buf[..PMU_RPC_HDR_SIZE].copy_from_slice(&hdr.to_bytes());
        match fb {
            Some((surface, base)) => surface.write(base + ptr as usize, &buf).ok()?,
            None => mem_write(&mut st.dmem, ptr, &buf).ok()?,
        }
        Some(cmd.body.clone())
    }
}

impl FalconHal for SimFalcon {
    fn reset(&self) -> PmuResult<()> {
        let mut st = self.lock();
        st.stats.resets += 1;
        st.queue_head = [0; QUEUE_REGS];
        st.queue_tail = [0; QUEUE_REGS];
        st.msgq_head = 0;
        st.msgq_tail = 0;
        st.rtos.booted = false;
        st.rtos.pending.clear();
        st.rtos.wpr_ready = false;
        self.irq.store(false, Ordering::Release);
        Ok(())
    }

    fn dmem_size(&self) -> u32 {
        SIM_DMEM_SIZE
    }

    fn copy_to_dmem(&self, dst: u32, data: &[u8]) -> PmuResult<()> {
        mem_write(&mut self.lock().dmem, dst, data)
    }

    fn copy_from_dmem(&self, src: u32, buf: &mut [u8]) -> PmuResult<()> {
        mem_read(&self.lock().dmem, src, buf)
    }

    fn copy_to_emem(&self, dst: u32, data: &[u8]) -> PmuResult<()> {
        mem_write(&mut self.lock().emem, dst, data)
    }

    fn copy_from_emem(&self, src: u32, buf: &mut [u8]) -> PmuResult<()> {
        mem_read(&self.lock().emem, src, buf)
    }

    fn copy_to_imem(&self, dst: u32, data: &[u8]) -> PmuResult<()> {
        let mut st = self.lock();
        mem_write(&mut st.imem, dst, data)?;
        st.stats.imem_bytes += data.len() as u32;
        Ok(())
    }

    fn queue_head(&self, index: u32) -> u32 {
        self.lock().queue_head.get(index as usize).copied().unwrap_or(0)
    }

    fn set_queue_head(&self, index: u32, head: u32) {
        let mut st = self.lock();
        if let Some(h) = st.queue_head.get_mut(index as usize) {
            *h = head;
            self.process_cmd_queue(&mut st, index as usize);
        }
    }

    fn queue_tail(&self, index: u32) -> u32 {
        self.lock().queue_tail.get(index as usize).copied().unwrap_or(0)
    }

    fn set_queue_tail(&self, index: u32, tail: u32) {
        if let Some(t) = self.lock().queue_tail.get_mut(index as usize) {
            *t = tail;
        }
    }

    fn msgq_head(&self) -> u32 {
        self.lock().msgq_head
    }

    fn set_msgq_head(&self, head: u32) {
        self.lock().msgq_head = head;
    }

    fn msgq_tail(&self) -> u32 {
        self.lock().msgq_tail
    }

    fn set_msgq_tail(&self, tail: u32) {
        let mut st = self.lock();
        st.msgq_tail = tail;
        if st.rtos.booted {
            self.flush_pending(&mut st);
        }
    }

    fn is_interrupted(&self) -> bool {
        self.irq_enabled.load(Ordering::Acquire) && self.irq.load(Ordering::Acquire)
    }

    fn clear_interrupts(&self) {
        self.irq.store(false, Ordering::Release);
    }

    fn enable_irq(&self, enable: bool) {
        self.irq_enabled.store(enable, Ordering::Release);
    }

    fn clear_halt_intr_status(&self) -> PmuResult<()> {
        self.lock().stats.halt_clears += 1;
        Ok(())
    }

    fn setup_apertures(&self) -> PmuResult<()> {
        self.lock().stats.aperture_setups += 1;
        Ok(())
    }

    fn bind_super_surface(&self, surface: Option<MemRegion>) {
        self.lock().super_surface = surface;
    }

    fn bootstrap(&self, boot_vector: u32) -> PmuResult<()> {
        let mut st = self.lock();
        if st.stats.imem_bytes == 0 {
            return Err(PmuError::Io("bootstrap with empty IMEM".into()));
        }
        st.stats.boot_vector = boot_vector;
        self.boot(&mut st);
        Ok(())
    }

    fn start_secure(&self) -> PmuResult<()> {
        let mut st = self.lock();
        st.stats.secure_starts += 1;
        self.boot(&mut st);
        Ok(())
    }

    fn bootstrap_via_sec2(&self) -> PmuResult<()> {
        self.lock().stats.sec2_bootstraps += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_publishes_init_in_dmem_message_queue() {
        let falcon = SimFalcon::new();
        falcon.enable_irq(true);
        falcon.start_secure().unwrap();
        assert!(falcon.is_interrupted());
        let tail = falcon.msgq_tail();
        assert_eq!(tail, SIM_MSGQ_OFFSET);
        let mut hdr = [0u8; 4];
        falcon.copy_from_dmem(tail, &mut hdr).unwrap();
        assert_eq!(hdr[0], PMU_UNIT_INIT);
        assert_eq!(falcon.msgq_head(), tail + align_up(u32::from(hdr[1]), QUEUE_ALIGNMENT));
    }

    #[test]
    fn commands_are_echoed_and_consumed() {
        let falcon = SimFalcon::new();
        falcon.start_secure().unwrap();
        // Consume the init message.
        let head = falcon.msgq_head();
        falcon.set_msgq_tail(head);

        let mut cmd = PmuCmd::new(0x05, vec![1, 2, 3, 4]).unwrap();
        cmd.hdr.seq_id = 9;
        falcon.copy_to_dmem(SIM_HPQ_OFFSET, &cmd.to_bytes()).unwrap();
        falcon.set_queue_head(0, SIM_HPQ_OFFSET + 8);
        assert_eq!(falcon.queue_tail(0), SIM_HPQ_OFFSET + 8);

        let mut raw = [0u8; 8];
        falcon.copy_from_dmem(head, &mut raw).unwrap();
        let msg = PmuMsg::from_bytes(&raw).unwrap();
        assert_eq!(msg.hdr.seq_id, 9);
        assert_eq!(msg.body, vec![1, 2, 3, 4]);
        assert_eq!(falcon.stats().replies, 1);
    }

    #[test]
    fn bootstrap_needs_loaded_imem() {
        let falcon = SimFalcon::new();
        assert!(falcon.bootstrap(0).is_err());
        falcon.copy_to_imem(0, &[0xAA; 16]).unwrap();
        falcon.bootstrap(0x10).unwrap();
        assert_eq!(falcon.stats().boot_vector, 0x10);
        assert!(falcon.is_booted());
    }
}
