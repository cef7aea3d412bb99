// CLASSIFICATION: COMMUNITY
// Filename: ipc.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Command post and message dispatch.
//!
//! A posted command owns a sequence slot until its reply comes back. Small
//! payloads are staged in DMEM blocks handed out by the lockless allocator
//! over the RTOS software-managed area; in FB queue mode they travel in the
//! heap of the command's queue element instead. Replies are drained from
//! the message queue in interrupt context (or by a polling wait), matched
//! to their slot by id, copied back and handed to the callback.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use super::Pmu;
use crate::error::{PmuError, PmuResult};
use crate::mm::LocklessAllocator;
use crate::pmu::fw::PmuFwState;
use crate::pmu::fw_ver::{FwVersionOps, PmuAllocation};
use crate::pmu::lsfm::LsfManager;
use crate::pmu::msg::{
    rpc_cmd_body, unit_id_is_valid, CtrlFlags, PmuCmd, PmuHdr, PmuInitMsg, PmuMsg, RpcHeader,
    NV_PMU_RPC_ID_ACR_BOOTSTRAP_FALCON, NV_PMU_RPC_ID_ACR_INIT_WPR_REGION, PMU_CMD_HDR_SIZE,
    PMU_MSG_HDR_SIZE, PMU_RPC_HDR_SIZE, PMU_UNIT_ACR, PMU_UNIT_INIT, PMU_UNIT_REWIND,
};
use crate::pmu::queue::{
    align_up, EngineMemQueue, FbQueue, FbqHdr, PmuQueue, PmuQueues, QueueId, FBQ_HDR_SIZE,
    FBQ_MSG_ELEMENT_SIZE, FBQ_MSG_NUM_ELEMENTS, QUEUE_ALIGNMENT,
};
use crate::pmu::seq::{PayloadBuffer, PmuCallback, SeqHandle, SeqState, SequenceTable};
use crate::pmu::super_surface::SS_MSGQ_OFFSET;
use crate::util::{FencedBool, Timeout};

const PUSH_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Input buffer: copied to the RTOS, its allocation record written into
/// the command body at `offset`.
#[derive(Clone, Debug)]
pub struct PayloadIn {
    pub buf: Vec<u8>,
    pub offset: u32,
}

/// Output buffer: `size` bytes reserved for the RTOS and copied into `buf`
/// when the reply arrives.
#[derive(Clone, Debug)]
pub struct PayloadOut {
    pub buf: PayloadBuffer,
    pub size: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, Default)]
pub struct PmuPayload {
    pub input: Option<PayloadIn>,
    pub output: Option<PayloadOut>,
    /// RPC buffer, sent and copied back in place.
    pub rpc: Option<PayloadBuffer>,
}

/// One RPC call: header fields plus parameters and scratch space.
#[derive(Clone, Debug)]
pub struct RpcRequest {
    pub unit_id: u8,
    pub function: u8,
    pub flags: u8,
    pub params: Vec<u8>,
    pub size_scratch: u16,
}

impl RpcRequest {
    pub fn new(unit_id: u8, function: u8, params: Vec<u8>) -> Self {
        Self {
            unit_id,
            function,
            flags: 0,
            params,
            size_scratch: 0,
        }
    }

    #[must_use]
    pub fn with_scratch(mut self, size: u16) -> Self {
        self.size_scratch = size;
        self
    }

    fn to_buffer(&self) -> PmuResult<Vec<u8>> {
        let size_rpc = u16::try_from(PMU_RPC_HDR_SIZE + self.params.len())
            .map_err(|_| PmuError::InvalidArgument("rpc parameters too large"))?;
        let hdr = RpcHeader {
            unit_id: self.unit_id,
            function: self.function,
            flags: self.flags,
            flcn_status: 0,
            size_rpc,
            size_scratch: self.size_scratch,
        };
        let mut buf = Vec::with_capacity(usize::from(size_rpc) + usize::from(self.size_scratch));
        buf.extend_from_slice(&hdr.to_bytes());
        buf.extend_from_slice(&self.params);
        buf.resize(buf.len() + usize::from(self.size_scratch), 0);
        Ok(buf)
    }
}

/// RPC buffer as the RTOS returned it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcReply {
    pub hdr: RpcHeader,
    pub params: Vec<u8>,
}

impl RpcReply {
    pub fn parse(buf: &[u8]) -> PmuResult<Self> {
        let hdr = RpcHeader::from_bytes(buf)?;
        let end = usize::from(hdr.size_rpc).clamp(PMU_RPC_HDR_SIZE, buf.len());
        Ok(Self {
            hdr,
            params: buf[PMU_RPC_HDR_SIZE..end].to_vec(),
        })
    }
}

fn lock_buf(buf: &PayloadBuffer) -> MutexGuard<'_, Vec<u8>> {
    buf.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_allocation(cmd: &mut PmuCmd, offset: u32, record: &[u8]) -> PmuResult<()> {
    let start = offset as usize;
    let dst = cmd
        .body
        .get_mut(start..start + record.len())
        .ok_or(PmuError::InvalidArgument("allocation record outside command"))?;
    dst.copy_from_slice(record);
    Ok(())
}

/// Reserve `reserve` bytes in an FB queue element heap and copy `data` in.
fn heap_place(
    work: &mut [u8],
    next: &mut u32,
    element_va: u64,
    data: &[u8],
    reserve: u32,
) -> PmuResult<PmuAllocation> {
    let off = *next;
    let end = off as usize + reserve as usize;
    if end > work.len() || data.len() > reserve as usize {
        return Err(PmuError::InvalidArgument("payload exceeds fb queue element"));
    }
    work[off as usize..off as usize + data.len()].copy_from_slice(data);
    *next = off + align_up(reserve, QUEUE_ALIGNMENT);
    Ok(PmuAllocation {
        dmem_offset: off,
        dmem_size: reserve as u16,
        fb_addr: element_va + u64::from(off),
        fb_size: reserve,
    })
}

/// Reply handler used by [`Pmu::rpc_execute`] when the caller gives none.
fn rpc_default_handler(buf: &PayloadBuffer, lsfm: Option<&LsfManager>, msg: &PmuMsg, err: i32) {
    if err != 0 {
        error!("rpc reply for seq {} failed: {err}", msg.hdr.seq_id);
        return;
    }
    let data = lock_buf(buf).clone();
    let hdr = match RpcHeader::from_bytes(&data) {
        Ok(h) => h,
        Err(e) => {
            error!("malformed rpc reply: {e}");
            return;
        }
    };
    if hdr.flcn_status != 0 {
        error!(
            "rpc unit {:#x} function {:#x} failed, flcn_status {:#x}",
            hdr.unit_id, hdr.function, hdr.flcn_status
        );
        return;
    }
    match (hdr.unit_id, hdr.function, lsfm) {
        (PMU_UNIT_ACR, NV_PMU_RPC_ID_ACR_INIT_WPR_REGION, Some(lsfm)) => {
            info!("reply ACR INIT_WPR_REGION");
            lsfm.complete_wpr_init();
        }
        (PMU_UNIT_ACR, NV_PMU_RPC_ID_ACR_BOOTSTRAP_FALCON, Some(lsfm)) => {
            let id = data
                .get(PMU_RPC_HDR_SIZE..PMU_RPC_HDR_SIZE + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
            match id {
                Some(id) => {
                    info!("reply ACR BOOTSTRAP_FALCON, falcon {id}");
                    lsfm.complete_bootstrap(id);
                }
                None => error!("ACR BOOTSTRAP_FALCON reply without falcon id"),
            }
        }
        (unit, function, _) => debug!("rpc unit {unit:#x} function {function:#x} done"),
    }
}

impl Pmu {
    /// Queue `cmd` for the RTOS and return its sequence id.
    ///
    /// Every check runs before any state changes. Once the sequence is in
    /// flight `callback` runs exactly once: with the reply, or with an
    /// error code if the PMU is torn down first.
    pub fn cmd_post(
        &self,
        mut cmd: PmuCmd,
        payload: Option<PmuPayload>,
        queue_id: QueueId,
        callback: Option<PmuCallback>,
    ) -> PmuResult<u8> {
        if !self.pmu_ready.observe() {
            warn!("PMU is not ready");
            return Err(PmuError::NotReady);
        }
        let queues = self.queues.get()?;
        let seqs = self.sequences.get()?;
        let ops = self.fw_ops()?;
        self.validate_cmd(&cmd, payload.as_ref(), queue_id, &queues, ops.as_ref())?;

        let seq = seqs.acquire(callback)?;
        cmd.hdr.seq_id = seq.id();
        cmd.hdr.ctrl_flags = (CtrlFlags::STATUS | CtrlFlags::INTR).bits();
        seq.set_cmd_queue(Some(queue_id));
        trace!(
            "posting cmd unit {:#x} size {} seq {} to {queue_id:?}",
            cmd.hdr.unit_id,
            cmd.hdr.size,
            cmd.hdr.seq_id
        );

        match queues.get(queue_id)? {
            PmuQueue::Dmem(q) => self.post_dmem(q, &seqs, cmd, payload, seq, ops.as_ref()),
            PmuQueue::Fb(q) => self.post_fbq(q, &seqs, cmd, payload, seq, ops.as_ref()),
        }
    }

    fn validate_cmd(
        &self,
        cmd: &PmuCmd,
        payload: Option<&PmuPayload>,
        queue_id: QueueId,
        queues: &PmuQueues,
        ops: &dyn FwVersionOps,
    ) -> PmuResult<()> {
        let invalid = |why: &'static str| {
            error!(
                "invalid pmu cmd: {why}: queue {queue_id:?}, unit {:#x}, size {}",
                cmd.hdr.unit_id, cmd.hdr.size
            );
            Err(PmuError::InvalidArgument(why))
        };

        if !queue_id.is_sw_command_queue() {
            return invalid("not a sw command queue");
        }
        let size = u32::from(cmd.hdr.size);
        if size < PMU_CMD_HDR_SIZE {
            return invalid("command smaller than its header");
        }
        if cmd.body.len() as u32 + PMU_CMD_HDR_SIZE != size {
            return invalid("header size does not match body");
        }
        if size > queues.queue_size(queue_id)? / 2 {
            return invalid("command larger than half the queue");
        }
        if !unit_id_is_valid(cmd.hdr.unit_id) {
            return invalid("unit id");
        }

        let Some(p) = payload else {
            return Ok(());
        };
        if p.input.is_none() && p.output.is_none() && p.rpc.is_none() {
            return invalid("payload without buffers");
        }
        if p.rpc.is_some() && (p.input.is_some() || p.output.is_some()) {
            return invalid("rpc payload mixed with in/out buffers");
        }

        let record = ops.allocation_struct_size();
        let mut lens = Vec::with_capacity(2);
        if let Some(input) = &p.input {
            if input.buf.is_empty() {
                return invalid("empty in payload");
            }
            if PMU_CMD_HDR_SIZE + input.offset + record > size {
                return invalid("in payload record outside command");
            }
            lens.push(input.buf.len());
        }
        if let Some(out) = &p.output {
            if out.size == 0 {
                return invalid("empty out payload");
            }
            if PMU_CMD_HDR_SIZE + out.offset + record > size {
                return invalid("out payload record outside command");
            }
            lens.push(out.size as usize);
        }
        if let Some(rpc) = &p.rpc {
            let len = lock_buf(rpc).len();
            if len < PMU_RPC_HDR_SIZE {
                return invalid("rpc buffer shorter than its header");
            }
            lens.push(len);
        }
        if lens.iter().any(|&l| l > usize::from(u16::MAX)) {
            return invalid("payload too large");
        }

        if queues.is_fb_mode() {
            let heap: u32 = lens
                .iter()
                .map(|&l| align_up(l as u32, QUEUE_ALIGNMENT))
                .sum();
            let need = FBQ_HDR_SIZE + align_up(size, QUEUE_ALIGNMENT) + heap;
            if need > queues.queue_size(queue_id)? {
                return invalid("payload exceeds fb queue element");
            }
        } else {
            let block = self.cfg.dmem_block_size;
            if lens.iter().any(|&l| l as u64 > block) {
                return invalid("payload larger than a DMEM block");
            }
        }
        Ok(())
    }

    fn dmem_payload_alloc(&self, dmem: &LocklessAllocator, len: usize) -> PmuResult<PmuAllocation> {
        let addr = dmem.alloc(dmem.block_size());
        if addr == 0 {
            error!("DMEM payload allocator exhausted: {}", dmem.stats());
            return Err(PmuError::NoSpace);
        }
        Ok(PmuAllocation {
            dmem_offset: addr as u32,
            dmem_size: len as u16,
            ..PmuAllocation::default()
        })
    }

    fn dmem_payload_setup(
        &self,
        cmd: &mut PmuCmd,
        payload: PmuPayload,
        seq: &SeqHandle,
        ops: &dyn FwVersionOps,
    ) -> PmuResult<()> {
        let dmem = self.dmem.get()?;
        let falcon = &self.hal.falcon;

        if let Some(rpc) = payload.rpc {
            let data = lock_buf(&rpc).clone();
            let alloc = self.dmem_payload_alloc(&dmem, data.len())?;
            seq.set_in_mem(Some(alloc));
            seq.set_out_mem(Some(alloc));
            falcon.copy_to_dmem(alloc.dmem_offset, &data)?;
            cmd.body = rpc_cmd_body(alloc.dmem_size, alloc.dmem_offset);
            seq.set_out_payload(Some(rpc));
        }
        if let Some(input) = payload.input {
            let alloc = self.dmem_payload_alloc(&dmem, input.buf.len())?;
            seq.set_in_mem(Some(alloc));
            falcon.copy_to_dmem(alloc.dmem_offset, &input.buf)?;
            write_allocation(cmd, input.offset, &ops.encode_allocation(&alloc))?;
        }
        if let Some(out) = payload.output {
            let alloc = self.dmem_payload_alloc(&dmem, out.size as usize)?;
            seq.set_out_mem(Some(alloc));
            write_allocation(cmd, out.offset, &ops.encode_allocation(&alloc))?;
            seq.set_out_payload(Some(out.buf));
        }
        Ok(())
    }

    fn post_dmem(
        &self,
        q: &EngineMemQueue,
        seqs: &Arc<SequenceTable>,
        mut cmd: PmuCmd,
        payload: Option<PmuPayload>,
        seq: SeqHandle,
        ops: &dyn FwVersionOps,
    ) -> PmuResult<u8> {
        if let Some(p) = payload {
            if let Err(e) = self.dmem_payload_setup(&mut cmd, p, &seq, ops) {
                error!("payload setup for seq {} failed: {e}", seq.id());
                self.payload_free(&seq);
                seq.set_state(SeqState::Cancelled);
                return Err(e);
            }
        }
        let bytes = cmd.to_bytes();
        self.write_cmd(seqs, seq, q.id(), || q.push(&bytes))
    }

    fn post_fbq(
        &self,
        q: &FbQueue,
        seqs: &Arc<SequenceTable>,
        mut cmd: PmuCmd,
        payload: Option<PmuPayload>,
        seq: SeqHandle,
        ops: &dyn FwVersionOps,
    ) -> PmuResult<u8> {
        let mut work = q.work_buffer_lock()?;
        work.fill(0);
        let element = q.next_element();
        let element_va = q.element_gpu_va(element);
        let heap_offset = FBQ_HDR_SIZE + align_up(u32::from(cmd.hdr.size), QUEUE_ALIGNMENT);
        seq.set_fbq_element_index(element);
        seq.set_fbq_heap_offset(heap_offset as u16);

        let mut next = heap_offset;
        let setup = (|| -> PmuResult<()> {
            let Some(p) = payload else {
                return Ok(());
            };
            if let Some(rpc) = p.rpc {
                let data = lock_buf(&rpc).clone();
                let alloc = heap_place(&mut work, &mut next, element_va, &data, data.len() as u32)?;
                cmd.body = rpc_cmd_body(alloc.dmem_size, alloc.dmem_offset);
                seq.set_in_mem(Some(alloc));
                seq.set_out_mem(Some(alloc));
                seq.set_in_payload_fb_queue(true);
                seq.set_out_payload_fb_queue(true);
                seq.set_fbq_out_offset(alloc.dmem_offset);
                seq.set_out_payload(Some(rpc));
            }
            if let Some(input) = p.input {
                let alloc = heap_place(
                    &mut work,
                    &mut next,
                    element_va,
                    &input.buf,
                    input.buf.len() as u32,
                )?;
                write_allocation(&mut cmd, input.offset, &ops.encode_allocation(&alloc))?;
                seq.set_in_mem(Some(alloc));
                seq.set_in_payload_fb_queue(true);
            }
            if let Some(out) = p.output {
                let alloc = heap_place(&mut work, &mut next, element_va, &[], out.size)?;
                write_allocation(&mut cmd, out.offset, &ops.encode_allocation(&alloc))?;
                seq.set_out_mem(Some(alloc));
                seq.set_out_payload_fb_queue(true);
                seq.set_fbq_out_offset(alloc.dmem_offset);
                seq.set_out_payload(Some(out.buf));
            }
            Ok(())
        })();
        if let Err(e) = setup {
            error!("fb queue payload setup for seq {} failed: {e}", seq.id());
            self.payload_free(&seq);
            seq.set_state(SeqState::Cancelled);
            return Err(e);
        }

        let used = next - heap_offset;
        seq.set_buffer_size_used(used as u16);
        let hdr = FbqHdr {
            heap_size: used as u16,
            heap_offset: heap_offset as u16,
            element_index: element as u8,
        };
        let cmd_bytes = cmd.to_bytes();
        work[..FBQ_HDR_SIZE as usize].copy_from_slice(&hdr.to_bytes());
        work[FBQ_HDR_SIZE as usize..FBQ_HDR_SIZE as usize + cmd_bytes.len()]
            .copy_from_slice(&cmd_bytes);

        self.write_cmd(seqs, seq, q.id(), || q.push(&work).map(|_| ()))
    }

    /// Mark `seq` in flight and push, retrying while the queue is full.
    fn write_cmd(
        &self,
        seqs: &Arc<SequenceTable>,
        seq: SeqHandle,
        queue_id: QueueId,
        mut push: impl FnMut() -> PmuResult<()>,
    ) -> PmuResult<u8> {
        // A reply can be drained on another thread the moment the push lands.
        let id = seq.into_inflight();
        let timeout = Timeout::from_ms(self.cfg.cmd_timeout_ms);
        let res = loop {
            match push() {
                Err(PmuError::NoSpace) if !timeout.expired() => {
                    std::thread::sleep(PUSH_RETRY_DELAY);
                }
                r => break r,
            }
        };
        match res {
            Ok(()) => Ok(id),
            Err(e) => {
                error!("failed to write cmd seq {id} to {queue_id:?}: {e}");
                if let Some(seq) = seqs.take_inflight(id) {
                    self.payload_free(&seq);
                    seq.set_state(SeqState::Cancelled);
                }
                Err(e)
            }
        }
    }

    /// Return the DMEM blocks of `seq` and clear its payload fields.
    fn payload_free(&self, seq: &SeqHandle) {
        if let Some(dmem) = self.dmem.try_get() {
            let in_mem = seq.in_mem();
            if let Some(m) = in_mem {
                if !seq.in_payload_fb_queue() {
                    dmem.free(u64::from(m.dmem_offset));
                }
            }
            if let Some(m) = seq.out_mem() {
                if !seq.out_payload_fb_queue() && Some(m) != in_mem {
                    dmem.free(u64::from(m.dmem_offset));
                }
            }
        }
        seq.payload_free();
    }

    fn copy_out_payload(&self, seq: &SeqHandle) -> PmuResult<()> {
        let (Some(buf), Some(out)) = (seq.out_payload(), seq.out_mem()) else {
            return Ok(());
        };
        let mut b = lock_buf(&buf);
        let n = b.len().min(usize::from(out.dmem_size));
        if seq.out_payload_fb_queue() {
            let queues = self.queues.get()?;
            let qid = seq
                .cmd_queue()
                .ok_or(PmuError::InvalidArgument("sequence without command queue"))?;
            if let PmuQueue::Fb(q) = queues.get(qid)? {
                q.read_element(seq.fbq_element_index(), seq.fbq_out_offset(), &mut b[..n])?;
            }
        } else {
            self.hal.falcon.copy_from_dmem(out.dmem_offset, &mut b[..n])?;
        }
        Ok(())
    }

    fn response_handle(&self, msg: &PmuMsg) -> PmuResult<()> {
        let seqs = self.sequences.get()?;
        let Some(seq) = seqs.take_inflight(msg.hdr.seq_id) else {
            error!("msg for an unknown sequence {}", msg.hdr.seq_id);
            return Err(PmuError::InvalidArgument("reply for a sequence not in flight"));
        };

        let mut err = 0;
        if msg.is_unhandled_cmd() {
            error!("unhandled cmd: seq {}", seq.id());
            err = PmuError::einval();
        } else if let Err(e) = self.copy_out_payload(&seq) {
            error!("copying reply payload of seq {} failed: {e}", seq.id());
            err = e.errno();
        }
        // Clearing the payload resets the element index.
        let (cmd_queue, element) = (seq.cmd_queue(), seq.fbq_element_index());
        self.payload_free(&seq);

        if let (Some(qid), Ok(queues)) = (cmd_queue, self.queues.get()) {
            if let Ok(PmuQueue::Fb(q)) = queues.get(qid) {
                if let Err(e) = q.free_element(element) {
                    warn!("freeing fb queue element of seq {} failed: {e}", seq.id());
                }
            }
        }
        seq.callback(msg, err);
        Ok(())
    }

    fn handle_event(&self, msg: &PmuMsg) {
        match self.event_handler(msg.hdr.unit_id) {
            Some(handler) => handler(msg),
            None => debug!("unhandled PMU event for unit {:#x}", msg.hdr.unit_id),
        }
    }

    fn read_hdr(q: &PmuQueue) -> PmuResult<PmuHdr> {
        let mut b = [0u8; PMU_MSG_HDR_SIZE as usize];
        let n = q.pop(&mut b)?;
        if n != b.len() {
            error!("fail to read msg header from queue {:?}", q.id());
            return Err(PmuError::Io("short message header".into()));
        }
        Ok(PmuHdr::from_bytes(b))
    }

    fn read_message(q: &PmuQueue) -> PmuResult<Option<PmuMsg>> {
        if q.is_empty() {
            return Ok(None);
        }
        let mut hdr = Self::read_hdr(q)?;
        if hdr.unit_id == PMU_UNIT_REWIND {
            q.rewind()?;
            if q.is_empty() {
                return Ok(None);
            }
            hdr = Self::read_hdr(q)?;
        }
        if !unit_id_is_valid(hdr.unit_id) {
            error!("read invalid unit_id {:#x}", hdr.unit_id);
            return Err(PmuError::InvalidArgument("message unit id"));
        }
        let body_len = u32::from(hdr.size).saturating_sub(PMU_MSG_HDR_SIZE) as usize;
        let mut body = vec![0u8; body_len];
        if body_len > 0 {
            let n = q.pop(&mut body)?;
            if n != body_len {
                error!("fail to read msg body: {n} of {body_len} bytes");
                return Err(PmuError::Io("short message body".into()));
            }
        }
        Ok(Some(PmuMsg { hdr, body }))
    }

    fn read_init_msg_dmem(&self) -> PmuResult<PmuMsg> {
        let falcon = &self.hal.falcon;
        let tail = falcon.msgq_tail();
        let mut b = [0u8; PMU_MSG_HDR_SIZE as usize];
        falcon.copy_from_dmem(tail, &mut b)?;
        let hdr = PmuHdr::from_bytes(b);
        let size = u32::from(hdr.size).max(PMU_MSG_HDR_SIZE);
        let mut body = vec![0u8; (size - PMU_MSG_HDR_SIZE) as usize];
        falcon.copy_from_dmem(tail + PMU_MSG_HDR_SIZE, &mut body)?;
        falcon.set_msgq_tail(tail + align_up(size, QUEUE_ALIGNMENT));
        Ok(PmuMsg { hdr, body })
    }

    fn read_init_msg_fb(&self) -> PmuResult<PmuMsg> {
        let ss = self.super_surface.get()?;
        let mem = ss.mem()?;
        let falcon = &self.hal.falcon;
        let tail = falcon.msgq_tail();
        let base = (SS_MSGQ_OFFSET + tail * FBQ_MSG_ELEMENT_SIZE) as usize;
        let mut b = [0u8; PMU_MSG_HDR_SIZE as usize];
        mem.read(base, &mut b)?;
        let hdr = PmuHdr::from_bytes(b);
        let size = u32::from(hdr.size)
            .clamp(PMU_MSG_HDR_SIZE, FBQ_MSG_ELEMENT_SIZE);
        let mut body = vec![0u8; (size - PMU_MSG_HDR_SIZE) as usize];
        mem.read(base + PMU_MSG_HDR_SIZE as usize, &mut body)?;
        falcon.set_msgq_tail((tail + 1) % FBQ_MSG_NUM_ELEMENTS);
        Ok(PmuMsg { hdr, body })
    }

    fn process_init_msg(&self) -> PmuResult<()> {
        let fb_mode = self.super_surface.is_set();
        let msg = if fb_mode {
            self.read_init_msg_fb()?
        } else {
            self.read_init_msg_dmem()?
        };
        if msg.hdr.unit_id != PMU_UNIT_INIT {
            error!("expecting init msg, got unit {:#x}", msg.hdr.unit_id);
            return Err(PmuError::InvalidArgument("first PMU message is not INIT"));
        }
        let init = PmuInitMsg::decode(&msg)?;

        let surface = match self.super_surface.try_get() {
            Some(ss) if init.fb_queues => Some(ss.mem()?.clone()),
            _ => None,
        };
        let queues = PmuQueues::init(&self.hal.falcon, &init, surface.as_ref())?;
        let dmem = LocklessAllocator::init(
            "pmu_dmem",
            u64::from(init.sw_managed_area_offset),
            u64::from(init.sw_managed_area_size),
            self.cfg.dmem_block_size,
            0,
        )?;
        debug!("PMU DMEM payload pool: {}", dmem.stats());
        self.queues.set(Arc::new(queues));
        self.dmem.set(Arc::new(dmem));

        self.pmu_ready.publish(true);
        self.set_fw_ready(true);
        self.fw_state_change(PmuFwState::InitReceived, true);
        info!("PMU init message processed");
        Ok(())
    }

    /// Drain the message queue; the first message after boot must be INIT.
    pub fn process_message(&self) -> PmuResult<()> {
        let _guard = self.msg_lock.lock().map_err(|_| PmuError::LockPoisoned)?;
        self.drain_messages()
    }

    pub(crate) fn drain_messages(&self) -> PmuResult<()> {
        if !self.pmu_ready.observe() {
            return self.process_init_msg();
        }
        let queues = self.queues.get()?;
        let q = queues.message_queue()?;
        while let Some(msg) = Self::read_message(q)? {
            if msg.is_event() {
                self.handle_event(&msg);
            } else if let Err(e) = self.response_handle(&msg) {
                warn!("dropping PMU reply: {e}");
            }
        }
        Ok(())
    }

    /// Post an RPC on the LPQ.
    ///
    /// Without `callback` the default handler logs the firmware status and
    /// records ACR side effects. With `is_copy_back` the call waits for the
    /// reply and returns the RPC buffer as the RTOS left it; on timeout the
    /// sequence stays in flight and a late reply is dropped by the handler.
    pub fn rpc_execute(
        &self,
        req: RpcRequest,
        is_copy_back: bool,
        callback: Option<PmuCallback>,
    ) -> PmuResult<Option<RpcReply>> {
        let rpc_buf: PayloadBuffer = Arc::new(Mutex::new(req.to_buffer()?));
        let complete = Arc::new(FencedBool::new(false));

        let done = Arc::clone(&complete);
        let cb: PmuCallback = match callback {
            Some(user) => Box::new(move |msg: &PmuMsg, err: i32| {
                user(msg, err);
                done.publish(true);
            }),
            None => {
                let buf = Arc::clone(&rpc_buf);
                let lsfm = self.lsfm.try_get();
                Box::new(move |msg: &PmuMsg, err: i32| {
                    rpc_default_handler(&buf, lsfm.as_deref(), msg, err);
                    done.publish(true);
                })
            }
        };

        let cmd = PmuCmd::new(req.unit_id, rpc_cmd_body(0, 0))?;
        let payload = PmuPayload {
            rpc: Some(Arc::clone(&rpc_buf)),
            ..PmuPayload::default()
        };
        let seq = self.cmd_post(cmd, Some(payload), QueueId::Lpq, Some(cb))?;
        debug!(
            "rpc unit {:#x} function {:#x} posted as seq {seq}",
            req.unit_id, req.function
        );
        if !is_copy_back {
            return Ok(None);
        }
        self.wait_message_flag(self.cfg.cmd_timeout_ms, &complete)?;
        let data = lock_buf(&rpc_buf).clone();
        RpcReply::parse(&data).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_buffer_carries_header_params_and_scratch() {
        let req = RpcRequest::new(PMU_UNIT_ACR, 2, vec![1, 2, 3, 4]).with_scratch(4);
        let buf = req.to_buffer().unwrap();
        assert_eq!(buf.len(), PMU_RPC_HDR_SIZE + 8);
        let hdr = RpcHeader::from_bytes(&buf).unwrap();
        assert_eq!(hdr.size_rpc as usize, PMU_RPC_HDR_SIZE + 4);
        assert_eq!(hdr.size_scratch, 4);
        let reply = RpcReply::parse(&buf).unwrap();
        assert_eq!(reply.params, vec![1, 2, 3, 4]);
    }

    #[test]
    fn heap_place_aligns_and_bounds() {
        let mut work = vec![0u8; 64];
        let mut next = 16;
        let a = heap_place(&mut work, &mut next, 0x1000, &[9; 5], 5).unwrap();
        assert_eq!(a.dmem_offset, 16);
        assert_eq!(a.fb_addr, 0x1010);
        assert_eq!(next, 24);
        assert_eq!(&work[16..21], &[9; 5]);
        assert!(heap_place(&mut work, &mut next, 0x1000, &[], 41).is_err());
    }
}
