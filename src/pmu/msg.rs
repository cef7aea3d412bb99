// CLASSIFICATION: COMMUNITY
// Filename: msg.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Command and message packets exchanged with the PMU RTOS.

use bitflags::bitflags;

use crate::error::{PmuError, PmuResult};
use crate::pmu::queue::{PMU_QUEUE_COUNT, QueueId};

pub const PMU_CMD_HDR_SIZE: u32 = 4;
pub const PMU_MSG_HDR_SIZE: u32 = 4;

pub const PMU_UNIT_REWIND: u8 = 0x00;
pub const PMU_UNIT_PG: u8 = 0x03;
pub const PMU_UNIT_INIT: u8 = 0x07;
pub const PMU_UNIT_ACR: u8 = 0x0A;
pub const PMU_UNIT_PERFMON: u8 = 0x12;
pub const PMU_UNIT_RC: u8 = 0x1F;
pub const PMU_UNIT_NULL: u8 = 0x20;
pub const PMU_UNIT_END: u8 = 0x23;

#[must_use]
pub fn unit_id_is_valid(id: u8) -> bool {
    id < PMU_UNIT_END
}

/// RC unit: the RTOS did not recognise the command.
pub const PMU_RC_MSG_TYPE_UNHANDLED_CMD: u8 = 0;
pub const PMU_INIT_MSG_TYPE_PMU_INIT: u8 = 0;

/// First body byte of an RPC command.
pub const NV_PMU_RPC_CMD_ID: u8 = 0x80;
pub const PMU_RPC_HDR_SIZE: usize = 8;
pub const PMU_RPC_CMD_BODY_SIZE: usize = 8;

pub const NV_PMU_RPC_ID_ACR_INIT_WPR_REGION: u8 = 0x00;
pub const NV_PMU_RPC_ID_ACR_BOOTSTRAP_FALCON: u8 = 0x02;

bitflags! {
    /// Header control flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CtrlFlags: u8 {
        const STATUS = 0x1;
        const INTR = 0x2;
        const EVENT = 0x4;
        const WATERMARK = 0x8;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmuHdr {
    pub unit_id: u8,
    /// Whole packet size, header included.
    pub size: u8,
    pub ctrl_flags: u8,
    pub seq_id: u8,
}

impl PmuHdr {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 4] {
        [self.unit_id, self.size, self.ctrl_flags, self.seq_id]
    }

    #[must_use]
    pub fn from_bytes(b: [u8; 4]) -> Self {
        Self {
            unit_id: b[0],
            size: b[1],
            ctrl_flags: b[2],
            seq_id: b[3],
        }
    }

    #[must_use]
    pub fn flags(&self) -> CtrlFlags {
        CtrlFlags::from_bits_truncate(self.ctrl_flags)
    }
}

fn packet_from_bytes(bytes: &[u8]) -> PmuResult<(PmuHdr, Vec<u8>)> {
    if bytes.len() < PMU_CMD_HDR_SIZE as usize {
        return Err(PmuError::InvalidArgument("packet shorter than its header"));
    }
    let hdr = PmuHdr::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let size = hdr.size as usize;
    if size < PMU_CMD_HDR_SIZE as usize || size > bytes.len() {
        return Err(PmuError::InvalidArgument("packet size field out of range"));
    }
    Ok((hdr, bytes[PMU_CMD_HDR_SIZE as usize..size].to_vec()))
}

fn packet_to_bytes(hdr: &PmuHdr, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(hdr.size as usize);
    out.extend_from_slice(&hdr.to_bytes());
    out.extend_from_slice(body);
    out.resize(hdr.size as usize, 0);
    out
}

/// Host to RTOS command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PmuCmd {
    pub hdr: PmuHdr,
    pub body: Vec<u8>,
}

impl PmuCmd {
    /// Command for `unit_id` carrying `body`; the header size is derived.
    pub fn new(unit_id: u8, body: Vec<u8>) -> PmuResult<Self> {
        let size = PMU_CMD_HDR_SIZE as usize + body.len();
        let size = u8::try_from(size).map_err(|_| PmuError::InvalidArgument("command too large"))?;
        Ok(Self {
            hdr: PmuHdr {
                unit_id,
                size,
                ctrl_flags: 0,
                seq_id: 0,
            },
            body,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        packet_to_bytes(&self.hdr, &self.body)
    }

    pub fn from_bytes(bytes: &[u8]) -> PmuResult<Self> {
        let (hdr, body) = packet_from_bytes(bytes)?;
        Ok(Self { hdr, body })
    }

    /// RPC commands carry the RPC marker as their first body byte.
    #[must_use]
    pub fn is_rpc(&self) -> bool {
        self.body.first() == Some(&NV_PMU_RPC_CMD_ID)
    }
}

/// RTOS to host message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PmuMsg {
    pub hdr: PmuHdr,
    pub body: Vec<u8>,
}

impl PmuMsg {
    pub fn new(unit_id: u8, seq_id: u8, flags: CtrlFlags, body: Vec<u8>) -> PmuResult<Self> {
        let size = PMU_MSG_HDR_SIZE as usize + body.len();
        let size = u8::try_from(size).map_err(|_| PmuError::InvalidArgument("message too large"))?;
        Ok(Self {
            hdr: PmuHdr {
                unit_id,
                size,
                ctrl_flags: flags.bits(),
                seq_id,
            },
            body,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        packet_to_bytes(&self.hdr, &self.body)
    }

    pub fn from_bytes(bytes: &[u8]) -> PmuResult<Self> {
        let (hdr, body) = packet_from_bytes(bytes)?;
        Ok(Self { hdr, body })
    }

    #[must_use]
    pub fn is_event(&self) -> bool {
        self.hdr.flags().contains(CtrlFlags::EVENT)
    }

    /// RC unit "unhandled command" reply.
    #[must_use]
    pub fn is_unhandled_cmd(&self) -> bool {
        self.hdr.unit_id == PMU_UNIT_RC && self.body.first() == Some(&PMU_RC_MSG_TYPE_UNHANDLED_CMD)
    }
}

/// RPC header at the start of every RPC buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcHeader {
    pub unit_id: u8,
    pub function: u8,
    pub flags: u8,
    pub flcn_status: u8,
    pub size_rpc: u16,
    pub size_scratch: u16,
}

impl RpcHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PMU_RPC_HDR_SIZE] {
        let rpc = self.size_rpc.to_le_bytes();
        let scratch = self.size_scratch.to_le_bytes();
        [
            self.unit_id,
            self.function,
            self.flags,
            self.flcn_status,
            rpc[0],
            rpc[1],
            scratch[0],
            scratch[1],
        ]
    }

    pub fn from_bytes(b: &[u8]) -> PmuResult<Self> {
        if b.len() < PMU_RPC_HDR_SIZE {
            return Err(PmuError::InvalidArgument("rpc buffer shorter than its header"));
        }
        Ok(Self {
            unit_id: b[0],
            function: b[1],
            flags: b[2],
            flcn_status: b[3],
            size_rpc: u16::from_le_bytes([b[4], b[5]]),
            size_scratch: u16::from_le_bytes([b[6], b[7]]),
        })
    }
}

/// Body of an RPC command: where the RPC buffer sits in DMEM (or in the FB
/// queue element heap).
#[must_use]
pub fn rpc_cmd_body(rpc_dmem_size: u16, rpc_dmem_ptr: u32) -> Vec<u8> {
    let mut body = vec![NV_PMU_RPC_CMD_ID, 0];
    body.extend_from_slice(&rpc_dmem_size.to_le_bytes());
    body.extend_from_slice(&rpc_dmem_ptr.to_le_bytes());
    body
}

/// `(rpc_dmem_size, rpc_dmem_ptr)` from an RPC command body.
pub fn parse_rpc_cmd_body(body: &[u8]) -> PmuResult<(u16, u32)> {
    if body.len() < PMU_RPC_CMD_BODY_SIZE || body[0] != NV_PMU_RPC_CMD_ID {
        return Err(PmuError::InvalidArgument("not an rpc command"));
    }
    Ok((
        u16::from_le_bytes([body[2], body[3]]),
        u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
    ))
}

/// Queue description inside the INIT message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueInfo {
    /// DMEM byte offset, or super surface offset in FB queue mode.
    pub offset: u32,
    /// Bytes, or elements in FB queue mode. Zero means absent.
    pub size: u16,
    pub index: u8,
    pub id: u8,
}

/// First message the RTOS sends after boot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PmuInitMsg {
    pub fb_queues: bool,
    pub queue_info: [QueueInfo; PMU_QUEUE_COUNT],
    pub sw_managed_area_offset: u32,
    pub sw_managed_area_size: u32,
}

const INIT_QUEUE_INFO_SIZE: usize = 8;
pub const PMU_INIT_MSG_BODY_SIZE: usize = 4 + PMU_QUEUE_COUNT * INIT_QUEUE_INFO_SIZE + 8;

impl PmuInitMsg {
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(PMU_INIT_MSG_BODY_SIZE);
        b.push(PMU_INIT_MSG_TYPE_PMU_INIT);
        b.push(u8::from(self.fb_queues));
        b.extend_from_slice(&[0, 0]);
        for q in &self.queue_info {
            b.extend_from_slice(&q.offset.to_le_bytes());
            b.extend_from_slice(&q.size.to_le_bytes());
            b.push(q.index);
            b.push(q.id);
        }
        b.extend_from_slice(&self.sw_managed_area_offset.to_le_bytes());
        b.extend_from_slice(&self.sw_managed_area_size.to_le_bytes());
        b
    }

    pub fn decode(msg: &PmuMsg) -> PmuResult<Self> {
        let b = &msg.body;
        if msg.hdr.unit_id != PMU_UNIT_INIT
            || b.len() < PMU_INIT_MSG_BODY_SIZE
            || b[0] != PMU_INIT_MSG_TYPE_PMU_INIT
        {
            return Err(PmuError::InvalidArgument("malformed PMU init message"));
        }
        let le32 = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        let mut queue_info = [QueueInfo::default(); PMU_QUEUE_COUNT];
        for (i, q) in queue_info.iter_mut().enumerate() {
            let o = 4 + i * INIT_QUEUE_INFO_SIZE;
            *q = QueueInfo {
                offset: le32(o),
                size: u16::from_le_bytes([b[o + 4], b[o + 5]]),
                index: b[o + 6],
                id: b[o + 7],
            };
        }
        let tail = 4 + PMU_QUEUE_COUNT * INIT_QUEUE_INFO_SIZE;
        Ok(Self {
            fb_queues: b[1] != 0,
            queue_info,
            sw_managed_area_offset: le32(tail),
            sw_managed_area_size: le32(tail + 4),
        })
    }

    #[must_use]
    pub fn queue(&self, id: QueueId) -> &QueueInfo {
        &self.queue_info[id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_size_field_is_rejected() {
        let bytes = [PMU_UNIT_PG, 2, 0, 0];
        assert!(PmuCmd::from_bytes(&bytes).is_err());
    }

    #[test]
    fn unhandled_rc_reply_is_detected() {
        let msg = PmuMsg::new(PMU_UNIT_RC, 3, CtrlFlags::empty(), vec![PMU_RC_MSG_TYPE_UNHANDLED_CMD, 0, 0, 0])
            .unwrap();
        assert!(msg.is_unhandled_cmd());
        assert!(!msg.is_event());
    }
}
