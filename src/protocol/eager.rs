//! Eager message paths.
//!
//! Messages small enough to copy travel with their payload: tiny and small
//! in one packet, medium as a train of fragments each carrying its offset in
//! the message. Fragments are reassembled by offset, so reordering needs no
//! special handling and a duplicated fragment is refused by the interval
//! bookkeeping instead of being counted twice.

use crate::config::EngineConfig;
use crate::core::packet::{EagerMsg, MediumFrag, MsgHeader, Packet, Route};
use crate::error::{MalformedKind, MxError, Result};
use crate::utils::intervals::IntervalSet;
use bytes::{Bytes, BytesMut};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Tiny,
    Small,
    Medium,
    Rendezvous,
}

impl SizeClass {
    pub fn of(length: u64, config: &EngineConfig) -> Self {
        match length {
            n if n <= config.tiny_max as u64 => SizeClass::Tiny,
            n if n <= config.small_max as u64 => SizeClass::Small,
            n if n <= config.medium_max as u64 => SizeClass::Medium,
            _ => SizeClass::Rendezvous,
        }
    }
}

/// Packets carrying an eager message of class `class`.
pub fn eager_packets(
    class: SizeClass,
    route: Route,
    msg: MsgHeader,
    payload: Bytes,
    frag_size: usize,
) -> Vec<Packet> {
    match class {
        SizeClass::Tiny => vec![Packet::Tiny(EagerMsg {
            route,
            msg,
            payload,
        })],
        SizeClass::Small => vec![Packet::Small(EagerMsg {
            route,
            msg,
            payload,
        })],
        SizeClass::Medium | SizeClass::Rendezvous => fragment(route, msg, payload, frag_size)
            .into_iter()
            .map(Packet::MediumFrag)
            .collect(),
    }
}

/// Cut `payload` into fragments of at most `frag_size` bytes.
pub fn fragment(route: Route, msg: MsgHeader, payload: Bytes, frag_size: usize) -> Vec<MediumFrag> {
    let msg_length = payload.len() as u32;
    let frag_size = frag_size.max(1);
    (0..payload.len())
        .step_by(frag_size)
        .map(|start| {
            let end = (start + frag_size).min(payload.len());
            MediumFrag {
                route,
                msg,
                msg_length,
                frag_offset: start as u32,
                payload: payload.slice(start..end),
            }
        })
        .collect()
}

/// One medium message being put back together.
#[derive(Debug)]
pub struct MediumReassembly {
    msg: MsgHeader,
    data: BytesMut,
    received: IntervalSet,
    deadline: Instant,
}

impl MediumReassembly {
    pub fn new(first: &MediumFrag, deadline: Instant) -> Self {
        Self {
            msg: first.msg,
            data: BytesMut::zeroed(first.msg_length as usize),
            received: IntervalSet::new(),
            deadline,
        }
    }

    pub fn header(&self) -> MsgHeader {
        self.msg
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_complete(&self) -> bool {
        self.received.covered() == self.data.len() as u64
    }

    /// Copy `frag` into place. Returns `StaleReply` for a duplicate and
    /// `MalformedPacket` for a fragment that disagrees with the message.
    pub fn accept(&mut self, frag: &MediumFrag) -> Result<bool> {
        if frag.msg_length as usize != self.data.len() || frag.msg.match_info != self.msg.match_info
        {
            return Err(MxError::MalformedPacket(MalformedKind::LengthMismatch));
        }
        let start = frag.frag_offset as usize;
        let end = start + frag.payload.len();
        if end > self.data.len() {
            return Err(MxError::MalformedPacket(MalformedKind::LengthMismatch));
        }
        if !self.received.insert(start as u64..end as u64) {
            return Err(MxError::StaleReply);
        }
        self.data[start..end].copy_from_slice(&frag.payload);
        Ok(self.is_complete())
    }

    pub fn into_payload(self) -> Bytes {
        self.data.freeze()
    }
}
