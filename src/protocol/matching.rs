//! Posted and unexpected message queues.
//!
//! A message matches a posted receive when `(msg & mask) == (recv & mask)`
//! with the receive's mask. Posted receives are searched in posting order and
//! unexpected messages in arrival order, so two messages with the same tag
//! from the same peer are delivered in the order they arrived.

use crate::core::match_info::MatchInfo;
use crate::core::packet::RegionId;
use crate::protocol::completion::{PeerAddr, RequestId};
use bytes::Bytes;
use std::collections::VecDeque;

/// A receive waiting for a message.
#[derive(Debug, Clone)]
pub struct PostedRecv {
    pub request: RequestId,
    pub match_info: MatchInfo,
    pub mask: u64,
    /// Region over the receive buffer; `None` for an empty buffer.
    pub region: Option<RegionId>,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub enum Arrival {
    /// Whole payload already here (tiny, small or reassembled medium).
    Eager(Bytes),
    /// Payload still in the sender's region.
    Rendezvous {
        msg_length: u32,
        sender_region: RegionId,
    },
}

/// A message that arrived before a matching receive was posted.
#[derive(Debug, Clone)]
pub struct Unexpected {
    pub peer: PeerAddr,
    pub match_info: MatchInfo,
    pub lib_seqnum: u16,
    pub arrival: Arrival,
}

#[derive(Debug, Default)]
pub struct MatchQueues {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Unexpected>,
}

impl MatchQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the first posted receive accepting `match_info`.
    pub fn take_posted(&mut self, match_info: MatchInfo) -> Option<PostedRecv> {
        let pos = self
            .posted
            .iter()
            .position(|r| r.match_info.matches(match_info, r.mask))?;
        self.posted.remove(pos)
    }

    /// Remove the oldest unexpected message accepted by `(match_info, mask)`.
    pub fn take_unexpected(&mut self, match_info: MatchInfo, mask: u64) -> Option<Unexpected> {
        let pos = self
            .unexpected
            .iter()
            .position(|u| u.match_info.matches(match_info, mask))?;
        self.unexpected.remove(pos)
    }

    pub fn post(&mut self, recv: PostedRecv) {
        self.posted.push_back(recv);
    }

    pub fn push_unexpected(&mut self, msg: Unexpected) {
        self.unexpected.push_back(msg);
    }

    /// Drop unexpected rendezvous announces from `peer`; their source regions
    /// belong to an incarnation that no longer exists.
    pub fn forget_announces(&mut self, peer: PeerAddr) -> usize {
        let before = self.unexpected.len();
        self.unexpected
            .retain(|u| u.peer != peer || matches!(u.arrival, Arrival::Eager(_)));
        before - self.unexpected.len()
    }

    pub fn unexpected_len(&self) -> usize {
        self.unexpected.len()
    }

    /// Empty both queues, returning the posted receives.
    pub fn clear(&mut self) -> Vec<PostedRecv> {
        self.unexpected.clear();
        self.posted.drain(..).collect()
    }
}
