//! Per-peer connection state.
//!
//! Each remote endpoint we exchange messages with has a [`Partner`] record:
//! the session id to stamp on packets sent to it, the generation of its
//! endpoint slot, and library sequence numbers in both directions.

use std::collections::{HashSet, VecDeque};

/// Sequence numbers remembered for duplicate suppression.
const SEQ_WINDOW: usize = 4096;

/// How a packet's source generation relates to the one on record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationCheck {
    /// First packet from this peer, or same incarnation.
    Current,
    /// The peer's endpoint slot was reopened; state was reset.
    Restarted,
    /// Traffic from an incarnation older than the one on record.
    Stale,
}

/// Recently delivered sequence numbers, oldest evicted first.
#[derive(Debug, Default)]
struct SeqWindow {
    seen: HashSet<u16>,
    order: VecDeque<u16>,
}

impl SeqWindow {
    fn contains(&self, seq: u16) -> bool {
        self.seen.contains(&seq)
    }

    fn insert(&mut self, seq: u16) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.order.push_back(seq);
        if self.order.len() > SEQ_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct Partner {
    /// Session of the remote endpoint, learned while connecting.
    pub session: Option<u32>,
    generation: Option<u8>,
    next_seqnum: u16,
    last_received: u16,
    delivered: SeqWindow,
}

impl Partner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `generation` to the one on record, resetting on a restart.
    pub fn observe_generation(&mut self, generation: u8) -> GenerationCheck {
        let Some(current) = self.generation else {
            self.generation = Some(generation);
            return GenerationCheck::Current;
        };
        match generation.wrapping_sub(current) as i8 {
            0 => GenerationCheck::Current,
            d if d > 0 => {
                *self = Partner {
                    generation: Some(generation),
                    ..Partner::default()
                };
                GenerationCheck::Restarted
            }
            _ => GenerationCheck::Stale,
        }
    }

    /// Sequence number for the next outgoing message.
    pub fn next_seqnum(&mut self) -> u16 {
        let seq = self.next_seqnum;
        self.next_seqnum = self.next_seqnum.wrapping_add(1);
        seq
    }

    /// Last sequence number received from the peer, piggy-backed on sends.
    pub fn piggyack(&self) -> u16 {
        self.last_received
    }

    pub fn already_delivered(&self, seq: u16) -> bool {
        self.delivered.contains(seq)
    }

    /// Record delivery of `seq`; false if it was delivered before.
    pub fn mark_delivered(&mut self, seq: u16) -> bool {
        if !self.delivered.insert(seq) {
            return false;
        }
        self.last_received = seq;
        true
    }
}
