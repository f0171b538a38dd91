//! # Pull Contexts
//!
//! Receiver-side state of a rendezvous transfer.
//!
//! A large receive is split into contiguous chunks, and each chunk gets a
//! [`PullContext`] in the endpoint's [`PullTable`]. The context holds its own
//! reference on the destination region, the byte range it expects and the
//! ranges already received. Replies are correlated by `(handle, magic)`:
//!
//! - the handle is `(slot_generation << 16) | slot_index`, and the slot
//!   generation advances every time a slot is vacated, so a handle outlives
//!   its context only as a stale value
//! - the magic is drawn once per endpoint, so replies addressed to a previous
//!   incarnation of the endpoint fail the check
//!
//! A context leaves `Pulling` exactly once, either to `Completed` when its
//! received byte count reaches its expected length, or to `Abandoned`. Both
//! transitions happen under the context mutex, so a reply racing with a
//! timeout either lands before the abandonment or is discarded as stale.

use crate::core::packet::RegionId;
use crate::error::{MxError, Result};
use crate::memory::RegionRef;
use crate::protocol::completion::RequestId;
use crate::utils::intervals::IntervalSet;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, trace};

const HANDLE_INDEX_BITS: u32 = 16;
const HANDLE_INDEX_MASK: u32 = (1 << HANDLE_INDEX_BITS) - 1;

/// Correlation handle carried in pull requests and echoed in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PullHandle(pub u32);

impl PullHandle {
    pub const fn new(index: u16, generation: u16) -> Self {
        Self(((generation as u32) << HANDLE_INDEX_BITS) | index as u32)
    }

    pub const fn index(self) -> usize {
        (self.0 & HANDLE_INDEX_MASK) as usize
    }

    pub const fn generation(self) -> u16 {
        (self.0 >> HANDLE_INDEX_BITS) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Pulling,
    Completed,
    Abandoned,
}

/// Result of applying one accepted reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Bytes were filled; the context still expects more.
    Progress { accepted: u64 },
    /// The reply completed the context.
    Completed { accepted: u64, owner: RequestId },
}

impl ReplyOutcome {
    pub fn accepted(&self) -> u64 {
        match *self {
            ReplyOutcome::Progress { accepted } | ReplyOutcome::Completed { accepted, .. } => {
                accepted
            }
        }
    }
}

#[derive(Debug)]
pub struct PullContext {
    handle: PullHandle,
    owner: RequestId,
    region_id: RegionId,
    region: Option<RegionRef>,
    range: Range<u64>,
    received: IntervalSet,
    state: PullState,
}

impl PullContext {
    fn new(handle: PullHandle, owner: RequestId, region: RegionRef, range: Range<u64>) -> Self {
        Self {
            handle,
            owner,
            region_id: region.id(),
            region: Some(region),
            range,
            received: IntervalSet::new(),
            state: PullState::Pulling,
        }
    }

    pub fn handle(&self) -> PullHandle {
        self.handle
    }

    pub fn owner(&self) -> RequestId {
        self.owner
    }

    pub fn state(&self) -> PullState {
        self.state
    }

    /// Region offsets this context fills.
    pub fn range(&self) -> Range<u64> {
        self.range.clone()
    }

    pub fn expected(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn received(&self) -> u64 {
        self.received.covered()
    }

    /// Apply a reply slice at region offset `offset`.
    ///
    /// Anything not strictly inside the outstanding part of the range, or
    /// aimed at another region, is a `StaleReply` and leaves the context
    /// untouched.
    pub fn accept(&mut self, region: RegionId, offset: u64, payload: &[u8]) -> Result<ReplyOutcome> {
        if self.state != PullState::Pulling || region != self.region_id {
            return Err(MxError::StaleReply);
        }
        let end = offset
            .checked_add(payload.len() as u64)
            .ok_or(MxError::StaleReply)?;
        let piece = offset..end;
        if piece.is_empty()
            || piece.start < self.range.start
            || piece.end > self.range.end
            || !self.received.is_disjoint(&piece)
        {
            return Err(MxError::StaleReply);
        }

        let dst = self.region.as_ref().ok_or(MxError::StaleReply)?;
        dst.fill(offset, payload)?;
        self.received.insert(piece);
        let accepted = payload.len() as u64;

        if self.received.covered() == self.expected() {
            self.state = PullState::Completed;
            if let Some(region) = self.region.take() {
                region.release();
            }
            trace!(target: "mx::pull", handle = self.handle.0, "Pull context completed");
            return Ok(ReplyOutcome::Completed {
                accepted,
                owner: self.owner,
            });
        }
        Ok(ReplyOutcome::Progress { accepted })
    }

    /// Move to `Abandoned` and drop the region reference.
    ///
    /// Returns false if the context had already left `Pulling`.
    pub fn abandon(&mut self) -> bool {
        if self.state != PullState::Pulling {
            return false;
        }
        self.state = PullState::Abandoned;
        if let Some(region) = self.region.take() {
            region.release();
        }
        true
    }
}

pub type SharedContext = Arc<Mutex<PullContext>>;

#[derive(Debug, Default)]
struct Slot {
    generation: u16,
    deadline: Option<Instant>,
    context: Option<SharedContext>,
}

/// Endpoint-wide table of outstanding pull contexts.
#[derive(Debug)]
pub struct PullTable {
    slots: Mutex<Vec<Slot>>,
    magic: u32,
}

impl PullTable {
    pub fn new(capacity: usize, magic: u32) -> Self {
        let capacity = capacity.clamp(1, 1 << HANDLE_INDEX_BITS);
        Self {
            slots: Mutex::new((0..capacity).map(|_| Slot::default()).collect()),
            magic,
        }
    }

    /// Token every reply must echo back.
    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.slots
            .lock()
            .map(|s| s.iter().filter(|s| s.context.is_none()).count())
            .unwrap_or(0)
    }

    /// Contexts currently outstanding.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .map(|s| s.iter().filter(|s| s.context.is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a context that fills `range` of `region` on behalf of `owner`.
    pub fn insert(
        &self,
        owner: RequestId,
        region: RegionRef,
        range: Range<u64>,
        deadline: Instant,
    ) -> Result<PullHandle> {
        region.check_range(range.start, range.end - range.start)?;
        let mut slots = self.slots.lock()?;
        let index = slots
            .iter()
            .position(|s| s.context.is_none())
            .ok_or(MxError::PullTableFull)?;
        let slot = &mut slots[index];
        let handle = PullHandle::new(index as u16, slot.generation);
        slot.deadline = Some(deadline);
        slot.context = Some(Arc::new(Mutex::new(PullContext::new(
            handle, owner, region, range,
        ))));
        debug!(target: "mx::pull", handle = handle.0, owner = owner.0, "Pull context created");
        Ok(handle)
    }

    /// Find the outstanding context named by a reply's correlation pair.
    pub fn lookup(&self, handle: u32, magic: u32) -> Result<SharedContext> {
        if magic != self.magic {
            return Err(MxError::StaleReply);
        }
        let handle = PullHandle(handle);
        let slots = self.slots.lock()?;
        slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation())
            .and_then(|s| s.context.clone())
            .ok_or(MxError::StaleReply)
    }

    /// Vacate the slot of `handle`, invalidating the handle.
    pub fn remove(&self, handle: PullHandle) -> Option<SharedContext> {
        let mut slots = self.slots.lock().ok()?;
        let slot = slots.get_mut(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        let context = slot.context.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.deadline = None;
        Some(context)
    }

    /// Look up, fill and retire on completion in one step.
    pub fn apply_reply(
        &self,
        handle: u32,
        magic: u32,
        region: RegionId,
        offset: u64,
        payload: &[u8],
    ) -> Result<ReplyOutcome> {
        let context = self.lookup(handle, magic)?;
        let outcome = context.lock()?.accept(region, offset, payload)?;
        if let ReplyOutcome::Completed { .. } = outcome {
            self.remove(PullHandle(handle));
        }
        Ok(outcome)
    }

    /// Vacate and abandon the contexts of `handles`; returns how many were
    /// still pulling.
    pub fn abandon(&self, handles: &[PullHandle]) -> usize {
        handles
            .iter()
            .filter_map(|&h| self.remove(h))
            .filter(|ctx| ctx.lock().map(|mut c| c.abandon()).unwrap_or(false))
            .count()
    }

    /// Owners of contexts whose deadline is at or before `now`.
    pub fn expired(&self, now: Instant) -> Vec<RequestId> {
        let Ok(slots) = self.slots.lock() else {
            return Vec::new();
        };
        let mut owners: Vec<RequestId> = slots
            .iter()
            .filter(|s| s.deadline.is_some_and(|d| d <= now))
            .filter_map(|s| s.context.as_ref())
            .filter_map(|ctx| ctx.lock().ok().map(|c| c.owner()))
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Abandon every outstanding context.
    pub fn drain(&self) -> usize {
        let handles: Vec<PullHandle> = match self.slots.lock() {
            Ok(slots) => slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.context.is_some())
                .map(|(i, s)| PullHandle::new(i as u16, s.generation))
                .collect(),
            Err(_) => return 0,
        };
        self.abandon(&handles)
    }
}

/// Partition `[offset, offset + length)` into contiguous pieces of at most
/// `chunk` bytes.
///
/// The result is checked before it is returned: pieces are non-empty, start
/// at `offset`, abut each other and end at `offset + length`. A violation is
/// reported as `PartitionViolation` and nothing is emitted.
pub fn split_pull_ranges(offset: u64, length: u64, chunk: u64) -> Result<Vec<Range<u64>>> {
    if chunk == 0 {
        return Err(MxError::PartitionViolation("zero chunk size".to_string()));
    }
    let end = offset
        .checked_add(length)
        .ok_or_else(|| MxError::PartitionViolation("range overflows".to_string()))?;

    let mut ranges = Vec::with_capacity(length.div_ceil(chunk) as usize);
    let mut start = offset;
    while start < end {
        let stop = start + chunk.min(end - start);
        ranges.push(start..stop);
        start = stop;
    }

    verify_partition(&ranges, offset..end)?;
    Ok(ranges)
}

fn verify_partition(ranges: &[Range<u64>], whole: Range<u64>) -> Result<()> {
    let mut cursor = whole.start;
    for r in ranges {
        if r.start != cursor || r.is_empty() {
            return Err(MxError::PartitionViolation(format!(
                "piece {r:?} does not continue at {cursor}"
            )));
        }
        cursor = r.end;
    }
    if cursor != whole.end {
        return Err(MxError::PartitionViolation(format!(
            "pieces end at {cursor}, expected {}",
            whole.end
        )));
    }
    Ok(())
}
