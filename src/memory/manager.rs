//! # Region Manager
//!
//! Owns the mapping from region id to pinned region for one endpoint.
//!
//! ## Lifecycle
//! - `register` pins every span and publishes a frozen region in a free slot
//! - `acquire` hands out a [`RegionRef`], bumping the atomic reference count
//! - `deregister` records the owner's intent; the region is destroyed and its
//!   pages unpinned once no reference is held
//! - dropping or releasing the last [`RegionRef`] of a pending region destroys it
//!
//! Slot changes and the decision to destroy are taken under the table write
//! lock, and `acquire` refuses pending regions under the read lock, so a count
//! that reached zero on a pending region can never be revived. Fill and
//! extract through a reference take no table lock at all.

use crate::core::packet::RegionId;
use crate::error::{MxError, Result};
use crate::memory::pinner::{PagePinner, PinnedPage, PAGE_SIZE};
use crate::memory::region::{Segment, Span, UserRegion};
use crate::utils::metrics::{Metrics, Timer};
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use tracing::{debug, instrument, warn};

/// Upper bound imposed by the 8-bit region index on the wire.
pub const MAX_REGIONS: usize = 256;

#[derive(Debug, Default)]
struct Slot {
    seqnum: u8,
    region: Option<Arc<UserRegion>>,
}

struct RegionTable {
    slots: RwLock<Vec<Slot>>,
    pinner: Arc<dyn PagePinner>,
    metrics: Arc<Metrics>,
}

impl RegionTable {
    /// Destroy `region` if it is pending, unreferenced and still published.
    fn try_destroy(&self, region: &Arc<UserRegion>) -> Result<()> {
        let victim = {
            let mut slots = self.slots.write()?;
            let slot = &mut slots[region.id().index as usize];
            let published = slot
                .region
                .as_ref()
                .is_some_and(|r| Arc::ptr_eq(r, region));
            if !published
                || !region.deregister_pending.load(Ordering::Acquire)
                || region.refcount.load(Ordering::Acquire) != 0
            {
                return Ok(());
            }
            slot.seqnum = slot.seqnum.wrapping_add(1);
            slot.region.take()
        };

        if let Some(region) = victim {
            for seg in region.segments() {
                self.pinner.unpin(&seg.pages);
            }
            self.metrics.region_destroyed();
            debug!(target: "mx::region", region = %region.id(), "Region destroyed");
        }
        Ok(())
    }

    fn release(&self, region: &Arc<UserRegion>) {
        let prev = region.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "region reference released twice");
        if prev == 1 && region.deregister_pending.load(Ordering::Acquire) {
            if let Err(e) = self.try_destroy(region) {
                warn!(target: "mx::region", region = %region.id(), error = %e, "Deferred destroy failed");
            }
        }
    }
}

/// Per-endpoint registry of pinned user regions.
#[derive(Clone)]
pub struct RegionManager {
    table: Arc<RegionTable>,
}

impl RegionManager {
    pub fn new(pinner: Arc<dyn PagePinner>, max_regions: usize) -> Self {
        Self::with_metrics(pinner, max_regions, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(
        pinner: Arc<dyn PagePinner>,
        max_regions: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let count = max_regions.clamp(1, MAX_REGIONS);
        let slots = (0..count).map(|_| Slot::default()).collect();
        Self {
            table: Arc::new(RegionTable {
                slots: RwLock::new(slots),
                pinner,
                metrics,
            }),
        }
    }

    /// Pin `spans` and publish them as one region.
    ///
    /// Pinning failures are returned to the caller; pages pinned for earlier
    /// spans are released first.
    #[instrument(level = "debug", skip(self, spans), fields(spans = spans.len()))]
    pub fn register(&self, spans: &[Span]) -> Result<RegionId> {
        let _timer = Timer::start("region_register");
        let mut segments = Vec::with_capacity(spans.len());
        for span in spans {
            match self.table.pinner.pin(span.addr, span.len) {
                Ok(pages) => segments.push(Segment {
                    page_offset: (span.addr as usize) & (PAGE_SIZE - 1),
                    length: span.len,
                    pages,
                }),
                Err(e) => {
                    self.unpin_segments(&segments);
                    return Err(e);
                }
            }
        }

        let mut slots = match self.table.slots.write() {
            Ok(slots) => slots,
            Err(_) => {
                self.unpin_segments(&segments);
                return Err(MxError::LockPoisoned);
            }
        };
        let Some(index) = slots.iter().position(|s| s.region.is_none()) else {
            drop(slots);
            self.unpin_segments(&segments);
            return Err(MxError::RegionTableFull);
        };

        let slot = &mut slots[index];
        let id = RegionId::new(index as u8, slot.seqnum);
        let region = Arc::new(UserRegion::new(id, segments));
        debug!(target: "mx::region", region = %id, length = region.len(), "Region registered");
        slot.region = Some(region);
        self.table.metrics.region_registered();
        Ok(id)
    }

    /// Record the owner's intent to drop the region.
    ///
    /// Takes effect immediately if nothing references the region, otherwise
    /// when the last reference is released.
    pub fn deregister(&self, id: RegionId) -> Result<()> {
        let region = {
            let slots = self.table.slots.read()?;
            let region = lookup(&slots, id)?;
            if region.deregister_pending.swap(true, Ordering::AcqRel) {
                return Err(MxError::InvalidRegion(id));
            }
            region
        };
        debug!(target: "mx::region", region = %id, refs = region.refcount(), "Deregistration requested");
        self.table.try_destroy(&region)
    }

    /// Take a reference for an in-flight operation.
    pub fn acquire(&self, id: RegionId) -> Result<RegionRef> {
        let slots = self.table.slots.read()?;
        let region = lookup(&slots, id)?;
        region.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(RegionRef {
            region,
            table: self.table.clone(),
            released: false,
        })
    }

    /// Deregister every live region; used on endpoint teardown.
    pub fn deregister_all(&self) -> Result<()> {
        let live: Vec<Arc<UserRegion>> = {
            let slots = self.table.slots.read()?;
            slots
                .iter()
                .filter_map(|s| s.region.clone())
                .filter(|r| !r.deregister_pending.swap(true, Ordering::AcqRel))
                .collect()
        };
        for region in &live {
            self.table.try_destroy(region)?;
        }
        Ok(())
    }

    /// Regions currently published (including deregistration-pending ones).
    pub fn live_regions(&self) -> usize {
        self.table
            .slots
            .read()
            .map(|s| s.iter().filter(|s| s.region.is_some()).count())
            .unwrap_or(0)
    }

    fn unpin_segments(&self, segments: &[Segment]) {
        let pages: Vec<PinnedPage> = segments.iter().flat_map(|s| s.pages.clone()).collect();
        self.table.pinner.unpin(&pages);
    }
}

/// Look up a live, not-yet-deregistered region. Must be called under the
/// table lock.
fn lookup(slots: &[Slot], id: RegionId) -> Result<Arc<UserRegion>> {
    slots
        .get(id.index as usize)
        .filter(|slot| slot.seqnum == id.seqnum)
        .and_then(|slot| slot.region.clone())
        .filter(|r| !r.deregister_pending.load(Ordering::Acquire))
        .ok_or(MxError::InvalidRegion(id))
}

/// A counted reference to a region, released on drop.
pub struct RegionRef {
    region: Arc<UserRegion>,
    table: Arc<RegionTable>,
    released: bool,
}

impl RegionRef {
    /// Release explicitly; equivalent to dropping the reference.
    pub fn release(mut self) {
        self.released = true;
        self.table.release(&self.region);
    }
}

impl Deref for RegionRef {
    type Target = UserRegion;

    fn deref(&self) -> &Self::Target {
        &self.region
    }
}

impl Drop for RegionRef {
    fn drop(&mut self) {
        if !self.released {
            self.table.release(&self.region);
        }
    }
}

impl std::fmt::Debug for RegionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionRef")
            .field("id", &self.region.id())
            .field("len", &self.region.len())
            .field("refs", &self.region.refcount())
            .finish()
    }
}
