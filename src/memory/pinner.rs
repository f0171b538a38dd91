//! Page pinning collaborator.
//!
//! The region manager never pins memory itself; it asks a [`PagePinner`] for
//! the physical pages behind a span and hands them back when the region is
//! destroyed. [`HostMemory`] is the user-space implementation: a simulated
//! address space whose pages carry a pin count, so tests can observe exactly
//! when pages are released.

use crate::error::{MxError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, trace};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Base of the simulated address space.
const HOST_BASE_ADDR: u64 = 0x1000_0000;

/// Allocation granularity; buffers are deliberately not page aligned.
const HOST_ALLOC_ALIGN: u64 = 64;

/// One physical page frame.
#[derive(Debug)]
pub struct PageFrame {
    pfn: u64,
    data: RwLock<Box<[u8]>>,
    pins: AtomicUsize,
}

impl PageFrame {
    fn new(pfn: u64) -> Self {
        Self {
            pfn,
            data: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            pins: AtomicUsize::new(0),
        }
    }

    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Copy `dst.len()` bytes starting at `offset` within the page.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let data = self.data.read()?;
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    /// Copy `src` into the page at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        let mut data = self.data.write()?;
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// A page kept resident for as long as this handle is held by a region.
pub type PinnedPage = Arc<PageFrame>;

/// Source of pinned physical pages.
pub trait PagePinner: Send + Sync {
    /// Pin every page touched by `[addr, addr + len)`, in address order.
    fn pin(&self, addr: u64, len: u64) -> Result<Vec<PinnedPage>>;

    /// Release pages previously returned by [`PagePinner::pin`].
    fn unpin(&self, pages: &[PinnedPage]);
}

/// Simulated user address space backed by lazily created page frames.
#[derive(Debug)]
pub struct HostMemory {
    frames: Mutex<BTreeMap<u64, PinnedPage>>,
    brk: AtomicU64,
    next_pfn: AtomicU64,
    pinned: AtomicUsize,
    pin_limit: AtomicUsize,
}

impl HostMemory {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(BTreeMap::new()),
            brk: AtomicU64::new(HOST_BASE_ADDR),
            next_pfn: AtomicU64::new(1),
            pinned: AtomicUsize::new(0),
            pin_limit: AtomicUsize::new(usize::MAX),
        }
    }

    /// Reserve `len` bytes and return their start address.
    pub fn alloc(&self, len: usize) -> u64 {
        let rounded = (len as u64).div_ceil(HOST_ALLOC_ALIGN).max(1) * HOST_ALLOC_ALIGN;
        self.brk.fetch_add(rounded, Ordering::AcqRel)
    }

    /// Cap the number of simultaneously pinned pages.
    pub fn set_pin_limit(&self, pages: usize) {
        self.pin_limit.store(pages, Ordering::Release);
    }

    /// Number of page pins currently held.
    pub fn pinned_pages(&self) -> usize {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn write(&self, addr: u64, src: &[u8]) -> Result<()> {
        self.check_mapped(addr, src.len() as u64)?;
        let mut done = 0usize;
        while done < src.len() {
            let at = addr + done as u64;
            let in_page = (at as usize) & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - in_page).min(src.len() - done);
            self.frame(at >> PAGE_SHIFT)?
                .write_at(in_page, &src[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.check_mapped(addr, len as u64)?;
        let mut out = vec![0u8; len];
        let mut done = 0usize;
        while done < len {
            let at = addr + done as u64;
            let in_page = (at as usize) & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - in_page).min(len - done);
            self.frame(at >> PAGE_SHIFT)?
                .read_at(in_page, &mut out[done..done + chunk])?;
            done += chunk;
        }
        Ok(out)
    }

    fn check_mapped(&self, addr: u64, len: u64) -> Result<()> {
        let end = addr
            .checked_add(len)
            .ok_or_else(|| MxError::PinFailed(format!("span at 0x{addr:x} wraps")))?;
        if addr < HOST_BASE_ADDR || end > self.brk.load(Ordering::Acquire) {
            return Err(MxError::PinFailed(format!(
                "span 0x{addr:x}+{len} is not mapped"
            )));
        }
        Ok(())
    }

    fn frame(&self, vpn: u64) -> Result<PinnedPage> {
        let mut frames = self.frames.lock()?;
        let frame = frames.entry(vpn).or_insert_with(|| {
            let pfn = self.next_pfn.fetch_add(1, Ordering::Relaxed);
            trace!(vpn, pfn, "Faulted in page frame");
            Arc::new(PageFrame::new(pfn))
        });
        Ok(frame.clone())
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PagePinner for HostMemory {
    fn pin(&self, addr: u64, len: u64) -> Result<Vec<PinnedPage>> {
        self.check_mapped(addr, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let first = addr >> PAGE_SHIFT;
        let last = (addr + len - 1) >> PAGE_SHIFT;
        let count = (last - first + 1) as usize;

        let limit = self.pin_limit.load(Ordering::Acquire);
        let held = self.pinned.fetch_add(count, Ordering::AcqRel);
        if held.saturating_add(count) > limit {
            self.pinned.fetch_sub(count, Ordering::AcqRel);
            return Err(MxError::PinFailed(format!(
                "pin limit of {limit} pages reached"
            )));
        }

        let mut pages = Vec::with_capacity(count);
        for vpn in first..=last {
            match self.frame(vpn) {
                Ok(frame) => {
                    frame.pins.fetch_add(1, Ordering::AcqRel);
                    pages.push(frame);
                }
                Err(e) => {
                    self.pinned.fetch_sub(count - pages.len(), Ordering::AcqRel);
                    self.unpin(&pages);
                    return Err(e);
                }
            }
        }
        debug!(addr, len, pages = count, "Pinned span");
        Ok(pages)
    }

    fn unpin(&self, pages: &[PinnedPage]) {
        for page in pages {
            page.pins.fetch_sub(1, Ordering::AcqRel);
        }
        self.pinned.fetch_sub(pages.len(), Ordering::AcqRel);
        debug!(pages = pages.len(), "Unpinned pages");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_across_pages() {
        let mem = HostMemory::new();
        let addr = mem.alloc(3 * PAGE_SIZE);
        let data: Vec<u8> = (0..(2 * PAGE_SIZE + 100)).map(|i| i as u8).collect();
        mem.write(addr + 10, &data).unwrap();
        assert_eq!(mem.read(addr + 10, data.len()).unwrap(), data);
    }

    #[test]
    fn test_pin_counts_every_touched_page() {
        let mem = HostMemory::new();
        let addr = mem.alloc(2 * PAGE_SIZE + 64);
        // An unaligned span of exactly one page touches two frames.
        let start = (addr | (PAGE_SIZE as u64 - 1)) + 1 - 32;
        let pages = mem.pin(start, PAGE_SIZE as u64).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(mem.pinned_pages(), 2);
        assert!(pages.iter().all(|p| p.pin_count() == 1));

        mem.unpin(&pages);
        assert_eq!(mem.pinned_pages(), 0);
        assert!(pages.iter().all(|p| p.pin_count() == 0));
    }

    #[test]
    fn test_unmapped_span_fails() {
        let mem = HostMemory::new();
        assert!(matches!(mem.pin(0x10, 16), Err(MxError::PinFailed(_))));
        let addr = mem.alloc(64);
        assert!(mem.pin(addr, 4096 * 8).is_err());
    }

    #[test]
    fn test_pin_limit() {
        let mem = HostMemory::new();
        mem.set_pin_limit(1);
        let addr = mem.alloc(4 * PAGE_SIZE);
        assert!(mem.pin(addr, 3 * PAGE_SIZE as u64).is_err());
        assert_eq!(mem.pinned_pages(), 0);
    }
}
