//! User regions and the offset walk.
//!
//! A region is an ordered, frozen list of segments, each covering one pinned
//! span. Flat region offsets are resolved to (segment, page, byte) with a
//! prefix sum over segment lengths, so transfers are addressed by offset and
//! can be applied piecewise in any order.

use crate::core::packet::RegionId;
use crate::error::{MxError, Result};
use crate::memory::pinner::{PinnedPage, PAGE_SIZE};
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Caller-supplied `(address, length)` description of one buffer piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub addr: u64,
    pub len: u64,
}

impl Span {
    pub const fn new(addr: u64, len: u64) -> Self {
        Self { addr, len }
    }
}

/// One pinned span.
#[derive(Debug)]
pub struct Segment {
    /// Offset of the first byte within the first page.
    pub page_offset: usize,
    pub length: u64,
    pub pages: Vec<PinnedPage>,
}

#[derive(Debug)]
pub struct UserRegion {
    id: RegionId,
    segments: Vec<Segment>,
    /// `starts[i]` is the region offset of `segments[i]`.
    starts: Vec<u64>,
    length: u64,
    pub(crate) refcount: AtomicUsize,
    pub(crate) deregister_pending: AtomicBool,
}

impl UserRegion {
    pub(crate) fn new(id: RegionId, segments: Vec<Segment>) -> Self {
        let mut starts = Vec::with_capacity(segments.len());
        let mut length = 0u64;
        for seg in &segments {
            starts.push(length);
            length += seg.length;
        }
        Self {
            id,
            segments,
            starts,
            length,
            refcount: AtomicUsize::new(0),
            deregister_pending: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// References currently held by in-flight operations.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.length => Ok(()),
            _ => Err(MxError::OutOfRange {
                offset,
                length,
                region_length: self.length,
            }),
        }
    }

    /// Write `src` into the region starting at `offset`.
    pub fn fill(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len() as u64)?;
        let mut done = 0usize;
        self.walk(offset, src.len() as u64, |page, in_page, n| {
            page.write_at(in_page, &src[done..done + n])?;
            done += n;
            Ok(())
        })
    }

    /// Append `length` bytes read from `offset` to `dst`.
    pub fn extract(&self, offset: u64, length: u64, dst: &mut BytesMut) -> Result<()> {
        self.check_range(offset, length)?;
        dst.reserve(length as usize);
        let mut scratch = [0u8; PAGE_SIZE];
        self.walk(offset, length, |page, in_page, n| {
            page.read_at(in_page, &mut scratch[..n])?;
            dst.put_slice(&scratch[..n]);
            Ok(())
        })
    }

    /// Visit `(page, byte offset in page, byte count)` pieces covering
    /// `[offset, offset + length)` in order. The range must already be checked.
    fn walk<F>(&self, offset: u64, length: u64, mut visit: F) -> Result<()>
    where
        F: FnMut(&PinnedPage, usize, usize) -> Result<()>,
    {
        if length == 0 {
            return Ok(());
        }
        // Last segment starting at or before `offset`, skipping empty ones.
        let mut seg_idx = self.starts.partition_point(|&s| s <= offset) - 1;
        let mut in_seg = offset - self.starts[seg_idx];
        let mut left = length;

        while left > 0 {
            let seg = &self.segments[seg_idx];
            if in_seg >= seg.length {
                seg_idx += 1;
                in_seg = 0;
                continue;
            }
            let absolute = seg.page_offset as u64 + in_seg;
            let page_idx = (absolute / PAGE_SIZE as u64) as usize;
            let in_page = (absolute % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - in_page)
                .min((seg.length - in_seg) as usize)
                .min(left as usize);

            visit(&seg.pages[page_idx], in_page, n)?;

            in_seg += n as u64;
            left -= n as u64;
        }
        Ok(())
    }
}
