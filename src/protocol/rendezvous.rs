//! # Rendezvous
//!
//! Large messages are announced, not sent. The sender registers its buffer
//! as a region and emits a `Rndv` naming it; the receiver pulls the bytes
//! straight from that region into its own.
//!
//! ## Sender
//! - keeps a [`LargeSend`] holding a reference on the send region until the
//!   receiver's `Notify` arrives or the notify deadline passes
//! - services pull requests statelessly in [`service_pull_request`]: the
//!   region is looked up again for every request, so duplicated requests are
//!   simply served twice
//!
//! ## Receiver
//! - [`issue_pulls`] splits the transfer into chunks, creates one pull context
//!   per chunk and builds the matching pull requests
//! - a [`LargeRecv`] counts contexts still pulling; the message completes when
//!   the count reaches zero

use crate::core::match_info::MatchInfo;
use crate::core::packet::{PullReply, PullRequest, RegionId, Route};
use crate::error::{MxError, Result};
use crate::memory::{RegionManager, RegionRef};
use crate::protocol::completion::{PeerAddr, RequestId};
use crate::protocol::pull::{split_pull_ranges, PullHandle, PullTable};
use bytes::BytesMut;
use std::time::Instant;
use tracing::{debug, trace};

/// A rendezvous send waiting for the receiver's notify.
#[derive(Debug)]
pub struct LargeSend {
    pub request: RequestId,
    pub peer: PeerAddr,
    pub match_info: MatchInfo,
    pub length: u32,
    pub lib_seqnum: u16,
    pub region: RegionRef,
    pub deadline: Instant,
}

/// A matched rendezvous receive with pulls in flight.
#[derive(Debug)]
pub struct LargeRecv {
    pub request: RequestId,
    pub peer: PeerAddr,
    pub match_info: MatchInfo,
    pub msg_length: u32,
    /// Bytes actually pulled: the message length capped by the buffer.
    pub deliver_length: u32,
    pub recv_region: RegionId,
    pub sender_region: RegionId,
    pub lib_seqnum: u16,
    pub handles: Vec<PullHandle>,
    pub remaining: usize,
}

/// Parameters of one rendezvous receive, fixed once the announce matched.
#[derive(Debug, Clone, Copy)]
pub struct PullPlan {
    pub owner: RequestId,
    pub recv_region: RegionId,
    pub sender_region: RegionId,
    pub length: u64,
    pub chunk: u64,
    /// Route of the outgoing requests.
    pub route: Route,
    /// Session of the sending endpoint.
    pub session: u32,
    pub deadline: Instant,
}

/// Create the pull contexts and requests for `plan`.
///
/// Either every context is created or none is: on failure the contexts
/// already created are abandoned before the error is returned.
pub fn issue_pulls(
    table: &PullTable,
    regions: &RegionManager,
    plan: &PullPlan,
) -> Result<(Vec<PullHandle>, Vec<PullRequest>)> {
    let ranges = split_pull_ranges(0, plan.length, plan.chunk)?;
    if table.available() < ranges.len() {
        return Err(MxError::PullTableFull);
    }

    let mut handles = Vec::with_capacity(ranges.len());
    let mut requests = Vec::with_capacity(ranges.len());
    for range in ranges {
        let created = regions.acquire(plan.recv_region).and_then(|region| {
            table.insert(plan.owner, region, range.clone(), plan.deadline)
        });
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                table.abandon(&handles);
                return Err(e);
            }
        };
        handles.push(handle);
        requests.push(PullRequest {
            route: plan.route,
            session: plan.session,
            length: (range.end - range.start) as u32,
            puller_region: plan.recv_region,
            pulled_region: plan.sender_region,
            puller_offset: range.start as u32,
            pulled_offset: range.start as u32,
            src_pull_handle: handle.0,
            src_magic: table.magic(),
        });
    }
    debug!(
        target: "mx::pull",
        owner = %plan.owner,
        contexts = handles.len(),
        length = plan.length,
        "Pulls issued"
    );
    Ok((handles, requests))
}

/// Serve one pull request from the local region table.
///
/// The named region is acquired for the duration of the extraction only.
/// The requested range is answered with replies of at most
/// `max_reply_payload` bytes that partition it exactly; each reply's payload
/// is a slice of one extracted buffer.
pub fn service_pull_request(
    regions: &RegionManager,
    req: &PullRequest,
    reply_route: Route,
    max_reply_payload: usize,
) -> Result<Vec<PullReply>> {
    let region = regions.acquire(req.pulled_region)?;
    let offset = req.pulled_offset as u64;
    let length = req.length as u64;
    region.check_range(offset, length)?;

    let pieces = split_pull_ranges(offset, length, max_reply_payload as u64)?;
    let mut data = BytesMut::with_capacity(req.length as usize);
    region.extract(offset, length, &mut data)?;
    region.release();
    let data = data.freeze();

    let replies = pieces
        .into_iter()
        .map(|piece| {
            let rel = (piece.start - offset) as usize;
            let len = (piece.end - piece.start) as usize;
            PullReply {
                route: reply_route,
                puller_region: req.puller_region,
                puller_offset: req.puller_offset.wrapping_add(rel as u32),
                dst_pull_handle: req.src_pull_handle,
                dst_magic: req.src_magic,
                payload: data.slice(rel..rel + len),
            }
        })
        .collect::<Vec<_>>();
    trace!(
        target: "mx::pull",
        region = %req.pulled_region,
        offset,
        length,
        replies = replies.len(),
        "Pull request serviced"
    );
    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HostMemory, Span};
    use std::sync::Arc;

    fn request(region: RegionId, offset: u32, length: u32) -> PullRequest {
        PullRequest {
            route: Route::default(),
            session: 1,
            length,
            puller_region: RegionId::new(2, 0),
            pulled_region: region,
            puller_offset: offset,
            pulled_offset: offset,
            src_pull_handle: 0x0001_0003,
            src_magic: 0xFEED,
        }
    }

    #[test]
    fn test_service_splits_and_echoes_correlation() {
        let mem = Arc::new(HostMemory::new());
        let regions = RegionManager::new(mem.clone(), 8);
        let addr = mem.alloc(16384);
        let pattern: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        mem.write(addr, &pattern).unwrap();
        let id = regions.register(&[Span::new(addr, 16384)]).unwrap();

        let replies = service_pull_request(&regions, &request(id, 4096, 8192), Route::default(), 4096)
            .unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].puller_offset, 4096);
        assert_eq!(replies[1].puller_offset, 8192);
        for r in &replies {
            assert_eq!(r.dst_pull_handle, 0x0001_0003);
            assert_eq!(r.dst_magic, 0xFEED);
            let start = r.puller_offset as usize;
            assert_eq!(&r.payload[..], &pattern[start..start + r.payload.len()]);
        }
        // Reference held only during servicing.
        assert_eq!(regions.acquire(id).unwrap().refcount(), 1);
    }

    #[test]
    fn test_service_refuses_unknown_region_and_range() {
        let mem = Arc::new(HostMemory::new());
        let regions = RegionManager::new(mem.clone(), 8);
        let addr = mem.alloc(4096);
        let id = regions.register(&[Span::new(addr, 4096)]).unwrap();

        assert!(matches!(
            service_pull_request(&regions, &request(RegionId::new(7, 0), 0, 16), Route::default(), 4096),
            Err(MxError::InvalidRegion(_))
        ));
        assert!(matches!(
            service_pull_request(&regions, &request(id, 4000, 200), Route::default(), 4096),
            Err(MxError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_issue_pulls_is_all_or_nothing() {
        let mem = Arc::new(HostMemory::new());
        let regions = RegionManager::new(mem.clone(), 8);
        let addr = mem.alloc(65536);
        let id = regions.register(&[Span::new(addr, 65536)]).unwrap();
        let table = PullTable::new(1, 42);
        let plan = PullPlan {
            owner: RequestId(1),
            recv_region: id,
            sender_region: RegionId::new(0, 0),
            length: 65536,
            chunk: 32768,
            route: Route::default(),
            session: 5,
            deadline: Instant::now(),
        };
        assert!(matches!(
            issue_pulls(&table, &regions, &plan),
            Err(MxError::PullTableFull)
        ));
        assert!(table.is_empty());

        let table = PullTable::new(4, 42);
        let (handles, requests) = issue_pulls(&table, &regions, &plan).unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(requests[1].puller_offset, 32768);
        assert_eq!(requests[1].src_magic, 42);
        assert_eq!(regions.acquire(id).unwrap().refcount(), 3);
    }
}
