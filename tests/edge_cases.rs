//! Edge case tests
//!
//! Resource exhaustion, misaddressed traffic and degenerate lengths.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use bytes::{Bytes, BytesMut};
use common::{connect, only, pattern, pump, Node};
use mx_ether::core::match_info::MatchInfo;
use mx_ether::core::packet::{
    EagerMsg, Frame, MacAddr, MediumFrag, MsgHeader, NackReason, Packet, PullRequest, Route,
};
use mx_ether::error::MxError;
use mx_ether::memory::{HostMemory, RegionId, RegionManager, Span};
use mx_ether::protocol::pull::{PullTable, ReplyOutcome};
use mx_ether::protocol::rendezvous::service_pull_request;
use mx_ether::protocol::{CompletionStatus, RequestId};
use mx_ether::transport::loopback::LoopbackFabric;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TAG: MatchInfo = MatchInfo(17);

fn tiny(route: Route, session: u32, seq: u16) -> Packet {
    Packet::Tiny(EagerMsg {
        route,
        msg: MsgHeader {
            lib_seqnum: seq,
            lib_piggyack: 0,
            match_info: TAG,
            session,
        },
        payload: Bytes::from_static(b"hi"),
    })
}

#[test]
fn test_pin_failure_is_returned_and_leaks_nothing() {
    let fabric = LoopbackFabric::new();
    let mut a = Node::new(&fabric, 1);
    let mut b = Node::new(&fabric, 2);
    let (ep_a, mut cq_a) = a.open(0);
    let (ep_b, _cq_b) = b.open(0);
    connect(&fabric, &mut a, &ep_a, &mut cq_a, &mut b, &ep_b);

    let src = a.buffer(&pattern(64 * 1024, 0));
    a.mem.set_pin_limit(4);
    let err = ep_a.isend(ep_b.addr(), &[src], TAG).unwrap_err();
    assert!(matches!(err, MxError::PinFailed(_)));
    assert_eq!(a.mem.pinned_pages(), 0);
    assert_eq!(ep_a.regions().live_regions(), 0);
    assert!(cq_a.try_next().is_none());
}

#[test]
fn test_unmapped_buffer_is_refused() {
    let fabric = LoopbackFabric::new();
    let b = Node::new(&fabric, 2);
    let (ep_b, _cq_b) = b.open(0);
    let bogus = mx_ether::memory::Span::new(0x10, 4096);
    assert!(matches!(ep_b.irecv(&[bogus], TAG, u64::MAX), Err(MxError::PinFailed(_))));
}

#[test]
fn test_region_table_full() {
    let fabric = LoopbackFabric::new();
    let mut a = Node::with_config(&fabric, 1, |c| c.nic.max_regions = 1);
    let mut b = Node::new(&fabric, 2);
    let (ep_a, mut cq_a) = a.open(0);
    let (ep_b, _cq_b) = b.open(0);
    connect(&fabric, &mut a, &ep_a, &mut cq_a, &mut b, &ep_b);

    // The rendezvous send keeps its region until notified.
    ep_a.isend(ep_b.addr(), &[a.buffer(&pattern(40_000, 0))], TAG).unwrap();
    let err = ep_a.isend(ep_b.addr(), &[a.buffer(&[1; 8])], TAG).unwrap_err();
    assert!(matches!(err, MxError::RegionTableFull));
}

#[test]
fn test_pull_table_exhaustion_abandons_receive() {
    let fabric = LoopbackFabric::new();
    let mut a = Node::new(&fabric, 1);
    let mut b = Node::with_config(&fabric, 2, |c| c.engine.max_pull_contexts = 2);
    let (ep_a, mut cq_a) = a.open(0);
    let (ep_b, mut cq_b) = b.open(0);
    connect(&fabric, &mut a, &ep_a, &mut cq_a, &mut b, &ep_b);

    // Four chunks needed, two slots available: nothing is issued.
    ep_b.irecv(&[b.zeroed(100_000)], TAG, u64::MAX).unwrap();
    ep_a.isend(ep_b.addr(), &[a.buffer(&pattern(100_000, 0))], TAG).unwrap();
    pump(&fabric, &mut [&mut a, &mut b]);

    assert_eq!(only(&mut cq_b).status, CompletionStatus::Abandoned);
    assert_eq!(ep_b.outstanding_pulls(), 0);
    assert_eq!(b.metrics.snapshot().pulls_issued, 0);
    assert_eq!(ep_b.regions().live_regions(), 0);
}

#[test]
fn test_zero_length_receive_of_large_message() {
    let fabric = LoopbackFabric::new();
    let mut a = Node::new(&fabric, 1);
    let mut b = Node::new(&fabric, 2);
    let (ep_a, mut cq_a) = a.open(0);
    let (ep_b, mut cq_b) = b.open(0);
    connect(&fabric, &mut a, &ep_a, &mut cq_a, &mut b, &ep_b);

    ep_b.irecv(&[], TAG, u64::MAX).unwrap();
    ep_a.isend(ep_b.addr(), &[a.buffer(&pattern(50_000, 0))], TAG).unwrap();
    pump(&fabric, &mut [&mut a, &mut b]);

    let r = only(&mut cq_b);
    assert_eq!(r.status, CompletionStatus::Truncated { msg_length: 50_000 });
    assert_eq!(r.length, 0);
    let s = only(&mut cq_a);
    assert_eq!(s.length, 0);
    assert_eq!(ep_a.regions().live_regions(), 0);
    assert_eq!(b.metrics.snapshot().pulls_issued, 0);
}

#[test]
fn test_empty_message() {
    let fabric = LoopbackFabric::new();
    let mut a = Node::new(&fabric, 1);
    let mut b = Node::new(&fabric, 2);
    let (ep_a, mut cq_a) = a.open(0);
    let (ep_b, mut cq_b) = b.open(0);
    connect(&fabric, &mut a, &ep_a, &mut cq_a, &mut b, &ep_b);

    ep_b.irecv(&[b.zeroed(32)], TAG, u64::MAX).unwrap();
    ep_a.isend(ep_b.addr(), &[], TAG).unwrap();
    pump(&fabric, &mut [&mut a, &mut b]);
    let r = only(&mut cq_b);
    assert_eq!(r.status, CompletionStatus::Success);
    assert_eq!(r.length, 0);
}

#[test]
fn test_wrong_session_is_nacked() {
    let fabric = LoopbackFabric::new();
    let mut a = Node::new(&fabric, 1);
    let b = Node::new(&fabric, 2);
    let (ep_b, mut cq_b) = b.open(0);
    ep_b.irecv(&[b.zeroed(8)], TAG, u64::MAX).unwrap();

    let route = Route {
        dst_endpoint: ep_b.index(),
        src_endpoint: 0,
        src_generation: 1,
    };
    let bad = ep_b.session().wrapping_add(1);
    b.nic
        .handle_decoded(Frame::new(b.mac(), a.mac(), tiny(route, bad, 0)));

    assert!(cq_b.try_next().is_none());
    assert_eq!(b.metrics.snapshot().misrouted_dropped, 1);
    let nack = Frame::from_bytes(a.rx.try_recv().unwrap()).unwrap();
    match nack.packet {
        Packet::NackLib(n) => {
            assert_eq!(n.reason, NackReason::BadSession);
            assert_eq!(n.session, bad);
        }
        other => panic!("expected a nack, got {other:?}"),
    }
}

#[test]
fn test_stale_generation_is_dropped() {
    let fabric = LoopbackFabric::new();
    let a = Node::new(&fabric, 1);
    let b = Node::new(&fabric, 2);
    let (ep_b, mut cq_b) = b.open(0);
    ep_b.irecv(&[b.zeroed(8)], TAG, u64::MAX).unwrap();
    ep_b.irecv(&[b.zeroed(8)], TAG, u64::MAX).unwrap();

    let route = |generation| Route {
        dst_endpoint: ep_b.index(),
        src_endpoint: 4,
        src_generation: generation,
    };
    let session = ep_b.session();
    b.nic
        .handle_decoded(Frame::new(b.mac(), a.mac(), tiny(route(5), session, 0)));
    b.nic
        .handle_decoded(Frame::new(b.mac(), a.mac(), tiny(route(4), session, 1)));
    assert_eq!(cq_b.drain().len(), 1);
    assert_eq!(b.metrics.snapshot().misrouted_dropped, 1);

    // The same sequence number again is a duplicate.
    b.nic
        .handle_decoded(Frame::new(b.mac(), a.mac(), tiny(route(5), session, 0)));
    assert!(cq_b.try_next().is_none());
}

#[test]
fn test_frame_for_other_interface() {
    let fabric = LoopbackFabric::new();
    let b = Node::new(&fabric, 2);
    let (ep_b, mut cq_b) = b.open(0);
    ep_b.irecv(&[b.zeroed(8)], TAG, u64::MAX).unwrap();
    let route = Route {
        dst_endpoint: 0,
        src_endpoint: 0,
        src_generation: 1,
    };
    let elsewhere = MacAddr([2, 0, 0, 0, 0, 0x33]);
    b.nic.handle_decoded(Frame::new(
        elsewhere,
        MacAddr([2, 0, 0, 0, 0, 1]),
        tiny(route, ep_b.session(), 0),
    ));
    assert!(cq_b.try_next().is_none());
    assert_eq!(b.metrics.snapshot().misrouted_dropped, 1);
}

#[test]
fn test_never_opened_endpoint_nacks_bad_endpoint() {
    let fabric = LoopbackFabric::new();
    let mut a = Node::new(&fabric, 1);
    let b = Node::new(&fabric, 2);
    let route = Route {
        dst_endpoint: 9,
        src_endpoint: 0,
        src_generation: 1,
    };
    b.nic
        .handle_decoded(Frame::new(b.mac(), a.mac(), tiny(route, 1, 0)));
    match Frame::from_bytes(a.rx.try_recv().unwrap()).unwrap().packet {
        Packet::NackLib(n) => {
            assert_eq!(n.reason, NackReason::BadEndpoint);
            assert_eq!(n.route.dst_endpoint, 0);
            assert_eq!(n.route.src_endpoint, 9);
        }
        other => panic!("expected a nack, got {other:?}"),
    }
}

#[test]
fn test_endpoint_slots_exhausted() {
    let fabric = LoopbackFabric::new();
    let a = Node::with_config(&fabric, 1, |c| c.nic.max_endpoints = 2);
    let _one = a.nic.open_endpoint(None).unwrap();
    let _two = a.nic.open_endpoint(None).unwrap();
    assert!(matches!(a.nic.open_endpoint(None), Err(MxError::EndpointTableFull)));
}

/// Register seven throwaway regions so the next one lands in slot 7.
fn region_seven(mem: &Arc<HostMemory>, manager: &RegionManager, data: &[u8]) -> RegionId {
    for _ in 0..7 {
        manager.register(&[Span::new(mem.alloc(16), 16)]).unwrap();
    }
    let addr = mem.alloc(data.len());
    mem.write(addr, data).unwrap();
    let id = manager.register(&[Span::new(addr, data.len() as u64)]).unwrap();
    assert_eq!(id.index, 7);
    id
}

#[test]
fn test_reversed_replies_into_region_seven() {
    let src_mem = Arc::new(HostMemory::new());
    let dst_mem = Arc::new(HostMemory::new());
    let sender = RegionManager::new(src_mem.clone(), 16);
    let receiver = RegionManager::new(dst_mem.clone(), 16);
    let source = pattern(16_384, 42);
    let src_id = region_seven(&src_mem, &sender, &source);
    let dst_id = region_seven(&dst_mem, &receiver, &[0; 16_384]);

    let table = PullTable::new(4, 0xC0FFEE);
    let owner = RequestId(3);
    let handle = table
        .insert(
            owner,
            receiver.acquire(dst_id).unwrap(),
            4096..12_288,
            Instant::now() + Duration::from_secs(5),
        )
        .unwrap();

    let request = PullRequest {
        route: Route::default(),
        session: 1,
        length: 8192,
        puller_region: dst_id,
        pulled_region: src_id,
        puller_offset: 4096,
        pulled_offset: 4096,
        src_pull_handle: handle.0,
        src_magic: table.magic(),
    };
    let replies = service_pull_request(&sender, &request, Route::default(), 4096).unwrap();
    let offsets: Vec<u32> = replies.iter().map(|r| r.puller_offset).collect();
    assert_eq!(offsets, vec![4096, 8192]);

    // Through the codec, second reply first.
    let mut completions = 0;
    for reply in replies.into_iter().rev() {
        let wire = Frame::new(
            MacAddr([2, 0, 0, 0, 0, 2]),
            MacAddr([2, 0, 0, 0, 0, 1]),
            Packet::PullReply(reply),
        )
        .to_bytes();
        let Packet::PullReply(reply) = Frame::from_bytes(wire).unwrap().packet else {
            panic!("decoded as something else");
        };
        let outcome = table
            .apply_reply(
                reply.dst_pull_handle,
                reply.dst_magic,
                reply.puller_region,
                reply.puller_offset as u64,
                &reply.payload,
            )
            .unwrap();
        if let ReplyOutcome::Completed { owner: done, .. } = outcome {
            assert_eq!(done, owner);
            completions += 1;
        }
    }
    assert_eq!(completions, 1);

    let mut got = BytesMut::new();
    receiver.acquire(dst_id).unwrap().extract(4096, 8192, &mut got).unwrap();
    assert_eq!(&got[..], &source[4096..12_288]);
    let mut untouched = BytesMut::new();
    receiver.acquire(dst_id).unwrap().extract(0, 4096, &mut untouched).unwrap();
    assert!(untouched.iter().all(|b| *b == 0));
}

#[test]
fn test_medium_length_outside_bounds_is_malformed() {
    let fabric = LoopbackFabric::new();
    let a = Node::new(&fabric, 1);
    let b = Node::with_config(&fabric, 2, |c| c.engine.medium_max = 32_768);
    let (ep_b, mut cq_b) = b.open(0);
    ep_b.irecv(&[b.zeroed(64 * 1024)], TAG, 0).unwrap();

    let route = Route {
        dst_endpoint: ep_b.index(),
        src_endpoint: 0,
        src_generation: 1,
    };
    let frag = |seq: u16, msg_length: u32, payload: usize| {
        Packet::MediumFrag(MediumFrag {
            route,
            msg: MsgHeader {
                lib_seqnum: seq,
                lib_piggyack: 0,
                match_info: TAG,
                session: ep_b.session(),
            },
            msg_length,
            frag_offset: 0,
            payload: Bytes::from(vec![9u8; payload]),
        })
    };

    // Just over the medium limit, a 4 GiB claim, and an empty medium.
    for (seq, length) in [(0u16, 32_769u32), (1, u32::MAX), (2, 0)] {
        b.nic
            .handle_decoded(Frame::new(b.mac(), a.mac(), frag(seq, length, 4096.min(length as usize))));
    }
    assert!(cq_b.try_next().is_none());
    assert_eq!(b.metrics.snapshot().malformed_dropped, 3);

    // A medium within bounds still lands.
    b.nic
        .handle_decoded(Frame::new(b.mac(), a.mac(), frag(3, 4096, 4096)));
    let done = only(&mut cq_b);
    assert_eq!(done.status, CompletionStatus::Success);
    assert_eq!(done.length, 4096);
    assert_eq!(b.metrics.snapshot().malformed_dropped, 3);
}
