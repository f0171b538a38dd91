//! Property-based tests using proptest
//!
//! Invariants of the tag codec, the pull partitioning, reply correlation and
//! the frame decoder, checked over randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use mx_ether::core::match_info::MatchInfo;
use mx_ether::core::packet::{EagerMsg, Frame, MacAddr, MsgHeader, Packet, Route};
use mx_ether::memory::{HostMemory, RegionManager, Span};
use mx_ether::protocol::eager::{fragment, MediumReassembly};
use mx_ether::protocol::pull::{split_pull_ranges, PullTable, ReplyOutcome};
use mx_ether::protocol::RequestId;
use mx_ether::utils::IntervalSet;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Property: splitting a tag into words and joining them back is lossless
proptest! {
    #[test]
    fn prop_match_info_split_join(tag in any::<u64>()) {
        let (a, b) = MatchInfo(tag).split();
        prop_assert_eq!(MatchInfo::join(a, b), MatchInfo(tag));
        prop_assert_eq!(a as u64, tag >> 32);
    }
}

// Property: a zero mask matches anything, a full mask only equal tags
proptest! {
    #[test]
    fn prop_match_mask(x in any::<u64>(), y in any::<u64>()) {
        prop_assert!(MatchInfo(x).matches(MatchInfo(y), 0));
        prop_assert_eq!(MatchInfo(x).matches(MatchInfo(y), u64::MAX), x == y);
    }
}

// Property: pull ranges partition the transfer exactly, in order, none larger
// than the chunk
proptest! {
    #[test]
    fn prop_pull_ranges_partition(
        offset in 0u64..1 << 40,
        length in 0u64..1 << 24,
        chunk in 1u64..1 << 20,
    ) {
        let ranges = split_pull_ranges(offset, length, chunk).unwrap();
        prop_assert_eq!(ranges.len() as u64, length.div_ceil(chunk));
        let mut cursor = offset;
        for r in &ranges {
            prop_assert_eq!(r.start, cursor);
            prop_assert!(r.end > r.start);
            prop_assert!(r.end - r.start <= chunk);
            cursor = r.end;
        }
        prop_assert_eq!(cursor, offset + length);
    }
}

// Property: the decoder never panics on arbitrary input
proptest! {
    #[test]
    fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = Frame::from_bytes(Bytes::from(data));
    }
}

// Property: a body with the MX ethertype but garbage contents never panics
proptest! {
    #[test]
    fn prop_decode_garbage_body(ptype in any::<u8>(), body in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut frame = vec![2, 0, 0, 0, 0, 1, 2, 0, 0, 0, 0, 2, 0x86, 0xDF, ptype];
        frame.extend_from_slice(&body);
        let _ = Frame::from_bytes(Bytes::from(frame));
    }
}

// Property: eager packets survive encoding whatever the payload
proptest! {
    #[test]
    fn prop_eager_frame_preserves_payload(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        tag in any::<u64>(),
        seq in any::<u16>(),
    ) {
        let msg = MsgHeader { lib_seqnum: seq, lib_piggyack: 0, match_info: MatchInfo(tag), session: 9 };
        let packet = Packet::Small(EagerMsg {
            route: Route::default(),
            msg,
            payload: Bytes::from(payload.clone()),
        });
        let frame = Frame::new(MacAddr([2, 0, 0, 0, 0, 2]), MacAddr([2, 0, 0, 0, 0, 1]), packet);
        let decoded = Frame::from_bytes(frame.to_bytes()).unwrap();
        match decoded.packet {
            Packet::Small(m) => {
                prop_assert_eq!(&m.payload[..], &payload[..]);
                prop_assert_eq!(m.msg, msg);
            }
            other => prop_assert!(false, "decoded as {:?}", other),
        }
    }
}

// Property: interval bookkeeping never double-counts a byte
proptest! {
    #[test]
    fn prop_interval_set_counts_each_byte_once(
        pieces in prop::collection::vec((0u64..1000, 1u64..64), 0..64),
    ) {
        let mut set = IntervalSet::new();
        let mut bytes = vec![false; 1100];
        for (start, len) in pieces {
            let range = start..start + len;
            let fresh = bytes[start as usize..(start + len) as usize].iter().all(|b| !b);
            prop_assert_eq!(set.insert(range.clone()), fresh);
            if fresh {
                for b in &mut bytes[range.start as usize..range.end as usize] {
                    *b = true;
                }
            }
        }
        prop_assert_eq!(set.covered(), bytes.iter().filter(|b| **b).count() as u64);
    }
}

// Property: medium fragments reassemble in any order
proptest! {
    #[test]
    fn prop_medium_reassembly_any_order(
        len in 1usize..20_000,
        frag in 256usize..4096,
        order in any::<u64>(),
    ) {
        let payload = Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>());
        let msg = MsgHeader { lib_seqnum: 1, lib_piggyack: 0, match_info: MatchInfo(5), session: 1 };
        let mut frags = fragment(Route::default(), msg, payload.clone(), frag);
        let n = frags.len();
        frags.rotate_left((order as usize) % n);
        if order & 1 == 1 {
            frags.reverse();
        }

        let mut r = MediumReassembly::new(&frags[0], Instant::now() + Duration::from_secs(1));
        let mut done = false;
        for f in &frags {
            done = r.accept(f).unwrap();
        }
        prop_assert!(done);
        prop_assert_eq!(r.into_payload(), payload);
    }
}

// Property: replies for one context, applied in any order with duplicates
// mixed in, complete it exactly once and fill the region correctly
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]
    #[test]
    fn prop_pull_replies_any_order(
        pieces in 1usize..12,
        piece_len in 1u64..2048,
        swaps in prop::collection::vec((any::<usize>(), any::<usize>()), 0..16),
        dup in any::<usize>(),
    ) {
        let mem = Arc::new(HostMemory::new());
        let regions = RegionManager::new(mem.clone(), 4);
        let total = pieces as u64 * piece_len;
        let addr = mem.alloc(total as usize);
        let id = regions.register(&[Span::new(addr, total)]).unwrap();
        let table = PullTable::new(8, 77);
        let handle = table
            .insert(RequestId(1), regions.acquire(id).unwrap(), 0..total, Instant::now() + Duration::from_secs(5))
            .unwrap();

        let mut order: Vec<usize> = (0..pieces).collect();
        for (i, j) in swaps {
            order.swap(i % pieces, j % pieces);
        }
        // Re-send one piece right after its first delivery.
        let dup_at = dup % pieces;
        order.insert(dup_at + 1, order[dup_at]);

        let mut completions = 0;
        for k in order {
            let start = k as u64 * piece_len;
            let data: Vec<u8> = (0..piece_len).map(|i| (start + i) as u8).collect();
            if let Ok(ReplyOutcome::Completed { owner, .. }) =
                table.apply_reply(handle.0, 77, id, start, &data)
            {
                prop_assert_eq!(owner, RequestId(1));
                completions += 1;
            }
        }
        prop_assert_eq!(completions, 1);
        prop_assert_eq!(table.len(), 0);

        let mut out = BytesMut::new();
        regions.acquire(id).unwrap().extract(0, total, &mut out).unwrap();
        prop_assert!(out.iter().enumerate().all(|(i, b)| *b == i as u8));
    }
}
