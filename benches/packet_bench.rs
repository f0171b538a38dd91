use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use mx_ether::core::codec::FrameCodec;
use mx_ether::core::match_info::MatchInfo;
use mx_ether::core::packet::{
    EagerMsg, Frame, MacAddr, MsgHeader, Packet, PullReply, RegionId, Route,
};
use tokio_util::codec::{Decoder, Encoder};

const DST: MacAddr = MacAddr([2, 0, 0, 0, 0, 2]);
const SRC: MacAddr = MacAddr([2, 0, 0, 0, 0, 1]);

fn eager(size: usize) -> Frame {
    Frame::new(
        DST,
        SRC,
        Packet::Small(EagerMsg {
            route: Route::default(),
            msg: MsgHeader {
                lib_seqnum: 1,
                lib_piggyack: 0,
                match_info: MatchInfo(0xdead_beef),
                session: 7,
            },
            payload: Bytes::from(vec![0xa5u8; size]),
        }),
    )
}

fn pull_reply(size: usize) -> Frame {
    Frame::new(
        DST,
        SRC,
        Packet::PullReply(PullReply {
            route: Route::default(),
            puller_region: RegionId::new(3, 1),
            puller_offset: 4096,
            dst_pull_handle: 0x0001_0002,
            dst_magic: 77,
            payload: Bytes::from(vec![0x5au8; size]),
        }),
    )
}

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let payload_sizes = [16usize, 128, 1024, 4096, 8192];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_eager_{size}b"), |b| {
            b.iter_batched(
                || eager(size),
                |frame| {
                    let mut buf = BytesMut::with_capacity(frame.encoded_len());
                    let mut codec = FrameCodec;
                    codec.encode(frame, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("decode_eager_{size}b"), |b| {
            let bytes = eager(size).to_bytes();
            b.iter(|| {
                let decoded = Frame::from_bytes(bytes.clone());
                assert!(decoded.is_ok());
            })
        });
        group.bench_function(format!("codec_pull_reply_{size}b"), |b| {
            let bytes = pull_reply(size).to_bytes();
            b.iter_batched(
                || BytesMut::from(&bytes[..]),
                |mut buf| {
                    let mut codec = FrameCodec;
                    let frame = codec.decode(&mut buf).unwrap();
                    assert!(frame.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode);
criterion_main!(benches);
