use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use mx_ether::memory::{HostMemory, RegionManager, Span};
use mx_ether::protocol::pull::PullTable;
use mx_ether::protocol::RequestId;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[allow(clippy::unwrap_used)]
fn bench_region_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_register");
    let mem = Arc::new(HostMemory::new());
    let regions = RegionManager::new(mem.clone(), 64);

    for &size in &[4096usize, 64 * 1024, 1024 * 1024] {
        let addr = mem.alloc(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("register_deregister_{size}b"), |b| {
            b.iter(|| {
                let id = regions.register(&[Span::new(addr, size as u64)]).unwrap();
                regions.deregister(id).unwrap();
            })
        });
    }
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_region_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_copy");
    let mem = Arc::new(HostMemory::new());
    let regions = RegionManager::new(mem.clone(), 64);
    let size = 256 * 1024usize;
    // Two disjoint spans so copies cross a segment boundary.
    let first = mem.alloc(size / 2);
    let second = mem.alloc(size / 2);
    let id = regions
        .register(&[
            Span::new(first, size as u64 / 2),
            Span::new(second, size as u64 / 2),
        ])
        .unwrap();
    let region = regions.acquire(id).unwrap();

    for &chunk in &[1024usize, 8192, 32 * 1024] {
        let data = vec![0x3cu8; chunk];
        let offset = (size / 2 - chunk / 2) as u64;
        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_function(format!("fill_{chunk}b"), |b| {
            b.iter(|| region.fill(offset, &data).unwrap())
        });
        group.bench_function(format!("extract_{chunk}b"), |b| {
            let mut out = BytesMut::with_capacity(chunk);
            b.iter(|| {
                out.clear();
                region.extract(offset, chunk as u64, &mut out).unwrap();
            })
        });
    }
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_pull_replies(c: &mut Criterion) {
    let mut group = c.benchmark_group("pull_replies");
    let mem = Arc::new(HostMemory::new());
    let regions = RegionManager::new(mem.clone(), 8);
    let chunk = 32 * 1024u64;
    let reply = 8 * 1024usize;
    let addr = mem.alloc(chunk as usize);
    let id = regions.register(&[Span::new(addr, chunk)]).unwrap();
    let table = PullTable::new(64, 99);
    let payload = vec![0xeeu8; reply];

    group.throughput(Throughput::Bytes(chunk));
    group.bench_function("complete_one_context", |b| {
        b.iter_batched(
            || {
                table
                    .insert(
                        RequestId(1),
                        regions.acquire(id).unwrap(),
                        0..chunk,
                        Instant::now() + Duration::from_secs(60),
                    )
                    .unwrap()
            },
            |handle| {
                for piece in (0..chunk).step_by(reply).rev() {
                    table.apply_reply(handle.0, 99, id, piece, &payload).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_region_register, bench_region_copy, bench_pull_replies);
criterion_main!(benches);
