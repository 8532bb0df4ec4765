//! Per-request routing and per-read reassembly costs
//!
//! Ring lookups run once per keyed request; `FrameReader::feed` runs once per
//! socket read.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use muxwire_codec::BinaryProtocol;
use muxwire_network::pool::VIRTUAL_NODES;
use muxwire_network::{FrameReader, HashRing};
use std::sync::Arc;

fn bench_ring_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_lookup");
    let keys: Vec<String> = (0..1024).map(|i| format!("user:{}", i)).collect();

    for nodes in [3usize, 16, 64] {
        let names: Vec<String> = (0..nodes).map(|i| format!("node-{}", i)).collect();
        let ring = HashRing::build(names.iter().map(|n| (n.as_str(), n.clone())), VIRTUAL_NODES);

        group.bench_with_input(BenchmarkId::from_parameter(nodes), &ring, |b, ring| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(ring.get(&keys[i]))
            })
        });
    }
    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let protocol = Arc::new(BinaryProtocol::default());
    let mut stream = Vec::new();
    for seq in 0..256u32 {
        stream.extend_from_slice(&protocol.encode(seq, "get", &[7u8; 48]).unwrap());
    }

    let mut group = c.benchmark_group("reassembly");
    for chunk in [64usize, 1024, 8192] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut reader = FrameReader::new(protocol.clone(), 4096);
                let mut count = 0usize;
                for piece in stream.chunks(chunk) {
                    reader.feed(piece, |_| count += 1).unwrap();
                }
                black_box(count)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ring_lookup, bench_reassembly);
criterion_main!(benches);
