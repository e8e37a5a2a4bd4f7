//! Benchmark the feature-extraction/classification hot path, the two
//! stages every packet pays for regardless of threat level.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ips_core::classifier::ThreatClassifier;
use ips_core::{Endpoint, OperatingMode, PacketRecord, Protocol};
use std::net::IpAddr;

fn sample_packet() -> PacketRecord {
    PacketRecord {
        source: Endpoint::new(IpAddr::from([10, 0, 0, 5]), Some(51342)),
        destination: Endpoint::new(IpAddr::from([10, 0, 0, 6]), Some(443)),
        protocol: Protocol::Tcp,
        length: 1400,
        ttl: 64,
        flags: 2,
        info: String::new(),
        timestamp: 12345.0,
    }
}

fn bench_feature_extraction(c: &mut Criterion) {
    let packet = sample_packet();
    c.bench_function("extract_features_lightweight", |b| {
        b.iter(|| ips_core::features::extract(black_box(&packet), OperatingMode::Lightweight))
    });
    c.bench_function("extract_features_performance", |b| {
        b.iter(|| ips_core::features::extract(black_box(&packet), OperatingMode::Performance))
    });
}

fn bench_classification(c: &mut Criterion) {
    let packet = sample_packet();
    let classifier = ThreatClassifier::new();
    let fv = ips_core::features::extract(&packet, OperatingMode::Lightweight);
    c.bench_function("classify_heuristic_fallback", |b| {
        b.iter(|| classifier.classify(black_box(&packet), black_box(&fv)))
    });
}

criterion_group!(benches, bench_feature_extraction, bench_classification);
criterion_main!(benches);
