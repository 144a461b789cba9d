//! Encoding and batching throughput.
//!
//! Run with: cargo bench -p span_batcher --bench encode

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use span_batcher::encoder::encode_record;
use span_batcher::{
    AccumulatorConfig, AppendOutcome, BatchAccumulator, BatchExporter, Envelope, ExporterConfig, GrowableBuffer,
    LogEvent, NullTransport, SpanRecord, Tag, TransportBoxed,
};
use std::sync::Arc;

const SPANS_PER_ITER: u64 = 10_000;

fn sample_span(id: u64) -> SpanRecord {
    SpanRecord::new(u128::from(id) << 64 | 0xfeed, id, "GET /api/v1/orders/{id}")
        .with_parent(id.wrapping_sub(1))
        .with_timing(1_700_000_000_000_000 + id as i64, 1250)
        .with_tag("http.method", "GET")
        .with_tag("http.status_code", 200i64)
        .with_tag("error", false)
        .with_log(LogEvent::new(1_700_000_000_000_100, vec![Tag::new("event", "cache miss")]))
}

// =============================================================================
// ENCODER
// =============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(SPANS_PER_ITER));

    let spans: Vec<_> = (0..SPANS_PER_ITER).map(sample_span).collect();
    group.bench_function("span_record", |b| {
        let mut buf = GrowableBuffer::with_capacity(1 << 20);
        b.iter(|| {
            buf.clear();
            for span in &spans {
                black_box(encode_record(&mut buf, span));
            }
        });
    });
    group.finish();
}

// =============================================================================
// ACCUMULATOR
// =============================================================================

fn bench_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate");
    group.throughput(Throughput::Elements(SPANS_PER_ITER));

    let spans: Vec<_> = (0..SPANS_PER_ITER)
        .map(|i| sample_span(i).with_tag("peer.service", format!("svc-{}", i % 8)))
        .collect();

    for max_packet_size in [8_000usize, 65_000] {
        group.bench_with_input(
            BenchmarkId::new("max_packet_size", max_packet_size),
            &max_packet_size,
            |b, &max_packet_size| {
                b.iter(|| {
                    let mut acc = BatchAccumulator::new(AccumulatorConfig {
                        max_packet_size,
                        envelope: Envelope::EmitBatch,
                        ..Default::default()
                    });
                    let mut batches = 0usize;
                    for span in &spans {
                        if let Ok(AppendOutcome::Overflowed(drained)) = acc.append(span) {
                            batches += drained.len();
                        }
                    }
                    batches += acc.take_batches().len();
                    black_box(batches)
                });
            },
        );
    }
    group.finish();
}

// =============================================================================
// EXPORTER (gate + null transport)
// =============================================================================

fn bench_exporter(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("exporter");
    group.throughput(Throughput::Elements(SPANS_PER_ITER));

    let spans: Vec<_> = (0..SPANS_PER_ITER).map(sample_span).collect();
    group.bench_function("append_flush", |b| {
        b.to_async(&runtime).iter(|| async {
            let transport: Arc<dyn TransportBoxed> = Arc::new(NullTransport::new(Envelope::EmitBatch));
            let exporter = BatchExporter::with_transport(&ExporterConfig::default(), transport).unwrap();
            for span in &spans {
                exporter.append(span).await.unwrap();
            }
            black_box(exporter.shutdown().await)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_accumulate, bench_exporter);
criterion_main!(benches);
