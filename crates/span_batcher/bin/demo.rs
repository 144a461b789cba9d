//! # Span Batcher Demo
//!
//! Several producer tasks append spans for a handful of services while the
//! exporter batches them and ships them through a transport.
//!
//! By default the transport is simulated in-process (random latency and a
//! configurable rate of retryable failures), so the demo needs no agent or
//! collector. Pass `--live` to send to the endpoint described by the usual
//! `OTEL_*` variables instead.
//!
//! ## Running
//!
//! ```bash
//! cargo run -p span_batcher --bin demo --release -- --producers 4 --spans 500
//!
//! # real agent on localhost:6832
//! OTEL_SERVICE_NAME=demo cargo run -p span_batcher --bin demo -- --live
//!
//! # see batches and retries
//! RUST_LOG=span_batcher=debug cargo run -p span_batcher --bin demo
//! ```

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use rand::Rng;
use span_batcher::{
    BatchExporter, Envelope, ExporterConfig, LogEvent, RpcCode, SendOutcome, SpanRecord, Tag, Transport,
    TransportBoxed, TransportFailure, TransportStatus,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "demo", about = "Batch and export synthetic spans")]
struct Args {
    /// Concurrent producer tasks
    #[arg(long, default_value_t = 8)]
    producers: u64,

    /// Spans appended by each producer
    #[arg(long, default_value_t = 250)]
    spans: u64,

    /// Distinct peer services spans are attributed to
    #[arg(long, default_value_t = 3)]
    services: u64,

    /// Send through the configured transport instead of the simulated one
    #[arg(long)]
    live: bool,

    /// Fraction of simulated sends that fail with a retryable status
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,

    /// Override the flush interval (milliseconds)
    #[arg(long, env = "DEMO_FLUSH_INTERVAL_MS")]
    flush_interval_ms: Option<u64>,

    /// Override the maximum packet size
    #[arg(long)]
    max_packet_size: Option<usize>,
}

// =============================================================================
// SIMULATED COLLECTOR
// =============================================================================

/// A collector that is slow and occasionally unavailable.
struct SimulatedCollector {
    failure_rate: f64,
    attempts: AtomicU64,
    accepted_bytes: AtomicU64,
}

impl SimulatedCollector {
    fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate,
            attempts: AtomicU64::new(0),
            accepted_bytes: AtomicU64::new(0),
        }
    }
}

impl Transport for SimulatedCollector {
    async fn send(&self, payload: Bytes, deadline: Instant) -> SendOutcome {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let (latency, fail, throttle) = {
            let mut rng = rand::thread_rng();
            (
                Duration::from_millis(rng.gen_range(1..10)),
                rng.gen_bool(self.failure_rate.clamp(0.0, 1.0)),
                rng.gen_bool(0.25),
            )
        };

        if tokio::time::timeout_at(deadline, tokio::time::sleep(latency)).await.is_err() {
            return TransportFailure::new(TransportStatus::Timeout, "simulated timeout").into();
        }
        if fail {
            let failure = TransportFailure::new(TransportStatus::Rpc(RpcCode::Unavailable), "simulated outage");
            return if throttle {
                failure.with_retry_after(Duration::from_millis(50)).into()
            } else {
                failure.into()
            };
        }
        self.accepted_bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        SendOutcome::Success
    }

    fn envelope(&self) -> Envelope {
        Envelope::Batch
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

// =============================================================================
// SPAN GENERATION
// =============================================================================

const OPERATIONS: &[&str] = &["GET /users", "POST /orders", "SELECT orders", "cache.get", "publish events"];

fn make_span(producer: u64, seq: u64, services: u64) -> SpanRecord {
    let mut rng = rand::thread_rng();
    let trace_id: u128 = rng.gen();
    let start_us = 1_700_000_000_000_000 + (producer * 1_000_000 + seq) as i64;
    let operation = OPERATIONS[rng.gen_range(0..OPERATIONS.len())];

    let mut span = SpanRecord::new(trace_id, producer << 32 | seq, operation)
        .with_timing(start_us, rng.gen_range(50..50_000))
        .with_tag("producer", producer as i64);
    if services > 0 {
        span = span.with_tag("peer.service", format!("backend-{}", seq % services));
    }
    if rng.gen_bool(0.1) {
        span = span
            .with_tag("error", true)
            .with_log(LogEvent::new(start_us + 10, vec![Tag::new("event", "error"), Tag::new("message", "boom")]));
    }
    span
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = ExporterConfig::from_env().context("reading OTEL_* configuration")?;
    if config.service_name == "unknown_service" {
        config.service_name = "span-batcher-demo".to_string();
    }
    if let Some(ms) = args.flush_interval_ms {
        config.max_flush_interval = Duration::from_millis(ms);
    }
    if let Some(size) = args.max_packet_size {
        config.max_packet_size = size;
    }

    let simulated = Arc::new(SimulatedCollector::new(args.failure_rate));
    let exporter = if args.live {
        BatchExporter::from_config(&config).context("building exporter")?
    } else {
        BatchExporter::with_transport(&config, Arc::clone(&simulated) as Arc<dyn TransportBoxed>)
            .context("building exporter")?
    };
    tracing::info!(
        transport = exporter.transport_name(),
        producers = args.producers,
        spans_per_producer = args.spans,
        "starting demo"
    );

    let started = std::time::Instant::now();
    let mut tasks = Vec::new();
    for producer in 0..args.producers {
        let exporter = exporter.clone();
        let (spans, services) = (args.spans, args.services);
        tasks.push(tokio::spawn(async move {
            for seq in 0..spans {
                let span = make_span(producer, seq, services);
                if let Err(e) = exporter.append(&span).await {
                    tracing::warn!(producer, seq, error = %e, "append failed");
                }
                if seq % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for task in tasks {
        task.await.context("producer task panicked")?;
    }

    let last = exporter.shutdown().await;
    let elapsed = started.elapsed();
    let metrics = exporter.metrics().snapshot();

    println!();
    println!("Transport:        {}", exporter.transport_name());
    println!("Elapsed:          {:?}", elapsed);
    println!("Spans appended:   {}", metrics.spans_appended);
    println!("Spans exported:   {}", metrics.spans_exported);
    println!("Spans dropped:    {}", metrics.spans_dropped);
    println!("Spans rejected:   {}", metrics.spans_rejected);
    println!("Batches exported: {}", metrics.batches_exported);
    println!("Retries:          {}", metrics.retries);
    println!("Final flush:      {} spans", last);
    if !args.live {
        println!(
            "Simulated sends:  {} attempts, {} bytes accepted",
            simulated.attempts.load(Ordering::Relaxed),
            simulated.accepted_bytes.load(Ordering::Relaxed)
        );
    }
    println!(
        "Throughput:       {:.0} spans/s",
        metrics.spans_appended as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("\n{}", serde_json::to_string_pretty(&metrics)?);

    Ok(())
}
