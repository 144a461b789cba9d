//! Batch Exporter - Flush Scheduling over a Single Gate
//!
//! [`BatchExporter`] wraps a [`BatchAccumulator`] and a transport behind one
//! `tokio::sync::Mutex`. Flushes happen on three triggers:
//!
//! - **threshold**: an `append` that would overflow the packet budget sends
//!   every open batch before buffering the new span;
//! - **idle timer**: armed by the first append after a flush, it fires once per
//!   `max_flush_interval` and only flushes if it can take the gate without
//!   waiting;
//! - **explicit**: [`flush`](BatchExporter::flush) and
//!   [`shutdown`](BatchExporter::shutdown).
//!
//! Sends run while the gate is held, so flushes never overlap and spans for a
//! service leave in append order. Transport failures are retried inside the
//! send according to the [`RetryPolicy`]; a batch that still fails is logged
//! and dropped. Flush never returns an error.

use crate::batch::{AccumulatorConfig, AppendOutcome, BatchAccumulator, WireBatch};
use crate::config::{ConfigError, ExporterConfig, Protocol};
use crate::error::ExportError;
use crate::metrics::ExporterMetrics;
use crate::retry::{send_with_retry, RetryPolicy};
use crate::span::SpanRecord;
use crate::transport::udp::MAX_DATAGRAM_SIZE;
use crate::transport::{GrpcTransport, HttpTransport, TransportBoxed, UdpTransport};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// State guarded by the gate
struct State {
    accumulator: BatchAccumulator,
    /// Armed idle timer, if any
    timer: Option<JoinHandle<()>>,
}

impl State {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    gate: Mutex<State>,
    transport: Arc<dyn TransportBoxed>,
    retry: RetryPolicy,
    timeout: Duration,
    flush_interval: Duration,
    closed: AtomicBool,
    metrics: Arc<ExporterMetrics>,
}

impl Inner {
    /// Drains the accumulator and sends everything. Caller holds the gate.
    async fn flush_locked(&self, state: &mut State, cancel: &CancellationToken) -> usize {
        state.disarm();
        let batches = state.accumulator.take_batches();
        send_batches(
            &*self.transport,
            self.retry,
            self.timeout,
            &self.metrics,
            batches,
            cancel,
        )
        .await
    }
}

/// Sends each batch through the retry loop; returns spans delivered.
async fn send_batches(
    transport: &dyn TransportBoxed,
    retry: RetryPolicy,
    timeout: Duration,
    metrics: &ExporterMetrics,
    batches: Vec<WireBatch>,
    cancel: &CancellationToken,
) -> usize {
    if batches.is_empty() {
        return 0;
    }
    metrics.record_flush();

    let batch_count = batches.len();
    let mut delivered = 0;
    for batch in batches {
        let deadline = Instant::now() + timeout;
        let bytes = batch.payload.len();
        match send_with_retry(transport, retry, Bytes::from(batch.payload), deadline, cancel).await {
            Ok(attempts) => {
                metrics.record_exported(batch.span_count as u64, attempts);
                delivered += batch.span_count;
                tracing::trace!(
                    service = %batch.service_name,
                    spans = batch.span_count,
                    bytes,
                    attempts,
                    "batch sent"
                );
            }
            Err(failure) => {
                metrics.record_dropped(batch.span_count as u64);
                tracing::warn!(
                    transport = transport.name(),
                    service = %batch.service_name,
                    spans = batch.span_count,
                    bytes,
                    error = %failure,
                    "dropping batch after failed export"
                );
            }
        }
    }
    tracing::debug!(batches = batch_count, delivered, "flush complete");
    delivered
}

fn spawn_idle_timer(inner: &Arc<Inner>) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let interval = inner.flush_interval;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Busy gate: whoever holds it is appending or flushing; look again later.
            let Ok(mut state) = inner.gate.try_lock() else {
                continue;
            };
            // Clear our own slot so flush_locked does not abort this task.
            state.timer = None;
            inner.flush_locked(&mut state, &CancellationToken::new()).await;
            return;
        }
    })
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let state = self.gate.get_mut();
        state.disarm();
        let batches = state.accumulator.take_batches();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            if !batches.is_empty() {
                tracing::warn!(
                    batches = batches.len(),
                    "exporter dropped outside a runtime, pending spans lost"
                );
            }
            return;
        };

        let transport = Arc::clone(&self.transport);
        let metrics = Arc::clone(&self.metrics);
        let retry = self.retry;
        let timeout = self.timeout;
        runtime.spawn(async move {
            send_batches(&*transport, retry, timeout, &metrics, batches, &CancellationToken::new()).await;
            transport.close_boxed().await;
        });
    }
}

/// Batching span exporter
///
/// Cheap to clone; all clones share one accumulator and transport. The last
/// clone to be dropped without an explicit [`shutdown`](Self::shutdown)
/// schedules a best-effort final flush on the current runtime.
#[derive(Clone)]
pub struct BatchExporter {
    inner: Arc<Inner>,
}

impl BatchExporter {
    /// Builds the transport named by `config.protocol`.
    ///
    /// Must be called inside a tokio runtime when the protocol is gRPC.
    pub fn from_config(config: &ExporterConfig) -> Result<Self, ExportError> {
        config.validate()?;
        let transport: Arc<dyn TransportBoxed> = match config.protocol {
            Protocol::Udp => Arc::new(UdpTransport::new(config.agent_address())),
            Protocol::Http => Arc::new(HttpTransport::new(config.collector_endpoint(), &config.headers)?),
            Protocol::Grpc => Arc::new(GrpcTransport::new(config.collector_endpoint(), &config.headers)?),
        };
        Self::with_transport(config, transport)
    }

    /// Uses a caller-supplied transport. Its envelope decides the framing.
    pub fn with_transport(config: &ExporterConfig, transport: Arc<dyn TransportBoxed>) -> Result<Self, ExportError> {
        config.validate()?;

        let mut accumulator_config = AccumulatorConfig::from(config);
        accumulator_config.envelope = transport.envelope();
        let overhead = accumulator_config.envelope.overhead();
        if accumulator_config.max_packet_size <= overhead {
            return Err(ConfigError::PacketTooSmall {
                max_packet_size: accumulator_config.max_packet_size,
                overhead,
            }
            .into());
        }
        if config.protocol == Protocol::Udp && accumulator_config.max_packet_size > MAX_DATAGRAM_SIZE {
            tracing::warn!(
                max_packet_size = accumulator_config.max_packet_size,
                limit = MAX_DATAGRAM_SIZE,
                "max packet size exceeds a UDP datagram, clamping"
            );
            accumulator_config.max_packet_size = MAX_DATAGRAM_SIZE;
        }

        tracing::debug!(
            transport = transport.name(),
            service = %config.service_name,
            max_packet_size = accumulator_config.max_packet_size,
            flush_interval_ms = config.max_flush_interval.as_millis() as u64,
            "batch exporter created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(State {
                    accumulator: BatchAccumulator::new(accumulator_config),
                    timer: None,
                }),
                transport,
                retry: RetryPolicy::new(config.max_retry_attempts),
                timeout: config.timeout,
                flush_interval: config.max_flush_interval,
                closed: AtomicBool::new(false),
                metrics: Arc::new(ExporterMetrics::default()),
            }),
        })
    }

    /// Buffers one finished span.
    ///
    /// May send batches first if the span would overflow the packet budget.
    /// Export failures are never reported here; only spans that can never be
    /// sent and appends after shutdown are errors.
    pub async fn append(&self, span: &SpanRecord) -> Result<(), ExportError> {
        if self.is_closed() {
            return Err(ExportError::Closed);
        }
        let mut state = self.inner.gate.lock().await;
        if self.is_closed() {
            return Err(ExportError::Closed);
        }

        match state.accumulator.append(span) {
            Ok(AppendOutcome::Buffered) => {}
            Ok(AppendOutcome::Overflowed(batches)) => {
                state.disarm();
                send_batches(
                    &*self.inner.transport,
                    self.inner.retry,
                    self.inner.timeout,
                    &self.inner.metrics,
                    batches,
                    &CancellationToken::new(),
                )
                .await;
            }
            Err(e) => {
                self.inner.metrics.record_rejected();
                tracing::warn!(
                    span_id = span.span_id,
                    operation = %span.operation_name,
                    error = %e,
                    "span rejected"
                );
                return Err(e);
            }
        }

        self.inner.metrics.record_append();
        if state.timer.is_none() {
            state.timer = Some(spawn_idle_timer(&self.inner));
        }
        Ok(())
    }

    /// Sends everything buffered; returns the number of spans delivered.
    pub async fn flush(&self) -> usize {
        self.flush_with_cancellation(&CancellationToken::new()).await
    }

    /// Like [`flush`](Self::flush); cancelling `cancel` abandons the in-flight
    /// send and drops the remaining batches.
    pub async fn flush_with_cancellation(&self, cancel: &CancellationToken) -> usize {
        let mut state = self.inner.gate.lock().await;
        self.inner.flush_locked(&mut state, cancel).await
    }

    /// Final flush, then releases buffers and closes the transport.
    ///
    /// Only the first call does anything; later calls return 0.
    pub async fn shutdown(&self) -> usize {
        self.shutdown_with_cancellation(&CancellationToken::new()).await
    }

    pub async fn shutdown_with_cancellation(&self, cancel: &CancellationToken) -> usize {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let mut state = self.inner.gate.lock().await;
        let delivered = self.inner.flush_locked(&mut state, cancel).await;
        state.accumulator.release();
        drop(state);

        self.inner.transport.close_boxed().await;
        tracing::info!(
            transport = self.inner.transport.name(),
            delivered,
            spans_exported = self.inner.metrics.spans_exported(),
            spans_dropped = self.inner.metrics.spans_dropped(),
            "batch exporter shut down"
        );
        delivered
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Spans buffered and not yet flushed
    pub async fn pending_spans(&self) -> usize {
        self.inner.gate.lock().await.accumulator.pending_spans()
    }

    pub fn metrics(&self) -> &ExporterMetrics {
        &self.inner.metrics
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }
}

impl std::fmt::Debug for BatchExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExporter")
            .field("transport", &self.inner.transport.name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
