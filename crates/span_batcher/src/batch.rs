//! Batch Accumulator - Pure Batching Abstraction
//!
//! Groups encoded spans by effective service name and enforces the maximum
//! wire-message size. Like the rest of the synchronous core it has no locks,
//! no timers and no transport: it tells the caller when batches had to be cut
//! and hands them back as framed [`WireBatch`] payloads. Concurrency and
//! sending live in [`BatchExporter`](crate::BatchExporter).
//!
//! # Size accounting
//!
//! A single running byte count covers *all* open batches. Opening a batch for a
//! service costs its process descriptor plus the envelope framing; every span
//! costs its encoded size. When a new span would bring the running count to
//! `max_packet_size` or beyond, every open batch is drained first and the span
//! starts a fresh batch. Because each framed batch is a subset of the running
//! count, no payload ever exceeds `max_packet_size`.

use crate::buffer::{BufferHandle, GrowableBuffer};
use crate::encoder::{encode_record, write_wire_batch, Envelope};
use crate::error::ExportError;
use crate::process::{EncodedProcess, ProcessCache};
use crate::span::{SpanRecord, Tag};
use crate::thrift::ProtocolWriter;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Configuration for batch accumulation
#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    /// Service name for spans without a `peer.service` override
    pub service_name: String,
    /// Process tags (empty = defaults)
    pub process_tags: Vec<Tag>,
    /// Upper bound on one framed batch
    pub max_packet_size: usize,
    /// Framing the transport expects
    pub envelope: Envelope,
    /// Cap on distinct service names
    pub max_processes: usize,
    /// Initial span arena capacity
    pub initial_buffer_capacity: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown_service".to_string(),
            process_tags: Vec::new(),
            max_packet_size: crate::config::DEFAULT_MAX_PACKET_SIZE,
            envelope: Envelope::EmitBatch,
            max_processes: crate::config::DEFAULT_MAX_PROCESSES,
            initial_buffer_capacity: crate::buffer::DEFAULT_INITIAL_CAPACITY,
        }
    }
}

impl From<&crate::config::ExporterConfig> for AccumulatorConfig {
    fn from(config: &crate::config::ExporterConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            process_tags: config.process_tag_list(),
            max_packet_size: config.max_packet_size,
            envelope: config.protocol.envelope(),
            max_processes: config.max_processes,
            initial_buffer_capacity: config.initial_buffer_capacity,
        }
    }
}

/// One framed, ready-to-send batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBatch {
    pub service_name: String,
    pub span_count: usize,
    pub payload: Vec<u8>,
}

/// Result of [`BatchAccumulator::append`]
#[derive(Debug)]
pub enum AppendOutcome {
    /// The span joined an open batch; nothing needs sending.
    Buffered,
    /// Every previously open batch was drained to make room; these must be
    /// sent. The new span is already buffered in a fresh batch.
    Overflowed(Vec<WireBatch>),
}

/// Spans for one service since the last flush
#[derive(Debug)]
struct Batch {
    process: Arc<EncodedProcess>,
    spans: Vec<BufferHandle>,
}

/// Per-service batching with a global packet-size budget
#[derive(Debug)]
pub struct BatchAccumulator {
    config: AccumulatorConfig,
    processes: ProcessCache,
    /// Encoded spans of all open batches
    arena: GrowableBuffer,
    /// Holds the span being appended until the flush decision is made
    scratch: GrowableBuffer,
    batches: BTreeMap<String, Batch>,
    batch_byte_size: usize,
    pending_spans: usize,
    warned_process_cap: bool,
}

impl BatchAccumulator {
    /// Creates an accumulator; the default service's descriptor is encoded eagerly.
    pub fn new(config: AccumulatorConfig) -> Self {
        let mut processes = ProcessCache::new(config.process_tags.clone());
        processes.get_or_create(&config.service_name);
        Self {
            arena: GrowableBuffer::with_capacity(config.initial_buffer_capacity),
            scratch: GrowableBuffer::with_capacity(1024),
            processes,
            batches: BTreeMap::new(),
            batch_byte_size: 0,
            pending_spans: 0,
            warned_process_cap: false,
            config,
        }
    }

    /// Encodes `span` into the batch of its effective service.
    ///
    /// Fails only when the span plus its process descriptor and framing can
    /// never fit into one packet.
    pub fn append(&mut self, span: &SpanRecord) -> Result<AppendOutcome, ExportError> {
        let process = self.resolve_process(span);
        let overhead = self.config.envelope.overhead();

        self.scratch.clear();
        let encoded = encode_record(&mut self.scratch, span);

        let standalone = encoded.len + process.len() + overhead;
        if standalone > self.config.max_packet_size {
            return Err(ExportError::RecordTooLarge {
                size: standalone,
                max_packet_size: self.config.max_packet_size,
            });
        }

        let service = process.service_name();
        let has_open_batch = self
            .batches
            .get(service)
            .is_some_and(|b| !b.spans.is_empty());
        let needed = if has_open_batch {
            encoded.len
        } else {
            standalone
        };

        let mut outcome = AppendOutcome::Buffered;
        let mut opening = !has_open_batch;
        if self.batch_byte_size + needed >= self.config.max_packet_size {
            let drained = self.take_batches();
            if !drained.is_empty() {
                outcome = AppendOutcome::Overflowed(drained);
            }
            opening = true;
        }

        let handle = self.arena.put(self.scratch.slice(encoded));
        self.batch_byte_size += if opening { standalone } else { encoded.len };
        self.pending_spans += 1;

        self.batches
            .entry(service.to_string())
            .or_insert_with(|| Batch {
                process: Arc::clone(&process),
                spans: Vec::new(),
            })
            .spans
            .push(handle);

        Ok(outcome)
    }

    fn resolve_process(&mut self, span: &SpanRecord) -> Arc<EncodedProcess> {
        let service = match span.peer_service() {
            Some(peer)
                if self.processes.contains(peer)
                    || self.processes.len() < self.config.max_processes =>
            {
                peer
            }
            Some(peer) => {
                if !self.warned_process_cap {
                    tracing::warn!(
                        peer_service = peer,
                        max_processes = self.config.max_processes,
                        "process cache full, attributing spans to the default service"
                    );
                    self.warned_process_cap = true;
                }
                self.config.service_name.as_str()
            }
            None => self.config.service_name.as_str(),
        };
        self.processes.get_or_create(service)
    }

    /// Frames every open batch and resets all accumulation state.
    ///
    /// Batches are returned in service-name order; per service, spans keep
    /// their append order.
    pub fn take_batches(&mut self) -> Vec<WireBatch> {
        if self.pending_spans == 0 {
            return Vec::new();
        }

        let envelope = self.config.envelope;
        let arena = &self.arena;
        let wire: Vec<WireBatch> = self
            .batches
            .iter_mut()
            .filter(|(_, batch)| !batch.spans.is_empty())
            .map(|(service, batch)| {
                let span_bytes: usize = batch.spans.iter().map(|h| h.len).sum();
                let mut packet = GrowableBuffer::with_capacity(
                    envelope.overhead() + batch.process.len() + span_bytes,
                );
                write_wire_batch(
                    &mut ProtocolWriter::new(&mut packet),
                    envelope,
                    batch.process.bytes(),
                    batch.spans.len(),
                    batch.spans.iter().map(|h| arena.slice(*h)),
                );
                let span_count = batch.spans.len();
                // cleared, not removed: the entry is reused on the next append
                batch.spans.clear();
                WireBatch {
                    service_name: service.clone(),
                    span_count,
                    payload: packet.into_vec(),
                }
            })
            .collect();

        self.arena.clear();
        self.batch_byte_size = 0;
        self.pending_spans = 0;
        wire
    }

    /// Spans waiting to be flushed
    pub fn pending_spans(&self) -> usize {
        self.pending_spans
    }

    /// Running byte size of all open batches, framing included
    pub fn pending_bytes(&self) -> usize {
        self.batch_byte_size
    }

    pub fn is_empty(&self) -> bool {
        self.pending_spans == 0
    }

    /// Encoded descriptor for a service, if one has been created
    pub fn process(&mut self, service_name: &str) -> Option<Arc<EncodedProcess>> {
        self.processes
            .contains(service_name)
            .then(|| self.processes.get_or_create(service_name))
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    /// Drops pending spans and releases every buffer and cached descriptor.
    pub fn release(&mut self) {
        self.batches.clear();
        self.arena.release();
        self.scratch.release();
        self.processes.release();
        self.batch_byte_size = 0;
        self.pending_spans = 0;
    }
}
