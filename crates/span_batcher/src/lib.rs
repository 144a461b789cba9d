//! Span Batcher
//!
//! Batching export pipeline for finished trace spans. Producers hand over
//! completed spans; the pipeline encodes them once into Jaeger Thrift binary,
//! groups them per service into size-bounded batches, and ships each batch
//! through a pluggable transport (UDP agent, HTTP or gRPC collector) with
//! deadline-bounded retry.
//!
//! ```ignore
//! let config = ExporterConfig::from_env()?;
//! let exporter = BatchExporter::from_config(&config)?;
//!
//! exporter.append(&SpanRecord::new(trace_id, span_id, "GET /users")).await?;
//! exporter.shutdown().await;
//! ```
//!
//! The synchronous core ([`buffer`], [`encoder`], [`batch`]) has no locks and
//! no I/O; [`BatchExporter`] adds the gate, the idle timer and the transport.

pub mod batch;
pub mod buffer;
pub mod config;
pub mod encoder;
pub mod error;
pub mod exporter;
pub mod metrics;
pub mod process;
pub mod retry;
pub mod span;
pub mod thrift;
pub mod transport;

// Re-export main types
pub use batch::{AccumulatorConfig, AppendOutcome, BatchAccumulator, WireBatch};
pub use buffer::{BufferHandle, GrowableBuffer};
pub use config::{ConfigError, ExporterConfig, Protocol};
pub use encoder::{Encode, Envelope};
pub use error::ExportError;
pub use exporter::BatchExporter;
pub use metrics::{ExporterMetrics, MetricsSnapshot};
pub use process::{EncodedProcess, Process, ProcessCache};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use span::{LogEvent, RefKind, SpanFlags, SpanRecord, SpanRef, Tag, TagValue, TraceId};
pub use transport::{
    GrpcTransport, HttpTransport, InMemoryTransport, NullTransport, RpcCode, SendOutcome, Transport,
    TransportBoxed, TransportFailure, TransportStatus, UdpTransport,
};
pub use tokio_util::sync::CancellationToken;
