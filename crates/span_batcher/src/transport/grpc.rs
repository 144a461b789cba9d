//! gRPC collector transport.
//!
//! The payload is sent as-is in a unary call through a pass-through codec, so
//! the collector receives exactly the bytes the accumulator framed. Throttle
//! hints are read from the `google.rpc.RetryInfo` entry of the
//! `grpc-status-details-bin` trailer.

use super::{RpcCode, SendOutcome, Transport, TransportFailure, TransportStatus};
use crate::encoder::Envelope;
use crate::error::ExportError;
use bytes::{Buf, BufMut, Bytes};
use prost::Message;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

/// Unary method batches are submitted to.
pub const SUBMIT_BATCHES_PATH: &str = "/jaeger.thrift.Collector/submitBatches";

const RETRY_INFO_TYPE_URL: &str = "type.googleapis.com/google.rpc.RetryInfo";

// =============================================================================
// STATUS DETAILS
// =============================================================================

/// `google.rpc.Status`, the payload of `grpc-status-details-bin`.
#[derive(Clone, PartialEq, Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<prost_types::Any>,
}

/// `google.rpc.RetryInfo`
#[derive(Clone, PartialEq, Message)]
struct RetryInfo {
    #[prost(message, optional, tag = "1")]
    retry_delay: Option<prost_types::Duration>,
}

fn retry_delay_from_details(details: &[u8]) -> Option<Duration> {
    if details.is_empty() {
        return None;
    }
    let status = RpcStatus::decode(details).ok()?;
    status
        .details
        .iter()
        .filter(|any| any.type_url == RETRY_INFO_TYPE_URL)
        .find_map(|any| RetryInfo::decode(any.value.as_slice()).ok()?.retry_delay)
        .and_then(|d| {
            let secs = u64::try_from(d.seconds).ok()?;
            let nanos = u32::try_from(d.nanos).ok()?;
            Some(Duration::new(secs, nanos))
        })
}

/// Maps a returned status to a failure, attaching a throttle hint when the
/// code is one a server would throttle with.
fn failure_from_status(status: &Status) -> TransportFailure {
    let code = RpcCode::from_i32(status.code() as i32);
    let mut failure = TransportFailure::new(TransportStatus::Rpc(code), status.message());
    if matches!(code, RpcCode::ResourceExhausted | RpcCode::Unavailable) {
        if let Some(delay) = retry_delay_from_details(status.details()) {
            failure = failure.with_retry_after(delay);
        }
    }
    failure
}

// =============================================================================
// PASS-THROUGH CODEC
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Submits batches to a collector over a lazily connected channel.
#[derive(Debug)]
pub struct GrpcTransport {
    channel: Channel,
    endpoint: String,
    metadata: MetadataMap,
    closed: AtomicBool,
}

impl GrpcTransport {
    /// Must be called inside a tokio runtime; the channel connects on first send.
    pub fn new(endpoint: impl Into<String>, headers: &BTreeMap<String, String>) -> Result<Self, ExportError> {
        let endpoint = endpoint.into();
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| ExportError::TransportSetup(format!("endpoint {:?}: {}", endpoint, e)))?
            .connect_lazy();

        let mut metadata = MetadataMap::new();
        for (key, value) in headers {
            let name = MetadataKey::from_bytes(key.to_ascii_lowercase().as_bytes())
                .map_err(|e| ExportError::TransportSetup(format!("metadata key {:?}: {}", key, e)))?;
            let value = MetadataValue::try_from(value.as_str())
                .map_err(|e| ExportError::TransportSetup(format!("metadata {:?}: {}", key, e)))?;
            metadata.insert(name, value);
        }

        Ok(Self {
            channel,
            endpoint,
            metadata,
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn unary(&self, payload: Bytes, timeout: Duration) -> Result<(), TransportFailure> {
        let mut client = tonic::client::Grpc::new(self.channel.clone());
        client.ready().await.map_err(|e| {
            TransportFailure::new(TransportStatus::Io(io::ErrorKind::ConnectionRefused), e.to_string())
        })?;

        let mut request = tonic::Request::new(payload);
        *request.metadata_mut() = self.metadata.clone();
        request.set_timeout(timeout);

        client
            .unary(request, PathAndQuery::from_static(SUBMIT_BATCHES_PATH), RawCodec)
            .await
            .map(|_| ())
            .map_err(|status| failure_from_status(&status))
    }
}

impl Transport for GrpcTransport {
    async fn send(&self, payload: Bytes, deadline: Instant) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return TransportFailure::new(TransportStatus::Cancelled, "transport closed").into();
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return TransportFailure::new(TransportStatus::Timeout, "deadline already passed").into();
        }

        match tokio::time::timeout_at(deadline, self.unary(payload, remaining)).await {
            Ok(Ok(())) => SendOutcome::Success,
            Ok(Err(failure)) => failure.into(),
            Err(_) => TransportFailure::new(TransportStatus::Timeout, "grpc call timed out").into(),
        }
    }

    fn envelope(&self) -> Envelope {
        Envelope::Batch
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn name(&self) -> &str {
        "grpc"
    }
}
