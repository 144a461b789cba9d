//! Transports
//!
//! A transport delivers one framed batch and reports what happened. It never
//! retries and never returns `Err`: every failure is classified into a
//! [`TransportStatus`] so the retry policy can decide what to do with it.
//!
//! Like the exporter traits this uses native async fn in traits. For dynamic
//! dispatch use [`TransportBoxed`], which every [`Transport`] implements.

pub mod grpc;
pub mod http;
pub mod memory;
pub mod udp;

pub use grpc::GrpcTransport;
pub use http::HttpTransport;
pub use memory::{InMemoryTransport, NullTransport};
pub use udp::UdpTransport;

use crate::encoder::Envelope;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

/// gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RpcCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl RpcCode {
    /// Maps a raw status code; unrecognized values become `Unknown`.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }
}

/// Transport-level outcome classification for a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// RPC status returned by the collector
    Rpc(RpcCode),
    /// Non-2xx HTTP status
    Http(u16),
    /// Socket-level failure
    Io(io::ErrorKind),
    /// The deadline passed before the send completed
    Timeout,
    /// The send was abandoned because shutdown was requested
    Cancelled,
    /// Anything that could not be classified
    Unknown,
}

impl TransportStatus {
    /// Fixed retryability table.
    ///
    /// `ResourceExhausted` is retryable only when the server sent a delay hint;
    /// without one the limit is assumed to be permanent.
    pub fn is_retryable(self, has_retry_hint: bool) -> bool {
        match self {
            Self::Rpc(code) => match code {
                RpcCode::Cancelled
                | RpcCode::DeadlineExceeded
                | RpcCode::Aborted
                | RpcCode::OutOfRange
                | RpcCode::Unavailable
                | RpcCode::DataLoss => true,
                RpcCode::ResourceExhausted => has_retry_hint,
                _ => false,
            },
            Self::Http(status) => matches!(status, 429 | 502 | 503 | 504),
            Self::Io(kind) => matches!(
                kind,
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::AddrNotAvailable
            ),
            Self::Timeout => true,
            Self::Cancelled | Self::Unknown => false,
        }
    }
}

/// A failed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub status: TransportStatus,
    /// Server-provided delay before the next attempt
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl TransportFailure {
    pub fn new(status: TransportStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable(self.retry_after.is_some())
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.status, self.message)?;
        if let Some(delay) = self.retry_after {
            write!(f, " (retry after {:?})", delay)?;
        }
        Ok(())
    }
}

/// Result of a single send attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    Failure(TransportFailure),
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<TransportFailure> for SendOutcome {
    fn from(failure: TransportFailure) -> Self {
        Self::Failure(failure)
    }
}

/// Delivers framed batches to a backend.
pub trait Transport: Send + Sync {
    /// Sends one payload, giving up at `deadline`.
    fn send(&self, payload: Bytes, deadline: Instant) -> impl Future<Output = SendOutcome> + Send;

    /// Framing this transport's receiver expects.
    fn envelope(&self) -> Envelope;

    /// Releases connections. Sends after close fail with `Cancelled`.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Returns the transport name for logging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    fn send_boxed(
        &self,
        payload: Bytes,
        deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = SendOutcome> + Send + '_>>;

    fn envelope(&self) -> Envelope;

    fn close_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any Transport can be used as TransportBoxed
impl<T: Transport> TransportBoxed for T {
    fn send_boxed(
        &self,
        payload: Bytes,
        deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = SendOutcome> + Send + '_>> {
        Box::pin(self.send(payload, deadline))
    }

    fn envelope(&self) -> Envelope {
        Transport::envelope(self)
    }

    fn close_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.close())
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}
