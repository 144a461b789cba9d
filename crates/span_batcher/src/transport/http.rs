//! HTTP collector transport: Thrift-binary batches over POST.

use super::{SendOutcome, Transport, TransportFailure, TransportStatus};
use crate::encoder::Envelope;
use crate::error::ExportError;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const THRIFT_CONTENT_TYPE: &str = "application/vnd.apache.thrift.binary";

/// Posts bare `Batch` structs to a collector endpoint.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    closed: AtomicBool,
}

impl HttpTransport {
    /// `headers` are attached to every request in addition to the content type.
    pub fn new(endpoint: impl Into<String>, headers: &BTreeMap<String, String>) -> Result<Self, ExportError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static(THRIFT_CONTENT_TYPE));
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ExportError::TransportSetup(format!("header name {:?}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ExportError::TransportSetup(format!("header {:?}: {}", key, e)))?;
            default_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| ExportError::TransportSetup(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Delay from a `Retry-After` header. Only the delta-seconds form is honored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn classify_error(e: &reqwest::Error) -> TransportStatus {
    if e.is_timeout() {
        TransportStatus::Timeout
    } else if e.is_connect() {
        TransportStatus::Io(io::ErrorKind::ConnectionRefused)
    } else if e.is_request() || e.is_body() {
        TransportStatus::Io(io::ErrorKind::ConnectionReset)
    } else {
        TransportStatus::Unknown
    }
}

impl Transport for HttpTransport {
    async fn send(&self, payload: Bytes, deadline: Instant) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return TransportFailure::new(TransportStatus::Cancelled, "transport closed").into();
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return TransportFailure::new(TransportStatus::Timeout, "deadline already passed").into();
        }

        let request = self
            .client
            .post(&self.endpoint)
            .timeout(remaining)
            .body(payload)
            .send();

        let response = match tokio::time::timeout_at(deadline, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return TransportFailure::new(classify_error(&e), e.to_string()).into(),
            Err(_) => return TransportFailure::new(TransportStatus::Timeout, "http request timed out").into(),
        };

        let status = response.status();
        if status.is_success() {
            return SendOutcome::Success;
        }

        let mut failure = TransportFailure::new(
            TransportStatus::Http(status.as_u16()),
            format!("collector responded {}", status),
        );
        if matches!(status, StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE) {
            if let Some(delay) = parse_retry_after(response.headers()) {
                failure = failure.with_retry_after(delay);
            }
        }
        failure.into()
    }

    fn envelope(&self) -> Envelope {
        Envelope::Batch
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn name(&self) -> &str {
        "http"
    }
}
