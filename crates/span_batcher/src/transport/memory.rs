//! In-process transports for tests, benchmarks and the demo binary.

use super::{SendOutcome, Transport, TransportFailure};
use crate::encoder::Envelope;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Records every payload it is handed.
///
/// Outcomes can be scripted with [`push_outcome`](Self::push_outcome); once
/// the script is exhausted every send succeeds. An optional per-send latency
/// is honored against the deadline.
#[derive(Debug)]
pub struct InMemoryTransport {
    envelope: Envelope,
    delivered: Mutex<Vec<Bytes>>,
    script: Mutex<VecDeque<SendOutcome>>,
    latency: Option<Duration>,
    attempts: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryTransport {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            delivered: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            latency: None,
            attempts: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Each send sleeps this long before completing.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues the outcome of a future send attempt.
    pub fn push_outcome(&self, outcome: SendOutcome) {
        lock(&self.script).push_back(outcome);
    }

    /// Queues `n` identical failures.
    pub fn fail_next(&self, n: usize, failure: TransportFailure) {
        let mut script = lock(&self.script);
        for _ in 0..n {
            script.push_back(SendOutcome::Failure(failure.clone()));
        }
    }

    /// Payloads that were sent successfully, in send order.
    pub fn delivered(&self) -> Vec<Bytes> {
        lock(&self.delivered).clone()
    }

    pub fn delivered_count(&self) -> usize {
        lock(&self.delivered).len()
    }

    /// Send attempts including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(Envelope::Batch)
    }
}

/// Poisoning only happens if a test thread panicked mid-push; keep going.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Transport for InMemoryTransport {
    async fn send(&self, payload: Bytes, deadline: Instant) -> SendOutcome {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            return TransportFailure::new(super::TransportStatus::Cancelled, "transport closed").into();
        }
        if let Some(latency) = self.latency {
            if tokio::time::timeout_at(deadline, tokio::time::sleep(latency)).await.is_err() {
                return TransportFailure::new(super::TransportStatus::Timeout, "in-memory send timed out").into();
            }
        }

        let scripted = lock(&self.script).pop_front();
        match scripted {
            Some(SendOutcome::Failure(failure)) => SendOutcome::Failure(failure),
            Some(SendOutcome::Success) | None => {
                lock(&self.delivered).push(payload);
                SendOutcome::Success
            }
        }
    }

    fn envelope(&self) -> Envelope {
        self.envelope
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

/// Accepts and discards every payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport {
    envelope: Envelope,
}

impl NullTransport {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope }
    }
}

impl Transport for NullTransport {
    async fn send(&self, _payload: Bytes, _deadline: Instant) -> SendOutcome {
        SendOutcome::Success
    }

    fn envelope(&self) -> Envelope {
        self.envelope
    }

    fn name(&self) -> &str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportStatus;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn test_records_payloads_in_order() {
        let transport = InMemoryTransport::default();
        transport.send(Bytes::from_static(b"one"), deadline()).await;
        transport.send(Bytes::from_static(b"two"), deadline()).await;
        assert_eq!(transport.delivered(), vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let transport = InMemoryTransport::default();
        transport.fail_next(2, TransportFailure::new(TransportStatus::Http(503), "busy"));

        for _ in 0..2 {
            assert!(!transport.send(Bytes::from_static(b"x"), deadline()).await.is_success());
        }
        assert!(transport.send(Bytes::from_static(b"x"), deadline()).await.is_success());
        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.delivered_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_past_deadline_times_out() {
        let transport = InMemoryTransport::default().with_latency(Duration::from_secs(5));
        let outcome = transport
            .send(Bytes::from_static(b"x"), Instant::now() + Duration::from_secs(1))
            .await;
        let SendOutcome::Failure(failure) = outcome else {
            panic!("latency exceeds deadline");
        };
        assert_eq!(failure.status, TransportStatus::Timeout);
        assert_eq!(transport.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_null_transport_accepts_everything() {
        let transport = NullTransport::new(Envelope::EmitBatch);
        assert!(transport.send(Bytes::new(), deadline()).await.is_success());
        assert_eq!(Transport::envelope(&transport), Envelope::EmitBatch);
    }
}
