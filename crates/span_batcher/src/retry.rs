//! Retry Policy
//!
//! Deadline-bounded exponential backoff with server throttle hints.
//!
//! After a failed attempt:
//!
//! 1. Stop if the deadline has passed or the status is not retryable.
//! 2. Wait exactly the server's hint when one was given (throttled), otherwise
//!    a uniformly random delay in `[0, backoff)`.
//! 3. Stop if that wait would end after the deadline.
//! 4. Grow the backoff: `min(MAX_BACKOFF, (hint or backoff) * 1.5)`.

use crate::transport::{SendOutcome, TransportBoxed, TransportFailure, TransportStatus};
use bytes::Bytes;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);
pub const MAX_BACKOFF: Duration = Duration::from_millis(5000);
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Backoff after a wait of `delay`.
pub fn next_backoff(delay: Duration) -> Duration {
    delay.min(MAX_BACKOFF).mul_f64(BACKOFF_MULTIPLIER).min(MAX_BACKOFF)
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub delay: Duration,
    /// The delay came from the server rather than the backoff.
    pub throttled: bool,
    pub next_backoff: Duration,
}

/// Progress of one batch through the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub backoff: Duration,
    pub deadline: Instant,
    pub throttled: bool,
    pub attempts: u32,
}

impl RetryState {
    pub fn new(deadline: Instant) -> Self {
        Self {
            backoff: INITIAL_BACKOFF,
            deadline,
            throttled: false,
            attempts: 0,
        }
    }

    fn apply(&mut self, decision: RetryDecision) {
        self.backoff = decision.next_backoff;
        self.throttled = decision.throttled;
    }
}

/// Retry policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed per batch; `None` means only the deadline bounds it.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(max_attempts: Option<u32>) -> Self {
        Self { max_attempts }
    }

    /// Decides whether to retry `failure` given the current state.
    pub fn evaluate(&self, failure: &TransportFailure, state: &RetryState) -> Option<RetryDecision> {
        self.evaluate_with(failure, state, &mut rand::thread_rng(), Instant::now())
    }

    /// [`evaluate`](Self::evaluate) with an explicit rng and clock.
    pub fn evaluate_with<R: Rng + ?Sized>(
        &self,
        failure: &TransportFailure,
        state: &RetryState,
        rng: &mut R,
        now: Instant,
    ) -> Option<RetryDecision> {
        if now >= state.deadline || !failure.is_retryable() {
            return None;
        }
        if self.max_attempts.is_some_and(|max| state.attempts >= max) {
            return None;
        }

        let (delay, throttled) = match failure.retry_after {
            Some(hint) => (hint, true),
            None if state.backoff.is_zero() => (Duration::ZERO, false),
            None => (rng.gen_range(Duration::ZERO..state.backoff), false),
        };
        // Server hints are unbounded; one that overflows the clock ends past any deadline.
        if now.checked_add(delay).map_or(true, |end| end > state.deadline) {
            return None;
        }

        let basis = if throttled { delay } else { state.backoff };
        Some(RetryDecision {
            delay,
            throttled,
            next_backoff: next_backoff(basis),
        })
    }
}

/// Sends `payload` until it succeeds, the policy gives up, or `cancel` fires.
///
/// Returns the number of attempts made on success.
pub async fn send_with_retry(
    transport: &dyn TransportBoxed,
    policy: RetryPolicy,
    payload: Bytes,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<u32, TransportFailure> {
    let mut state = RetryState::new(deadline);
    loop {
        state.attempts += 1;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(TransportFailure::new(TransportStatus::Cancelled, "send cancelled"));
            }
            outcome = transport.send_boxed(payload.clone(), deadline) => outcome,
        };

        let failure = match outcome {
            SendOutcome::Success => return Ok(state.attempts),
            SendOutcome::Failure(failure) => failure,
        };

        let Some(decision) = policy.evaluate(&failure, &state) else {
            return Err(failure);
        };
        tracing::debug!(
            transport = transport.name(),
            attempt = state.attempts,
            delay_ms = decision.delay.as_millis() as u64,
            throttled = decision.throttled,
            error = %failure,
            "retrying batch"
        );
        state.apply(decision);

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(TransportFailure::new(TransportStatus::Cancelled, "send cancelled"));
            }
            () = tokio::time::sleep(decision.delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Envelope;
    use crate::transport::{InMemoryTransport, RpcCode};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn unavailable() -> TransportFailure {
        TransportFailure::new(TransportStatus::Rpc(RpcCode::Unavailable), "down")
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = vec![backoff.as_millis()];
        for _ in 0..5 {
            backoff = next_backoff(backoff);
            seen.push(backoff.as_millis());
        }
        assert_eq!(seen, vec![1000, 1500, 2250, 3375, 5000, 5000]);
    }

    #[test]
    fn test_jittered_delay_below_backoff() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let now = Instant::now();
        let state = RetryState::new(now + Duration::from_secs(60));
        for _ in 0..100 {
            let decision = policy.evaluate_with(&unavailable(), &state, &mut rng, now).unwrap();
            assert!(decision.delay < INITIAL_BACKOFF);
            assert!(!decision.throttled);
            assert_eq!(decision.next_backoff, Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_throttle_hint_used_exactly() {
        let policy = RetryPolicy::default();
        let now = Instant::now();
        let state = RetryState::new(now + Duration::from_secs(60));
        let failure = TransportFailure::new(TransportStatus::Http(429), "slow down")
            .with_retry_after(Duration::from_secs(2));
        let decision = policy
            .evaluate_with(&failure, &state, &mut StdRng::seed_from_u64(1), now)
            .unwrap();
        assert_eq!(decision.delay, Duration::from_secs(2));
        assert!(decision.throttled);
        assert_eq!(decision.next_backoff, Duration::from_secs(3));
    }

    #[test]
    fn test_hint_past_deadline_gives_up() {
        let policy = RetryPolicy::default();
        let now = Instant::now();
        let state = RetryState::new(now + Duration::from_secs(1));
        let failure = TransportFailure::new(TransportStatus::Http(503), "busy")
            .with_retry_after(Duration::from_secs(2));
        assert!(policy
            .evaluate_with(&failure, &state, &mut StdRng::seed_from_u64(1), now)
            .is_none());
    }

    #[test]
    fn test_huge_hint_gives_up_without_overflow() {
        let policy = RetryPolicy::default();
        let now = Instant::now();
        let state = RetryState::new(now + Duration::from_secs(60));
        let failure = TransportFailure::new(TransportStatus::Http(503), "busy")
            .with_retry_after(Duration::from_secs(u64::MAX));
        assert!(policy.evaluate(&failure, &state).is_none());
        assert!(policy
            .evaluate_with(&failure, &state, &mut StdRng::seed_from_u64(1), now)
            .is_none());
    }

    #[test]
    fn test_next_backoff_saturates_on_huge_hint() {
        assert_eq!(next_backoff(Duration::MAX), MAX_BACKOFF);
        assert_eq!(next_backoff(Duration::from_secs(u64::MAX / 2)), MAX_BACKOFF);
    }

    #[test]
    fn test_non_retryable_and_expired() {
        let policy = RetryPolicy::default();
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(3);

        let state = RetryState::new(now + Duration::from_secs(60));
        let bad = TransportFailure::new(TransportStatus::Http(400), "bad request");
        assert!(policy.evaluate_with(&bad, &state, &mut rng, now).is_none());

        let expired = RetryState::new(now);
        assert!(policy.evaluate_with(&unavailable(), &expired, &mut rng, now).is_none());
    }

    #[test]
    fn test_attempt_cap() {
        let policy = RetryPolicy::new(Some(2));
        let now = Instant::now();
        let mut state = RetryState::new(now + Duration::from_secs(60));
        state.attempts = 2;
        assert!(policy.evaluate_with(&unavailable(), &state, &mut StdRng::seed_from_u64(0), now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let transport = InMemoryTransport::new(Envelope::Batch);
        transport.fail_next(3, unavailable());
        let deadline = Instant::now() + Duration::from_secs(60);

        let attempts = send_with_retry(
            &transport,
            RetryPolicy::default(),
            Bytes::from_static(b"batch"),
            deadline,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(attempts, 4);
        assert_eq!(transport.delivered_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_deadline() {
        let transport = InMemoryTransport::new(Envelope::Batch);
        transport.fail_next(1000, unavailable());
        let start = Instant::now();
        let deadline = start + Duration::from_secs(10);

        let failure = send_with_retry(
            &transport,
            RetryPolicy::default(),
            Bytes::from_static(b"batch"),
            deadline,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(failure.status, TransportStatus::Rpc(RpcCode::Unavailable));
        assert!(Instant::now() <= deadline);
        assert!(transport.attempts() > 1);
        assert_eq!(transport.delivered_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_sent_once() {
        let transport = InMemoryTransport::new(Envelope::Batch);
        transport.fail_next(1, TransportFailure::new(TransportStatus::Rpc(RpcCode::InvalidArgument), "bad"));

        let result = send_with_retry(
            &transport,
            RetryPolicy::default(),
            Bytes::from_static(b"batch"),
            Instant::now() + Duration::from_secs(60),
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_backoff_wait() {
        let transport = InMemoryTransport::new(Envelope::Batch);
        transport.fail_next(1, unavailable().with_retry_after(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let failure = send_with_retry(
            &transport,
            RetryPolicy::default(),
            Bytes::from_static(b"batch"),
            Instant::now() + Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap_err();

        assert_eq!(failure.status, TransportStatus::Cancelled);
        assert_eq!(transport.attempts(), 1);
    }
}
