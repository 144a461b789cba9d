//! Exporter counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe export counters (uses atomics)
#[derive(Debug, Default)]
pub struct ExporterMetrics {
    /// Spans accepted by `append`
    pub spans_appended: AtomicU64,
    /// Spans rejected by `append` as too large
    pub spans_rejected: AtomicU64,
    /// Spans in batches the transport accepted
    pub spans_exported: AtomicU64,
    /// Spans in batches that were given up on
    pub spans_dropped: AtomicU64,
    pub batches_exported: AtomicU64,
    pub batches_dropped: AtomicU64,
    /// Attempts beyond the first, across all batches
    pub retries: AtomicU64,
    /// Flush cycles that sent at least one batch
    pub flushes: AtomicU64,
}

impl ExporterMetrics {
    pub fn spans_appended(&self) -> u64 {
        self.spans_appended.load(Ordering::Relaxed)
    }

    pub fn spans_rejected(&self) -> u64 {
        self.spans_rejected.load(Ordering::Relaxed)
    }

    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub(crate) fn record_append(&self) {
        self.spans_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.spans_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exported(&self, span_count: u64, attempts: u32) {
        self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
        self.retries
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, span_count: u64) {
        self.spans_dropped.fetch_add(span_count, Ordering::Relaxed);
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            spans_appended: self.spans_appended(),
            spans_rejected: self.spans_rejected(),
            spans_exported: self.spans_exported(),
            spans_dropped: self.spans_dropped(),
            batches_exported: self.batches_exported(),
            batches_dropped: self.batches_dropped(),
            retries: self.retries(),
            flushes: self.flushes(),
        }
    }
}

/// Plain-value copy of [`ExporterMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub spans_appended: u64,
    pub spans_rejected: u64,
    pub spans_exported: u64,
    pub spans_dropped: u64,
    pub batches_exported: u64,
    pub batches_dropped: u64,
    pub retries: u64,
    pub flushes: u64,
}
