//! Span Records
//!
//! The finished-span model handed to the exporter: ids, timing, tags, logs
//! and references. `peer.service` picks the process a span is batched under.

use serde::{Deserialize, Serialize};

/// Tag key whose string value overrides the exporter's service name.
pub const PEER_SERVICE_TAG: &str = "peer.service";

/// 128-bit trace identifier, split the way the wire format carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TraceId {
    /// Upper 64 bits
    pub high: u64,
    /// Lower 64 bits
    pub low: u64,
}

impl TraceId {
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

impl From<u128> for TraceId {
    fn from(id: u128) -> Self {
        Self {
            high: (id >> 64) as u64,
            low: id as u64,
        }
    }
}

impl From<TraceId> for u128 {
    fn from(id: TraceId) -> Self {
        (u128::from(id.high) << 64) | u128::from(id.low)
    }
}

/// Span flag bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpanFlags(pub u32);

impl SpanFlags {
    /// Bit 0: the span was sampled/recorded
    pub const SAMPLED: SpanFlags = SpanFlags(1);

    pub const fn is_sampled(self) -> bool {
        self.0 & Self::SAMPLED.0 != 0
    }
}

/// Tag value: a closed set of variants, exactly one populated per tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagValue {
    String(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::String(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        TagValue::String(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::I64(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::F64(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

impl From<Vec<u8>> for TagValue {
    fn from(v: Vec<u8>) -> Self {
        TagValue::Bytes(v)
    }
}

/// Key/value pair attached to spans, logs and processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: TagValue,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Timed event recorded during a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Microseconds since the Unix epoch
    pub timestamp_us: i64,
    pub fields: Vec<Tag>,
}

impl LogEvent {
    pub fn new(timestamp_us: i64, fields: Vec<Tag>) -> Self {
        Self {
            timestamp_us,
            fields,
        }
    }
}

/// Relationship to another span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefKind {
    ChildOf,
    FollowsFrom,
}

/// Reference to another span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRef {
    pub kind: RefKind,
    pub trace_id: TraceId,
    pub span_id: u64,
}

/// One finished unit of work, immutable once handed to the exporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: TraceId,
    pub span_id: u64,
    /// Parent span identifier (0 if root span)
    pub parent_span_id: u64,
    pub operation_name: String,
    pub flags: SpanFlags,
    /// Start time (microseconds since Unix epoch)
    pub start_time_us: i64,
    /// Duration in microseconds
    pub duration_us: i64,
    /// Ordered tags; duplicates are kept as-is
    pub tags: Vec<Tag>,
    pub logs: Vec<LogEvent>,
    pub references: Vec<SpanRef>,
}

impl SpanRecord {
    /// Creates a sampled root span with no timing, tags, logs or references
    pub fn new(trace_id: impl Into<TraceId>, span_id: u64, operation_name: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id,
            parent_span_id: 0,
            operation_name: operation_name.into(),
            flags: SpanFlags::SAMPLED,
            start_time_us: 0,
            duration_us: 0,
            tags: Vec::new(),
            logs: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_span_id: u64) -> Self {
        self.parent_span_id = parent_span_id;
        self
    }

    pub fn with_timing(mut self, start_time_us: i64, duration_us: i64) -> Self {
        self.start_time_us = start_time_us;
        self.duration_us = duration_us;
        self
    }

    pub fn with_flags(mut self, flags: SpanFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }

    pub fn with_log(mut self, log: LogEvent) -> Self {
        self.logs.push(log);
        self
    }

    pub fn with_reference(mut self, kind: RefKind, trace_id: impl Into<TraceId>, span_id: u64) -> Self {
        self.references.push(SpanRef {
            kind,
            trace_id: trace_id.into(),
            span_id,
        });
        self
    }

    /// Returns the `peer.service` override, if the span carries one.
    ///
    /// The last string-valued `peer.service` tag wins.
    pub fn peer_service(&self) -> Option<&str> {
        self.tags.iter().rev().find_map(|tag| match &tag.value {
            TagValue::String(s) if tag.key == PEER_SERVICE_TAG && !s.is_empty() => Some(s.as_str()),
            _ => None,
        })
    }
}
