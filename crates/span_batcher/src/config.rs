//! Exporter configuration.
//!
//! Built with `Default` + `with_*` setters, deserialized from JSON, or read from
//! the standard `OTEL_*` environment variables.

use crate::encoder::Envelope;
use crate::span::Tag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Default maximum datagram / request size.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 65_000;
/// Default idle time before buffered spans are flushed.
pub const DEFAULT_MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Default per-send deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default cap on distinct service names.
pub const DEFAULT_MAX_PROCESSES: usize = 1024;
/// Binary-protocol agent port.
pub const DEFAULT_AGENT_PORT: u16 = 6832;

pub const ENV_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
pub const ENV_AGENT_HOST: &str = "OTEL_EXPORTER_JAEGER_AGENT_HOST";
pub const ENV_AGENT_PORT: &str = "OTEL_EXPORTER_JAEGER_AGENT_PORT";
pub const ENV_ENDPOINT: &str = "OTEL_EXPORTER_JAEGER_ENDPOINT";
pub const ENV_PROTOCOL: &str = "OTEL_EXPORTER_JAEGER_PROTOCOL";
pub const ENV_TIMEOUT: &str = "OTEL_EXPORTER_JAEGER_TIMEOUT";
pub const ENV_SCHEDULE_DELAY: &str = "OTEL_BSP_SCHEDULE_DELAY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("max_packet_size {max_packet_size} leaves no room for spans (framing needs {overhead} bytes)")]
    PacketTooSmall { max_packet_size: usize, overhead: usize },

    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which transport carries the batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// UDP datagrams to an agent
    #[default]
    Udp,
    /// Unary RPC to a collector
    Grpc,
    /// HTTP POST to a collector
    Http,
}

impl Protocol {
    /// Framing the protocol's receiver expects.
    pub const fn envelope(self) -> Envelope {
        match self {
            Protocol::Udp => Envelope::EmitBatch,
            Protocol::Grpc | Protocol::Http => Envelope::Batch,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "udp" | "udp/thrift.binary" => Some(Protocol::Udp),
            "grpc" => Some(Protocol::Grpc),
            "http" | "http/thrift.binary" => Some(Protocol::Http),
            _ => None,
        }
    }
}

/// Exporter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Service name used when a span carries no `peer.service` override
    pub service_name: String,
    /// Process-level tags; empty means the built-in default set
    pub process_tags: BTreeMap<String, String>,
    pub protocol: Protocol,
    /// Agent host (UDP)
    pub agent_host: String,
    /// Agent port (UDP)
    pub agent_port: u16,
    /// Collector endpoint (gRPC / HTTP)
    pub endpoint: String,
    /// Extra HTTP headers / RPC metadata
    pub headers: BTreeMap<String, String>,
    /// Upper bound on one wire message, framing included
    pub max_packet_size: usize,
    /// Idle time after which buffered spans are flushed
    #[serde(with = "duration_ms", rename = "max_flush_interval_ms")]
    pub max_flush_interval: Duration,
    /// Deadline for one send, retries included
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Cap on distinct service names; later names fall back to `service_name`
    pub max_processes: usize,
    /// Optional cap on send attempts (none = retry until the deadline)
    pub max_retry_attempts: Option<u32>,
    /// Initial capacity of the span arena
    pub initial_buffer_capacity: usize,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown_service".to_string(),
            process_tags: BTreeMap::new(),
            protocol: Protocol::Udp,
            agent_host: "localhost".to_string(),
            agent_port: DEFAULT_AGENT_PORT,
            endpoint: String::new(),
            headers: BTreeMap::new(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_flush_interval: DEFAULT_MAX_FLUSH_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            max_processes: DEFAULT_MAX_PROCESSES,
            max_retry_attempts: None,
            initial_buffer_capacity: crate::buffer::DEFAULT_INITIAL_CAPACITY,
        }
    }
}

impl ExporterConfig {
    /// Parses a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the `OTEL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_SERVICE_NAME) {
            config.service_name = v;
        }
        if let Some(v) = lookup(ENV_AGENT_HOST) {
            config.agent_host = v;
        }
        if let Some(v) = lookup(ENV_AGENT_PORT) {
            config.agent_port = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_AGENT_PORT,
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup(ENV_ENDPOINT) {
            config.endpoint = v;
        }
        if let Some(v) = lookup(ENV_PROTOCOL) {
            config.protocol = Protocol::parse(&v).ok_or(ConfigError::InvalidValue {
                key: ENV_PROTOCOL,
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup(ENV_TIMEOUT) {
            config.timeout = parse_millis(ENV_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(ENV_SCHEDULE_DELAY) {
            config.max_flush_interval = parse_millis(ENV_SCHEDULE_DELAY, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the pipeline unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let overhead = self.protocol.envelope().overhead();
        if self.max_packet_size <= overhead {
            return Err(ConfigError::PacketTooSmall {
                max_packet_size: self.max_packet_size,
                overhead,
            });
        }
        if self.max_flush_interval.is_zero() {
            return Err(ConfigError::Zero("max_flush_interval"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Zero("timeout"));
        }
        if self.max_processes == 0 {
            return Err(ConfigError::Zero("max_processes"));
        }
        if self.max_retry_attempts == Some(0) {
            return Err(ConfigError::Zero("max_retry_attempts"));
        }
        Ok(())
    }

    /// `host:port` of the agent.
    pub fn agent_address(&self) -> String {
        format!("{}:{}", self.agent_host, self.agent_port)
    }

    /// Collector endpoint, falling back to the protocol's conventional default.
    pub fn collector_endpoint(&self) -> String {
        if !self.endpoint.is_empty() {
            return self.endpoint.clone();
        }
        match self.protocol {
            Protocol::Grpc => "http://localhost:14250".to_string(),
            Protocol::Http | Protocol::Udp => "http://localhost:14268/api/traces".to_string(),
        }
    }

    /// Process tags as string tags.
    pub fn process_tag_list(&self) -> Vec<Tag> {
        self.process_tags
            .iter()
            .map(|(k, v)| Tag::new(k.clone(), v.clone()))
            .collect()
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_process_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.process_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_agent(mut self, host: impl Into<String>, port: u16) -> Self {
        self.agent_host = host.into();
        self.agent_port = port;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_max_flush_interval(mut self, interval: Duration) -> Self {
        self.max_flush_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = Some(attempts);
        self
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
