//! Error types for the export pipeline.
//!
//! Transport failures are not errors at this level: they are reported as
//! [`SendOutcome`](crate::transport::SendOutcome) values and handled inside
//! flush. Only invariant violations and setup problems surface here.

use crate::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    /// A single span can never fit in one packet, no matter how batches are cut.
    #[error("span record needs {size} bytes but max packet size is {max_packet_size}")]
    RecordTooLarge { size: usize, max_packet_size: usize },

    /// The exporter has been shut down.
    #[error("exporter is closed")]
    Closed,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A transport could not be constructed.
    #[error("transport setup failed: {0}")]
    TransportSetup(String),
}

impl ExportError {
    /// Returns `true` if retrying the same call can never succeed.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RecordTooLarge { .. } | Self::Config(_))
    }
}
