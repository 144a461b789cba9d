//! Process Descriptor Cache
//!
//! Every distinct service name is encoded into a Jaeger `Process` struct once;
//! the materialized bytes are shared by every batch for that service for the
//! lifetime of the exporter.

use crate::buffer::GrowableBuffer;
use crate::encoder::encode_record;
use crate::span::Tag;
use std::collections::HashMap;
use std::sync::Arc;

/// A logical telemetry source.
#[derive(Debug, Clone, PartialEq)]
pub struct Process {
    pub service_name: String,
    pub tags: Vec<Tag>,
}

impl Process {
    pub fn new(service_name: impl Into<String>, tags: Vec<Tag>) -> Self {
        Self {
            service_name: service_name.into(),
            tags,
        }
    }
}

/// Tags attached to every process when none are configured.
pub fn default_process_tags() -> Vec<Tag> {
    vec![
        Tag::new("client.name", env!("CARGO_PKG_NAME")),
        Tag::new("client.version", env!("CARGO_PKG_VERSION")),
    ]
}

/// A process together with its encoded bytes.
#[derive(Debug)]
pub struct EncodedProcess {
    process: Process,
    bytes: Vec<u8>,
}

impl EncodedProcess {
    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn service_name(&self) -> &str {
        &self.process.service_name
    }

    /// Encoded `Process` struct, stop marker included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Service name -> encoded process. Grows monotonically, never evicts.
#[derive(Debug)]
pub struct ProcessCache {
    tags: Vec<Tag>,
    entries: HashMap<String, Arc<EncodedProcess>>,
    scratch: GrowableBuffer,
}

impl ProcessCache {
    /// Creates a cache; an empty `tags` falls back to [`default_process_tags`].
    pub fn new(tags: Vec<Tag>) -> Self {
        let tags = if tags.is_empty() {
            default_process_tags()
        } else {
            tags
        };
        Self {
            tags,
            entries: HashMap::new(),
            scratch: GrowableBuffer::with_capacity(256),
        }
    }

    /// Returns the descriptor for `service_name`, encoding it on first use.
    pub fn get_or_create(&mut self, service_name: &str) -> Arc<EncodedProcess> {
        if let Some(existing) = self.entries.get(service_name) {
            return Arc::clone(existing);
        }

        let process = Process::new(service_name, self.tags.clone());
        self.scratch.clear();
        let handle = encode_record(&mut self.scratch, &process);
        let encoded = Arc::new(EncodedProcess {
            bytes: self.scratch.materialize(handle),
            process,
        });
        self.entries
            .insert(service_name.to_string(), Arc::clone(&encoded));
        encoded
    }

    pub fn contains(&self, service_name: &str) -> bool {
        self.entries.contains_key(service_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every cached descriptor and the scratch allocation.
    pub fn release(&mut self) {
        self.entries.clear();
        self.scratch.release();
    }
}
