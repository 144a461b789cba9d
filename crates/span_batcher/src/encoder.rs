//! Record Encoder
//!
//! Serializes Jaeger records (process, span, tag, log, span reference) with the
//! Thrift binary protocol into a [`GrowableBuffer`], returning a handle that
//! covers exactly the bytes of one record (struct fields plus stop marker).
//!
//! Records are encoded once and later spliced into a framed wire message by
//! [`write_wire_batch`]; struct encodings are position-independent, so span
//! bytes can be copied between buffers without re-encoding.

use crate::buffer::{BufferHandle, GrowableBuffer};
use crate::process::Process;
use crate::span::{LogEvent, RefKind, SpanRecord, SpanRef, Tag, TagValue};
use crate::thrift::{self, Field, MessageType, ProtocolWriter, TType};

/// Method name of the agent's one-way batch call.
pub const EMIT_BATCH_METHOD: &str = "emitBatch";

/// Framing placed around one process and its spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Envelope {
    /// Agent `emitBatch(batch)` one-way message (datagram transport).
    #[default]
    EmitBatch,
    /// Bare collector `Batch` struct (HTTP / RPC transports).
    Batch,
}

impl Envelope {
    /// Framing bytes added on top of the process and span record bytes.
    pub const fn overhead(self) -> usize {
        // Batch: process field header, spans field header, list header, stop
        let batch = thrift::FIELD_HEADER_LEN * 2 + thrift::LIST_HEADER_LEN + thrift::STOP_LEN;
        match self {
            Envelope::Batch => batch,
            // message header + args field header + batch + args stop
            Envelope::EmitBatch => {
                thrift::message_header_len(EMIT_BATCH_METHOD.len())
                    + thrift::FIELD_HEADER_LEN
                    + batch
                    + thrift::STOP_LEN
            }
        }
    }
}

/// A record that can be written with the binary protocol.
pub trait Encode {
    /// Writes the struct's fields followed by the stop marker.
    fn encode(&self, w: &mut ProtocolWriter<'_>);
}

/// Encodes one record at the buffer's cursor.
pub fn encode_record<R: Encode + ?Sized>(buf: &mut GrowableBuffer, record: &R) -> BufferHandle {
    let start = buf.position();
    record.encode(&mut ProtocolWriter::new(buf));
    buf.handle_since(start)
}

mod tag_fields {
    use super::{Field, TType};

    pub const KEY: Field = Field::new("key", TType::String, 1);
    pub const V_TYPE: Field = Field::new("vType", TType::I32, 2);
    pub const V_STR: Field = Field::new("vStr", TType::String, 3);
    pub const V_DOUBLE: Field = Field::new("vDouble", TType::Double, 4);
    pub const V_BOOL: Field = Field::new("vBool", TType::Bool, 5);
    pub const V_LONG: Field = Field::new("vLong", TType::I64, 6);
    pub const V_BINARY: Field = Field::new("vBinary", TType::String, 7);
}

mod log_fields {
    use super::{Field, TType};

    pub const TIMESTAMP: Field = Field::new("timestamp", TType::I64, 1);
    pub const FIELDS: Field = Field::new("fields", TType::List, 2);
}

mod ref_fields {
    use super::{Field, TType};

    pub const REF_TYPE: Field = Field::new("refType", TType::I32, 1);
    pub const TRACE_ID_LOW: Field = Field::new("traceIdLow", TType::I64, 2);
    pub const TRACE_ID_HIGH: Field = Field::new("traceIdHigh", TType::I64, 3);
    pub const SPAN_ID: Field = Field::new("spanId", TType::I64, 4);
}

mod span_fields {
    use super::{Field, TType};

    pub const TRACE_ID_LOW: Field = Field::new("traceIdLow", TType::I64, 1);
    pub const TRACE_ID_HIGH: Field = Field::new("traceIdHigh", TType::I64, 2);
    pub const SPAN_ID: Field = Field::new("spanId", TType::I64, 3);
    pub const PARENT_SPAN_ID: Field = Field::new("parentSpanId", TType::I64, 4);
    pub const OPERATION_NAME: Field = Field::new("operationName", TType::String, 5);
    pub const REFERENCES: Field = Field::new("references", TType::List, 6);
    pub const FLAGS: Field = Field::new("flags", TType::I32, 7);
    pub const START_TIME: Field = Field::new("startTime", TType::I64, 8);
    pub const DURATION: Field = Field::new("duration", TType::I64, 9);
    pub const TAGS: Field = Field::new("tags", TType::List, 10);
    pub const LOGS: Field = Field::new("logs", TType::List, 11);
}

mod process_fields {
    use super::{Field, TType};

    pub const SERVICE_NAME: Field = Field::new("serviceName", TType::String, 1);
    pub const TAGS: Field = Field::new("tags", TType::List, 2);
}

mod batch_fields {
    use super::{Field, TType};

    pub const PROCESS: Field = Field::new("process", TType::Struct, 1);
    pub const SPANS: Field = Field::new("spans", TType::List, 2);
    pub const EMIT_BATCH_ARG: Field = Field::new("batch", TType::Struct, 1);
}

/// Jaeger `TagType` discriminants.
const fn tag_type(value: &TagValue) -> i32 {
    match value {
        TagValue::String(_) => 0,
        TagValue::F64(_) => 1,
        TagValue::Bool(_) => 2,
        TagValue::I64(_) => 3,
        TagValue::Bytes(_) => 4,
    }
}

impl Encode for Tag {
    fn encode(&self, w: &mut ProtocolWriter<'_>) {
        w.write_field_begin(tag_fields::KEY);
        w.write_string(&self.key);
        w.write_field_begin(tag_fields::V_TYPE);
        w.write_i32(tag_type(&self.value));
        // only the populated variant is written
        match &self.value {
            TagValue::String(v) => {
                w.write_field_begin(tag_fields::V_STR);
                w.write_string(v);
            }
            TagValue::F64(v) => {
                w.write_field_begin(tag_fields::V_DOUBLE);
                w.write_double(*v);
            }
            TagValue::Bool(v) => {
                w.write_field_begin(tag_fields::V_BOOL);
                w.write_bool(*v);
            }
            TagValue::I64(v) => {
                w.write_field_begin(tag_fields::V_LONG);
                w.write_i64(*v);
            }
            TagValue::Bytes(v) => {
                w.write_field_begin(tag_fields::V_BINARY);
                w.write_binary(v);
            }
        }
        w.write_field_stop();
    }
}

fn write_struct_list<T: Encode>(w: &mut ProtocolWriter<'_>, items: &[T]) {
    w.write_list_begin(TType::Struct, items.len());
    for item in items {
        item.encode(w);
    }
}

impl Encode for LogEvent {
    fn encode(&self, w: &mut ProtocolWriter<'_>) {
        w.write_field_begin(log_fields::TIMESTAMP);
        w.write_i64(self.timestamp_us);
        // required, even when empty
        w.write_field_begin(log_fields::FIELDS);
        write_struct_list(w, &self.fields);
        w.write_field_stop();
    }
}

impl Encode for SpanRef {
    fn encode(&self, w: &mut ProtocolWriter<'_>) {
        let ref_type = match self.kind {
            RefKind::ChildOf => 0,
            RefKind::FollowsFrom => 1,
        };
        w.write_field_begin(ref_fields::REF_TYPE);
        w.write_i32(ref_type);
        w.write_field_begin(ref_fields::TRACE_ID_LOW);
        w.write_i64(self.trace_id.low as i64);
        w.write_field_begin(ref_fields::TRACE_ID_HIGH);
        w.write_i64(self.trace_id.high as i64);
        w.write_field_begin(ref_fields::SPAN_ID);
        w.write_i64(self.span_id as i64);
        w.write_field_stop();
    }
}

impl Encode for SpanRecord {
    fn encode(&self, w: &mut ProtocolWriter<'_>) {
        w.write_field_begin(span_fields::TRACE_ID_LOW);
        w.write_i64(self.trace_id.low as i64);
        w.write_field_begin(span_fields::TRACE_ID_HIGH);
        w.write_i64(self.trace_id.high as i64);
        w.write_field_begin(span_fields::SPAN_ID);
        w.write_i64(self.span_id as i64);
        w.write_field_begin(span_fields::PARENT_SPAN_ID);
        w.write_i64(self.parent_span_id as i64);
        w.write_field_begin(span_fields::OPERATION_NAME);
        w.write_string(&self.operation_name);

        if !self.references.is_empty() {
            w.write_field_begin(span_fields::REFERENCES);
            write_struct_list(w, &self.references);
        }

        w.write_field_begin(span_fields::FLAGS);
        w.write_i32(self.flags.0 as i32);
        w.write_field_begin(span_fields::START_TIME);
        w.write_i64(self.start_time_us);
        w.write_field_begin(span_fields::DURATION);
        w.write_i64(self.duration_us);

        if !self.tags.is_empty() {
            w.write_field_begin(span_fields::TAGS);
            write_struct_list(w, &self.tags);
        }
        if !self.logs.is_empty() {
            w.write_field_begin(span_fields::LOGS);
            write_struct_list(w, &self.logs);
        }
        w.write_field_stop();
    }
}

impl Encode for Process {
    fn encode(&self, w: &mut ProtocolWriter<'_>) {
        w.write_field_begin(process_fields::SERVICE_NAME);
        w.write_string(&self.service_name);
        if !self.tags.is_empty() {
            w.write_field_begin(process_fields::TAGS);
            write_struct_list(w, &self.tags);
        }
        w.write_field_stop();
    }
}

/// Frames one process and its already-encoded spans as a complete message.
///
/// `process` and every element of `spans` must be a full struct encoding as
/// returned by [`encode_record`]. The result is exactly
/// `envelope.overhead() + process.len() + sum(spans.len())` bytes.
pub fn write_wire_batch<'s>(
    w: &mut ProtocolWriter<'_>,
    envelope: Envelope,
    process: &[u8],
    span_count: usize,
    spans: impl IntoIterator<Item = &'s [u8]>,
) {
    if envelope == Envelope::EmitBatch {
        w.write_message_begin(EMIT_BATCH_METHOD, MessageType::Oneway, 0);
        w.write_field_begin(batch_fields::EMIT_BATCH_ARG);
    }

    w.write_field_begin(batch_fields::PROCESS);
    w.write_raw(process);
    w.write_field_begin(batch_fields::SPANS);
    w.write_list_begin(TType::Struct, span_count);
    let mut written = 0;
    for span in spans {
        w.write_raw(span);
        written += 1;
    }
    debug_assert_eq!(written, span_count, "span count does not match list header");
    w.write_field_stop();

    if envelope == Envelope::EmitBatch {
        w.write_field_stop();
    }
}
