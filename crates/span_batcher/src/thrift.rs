//! Thrift binary protocol writer.
//!
//! Fixed-width big-endian integers, length-prefixed strings, `(type, id)` field
//! headers and a stop byte closing every struct. Structs are self-delimited, so
//! a receiver can skip fields it does not know.

use crate::buffer::GrowableBuffer;

/// Wire type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TType {
    Stop = 0,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

/// Message kinds carried in a message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

const VERSION_1: u32 = 0x8001_0000;

/// Field descriptor. The name is informational only; it never hits the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ttype: TType,
    pub id: i16,
}

impl Field {
    pub const fn new(name: &'static str, ttype: TType, id: i16) -> Self {
        Self { name, ttype, id }
    }
}

/// Bytes taken by a field header.
pub const FIELD_HEADER_LEN: usize = 3;
/// Bytes taken by a list header.
pub const LIST_HEADER_LEN: usize = 5;
/// Bytes taken by a struct's stop marker.
pub const STOP_LEN: usize = 1;

/// Length of a strict message header for a method name of `name_len` bytes.
pub const fn message_header_len(name_len: usize) -> usize {
    4 + 4 + name_len + 4
}

/// Writes binary-protocol values at the cursor of a [`GrowableBuffer`].
pub struct ProtocolWriter<'a> {
    buf: &'a mut GrowableBuffer,
}

impl<'a> ProtocolWriter<'a> {
    pub fn new(buf: &'a mut GrowableBuffer) -> Self {
        Self { buf }
    }

    /// Current cursor of the underlying buffer.
    #[inline]
    pub fn position(&self) -> usize {
        self.buf.position()
    }

    pub fn write_message_begin(&mut self, name: &str, kind: MessageType, seq_id: i32) {
        self.write_u32(VERSION_1 | kind as u32);
        self.write_string(name);
        self.write_i32(seq_id);
    }

    #[inline]
    pub fn write_field_begin(&mut self, field: Field) {
        self.write_byte(field.ttype as u8);
        self.write_i16(field.id);
    }

    #[inline]
    pub fn write_field_stop(&mut self) {
        self.write_byte(TType::Stop as u8);
    }

    /// # Panics
    ///
    /// Panics if `len` does not fit the protocol's i32 size field.
    pub fn write_list_begin(&mut self, element: TType, len: usize) {
        let len = i32::try_from(len).expect("thrift list length exceeds i32::MAX");
        self.write_byte(element as u8);
        self.write_i32(len);
    }

    #[inline]
    pub fn write_bool(&mut self, v: bool) {
        self.write_byte(u8::from(v));
    }

    #[inline]
    pub fn write_byte(&mut self, v: u8) {
        self.buf.put(&[v]);
    }

    #[inline]
    pub fn write_i16(&mut self, v: i16) {
        self.buf.put(&v.to_be_bytes());
    }

    #[inline]
    pub fn write_i32(&mut self, v: i32) {
        self.buf.put(&v.to_be_bytes());
    }

    #[inline]
    fn write_u32(&mut self, v: u32) {
        self.buf.put(&v.to_be_bytes());
    }

    #[inline]
    pub fn write_i64(&mut self, v: i64) {
        self.buf.put(&v.to_be_bytes());
    }

    #[inline]
    pub fn write_double(&mut self, v: f64) {
        self.buf.put(&v.to_bits().to_be_bytes());
    }

    #[inline]
    pub fn write_string(&mut self, v: &str) {
        self.write_binary(v.as_bytes());
    }

    /// # Panics
    ///
    /// Panics if `v` is longer than `i32::MAX` bytes.
    pub fn write_binary(&mut self, v: &[u8]) {
        let len = i32::try_from(v.len()).expect("thrift binary length exceeds i32::MAX");
        self.write_i32(len);
        self.buf.put(v);
    }

    /// Copies already-encoded bytes verbatim.
    #[inline]
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put(bytes);
    }
}
