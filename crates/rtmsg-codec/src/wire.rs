//! Low-level binary framing: message header, tagged fields, primitive values.
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────┬──────────────────────────────┐
//! │ u32 version  │ u32 len, name │ i32 seq  │ fields … STOP                │
//! │ 0x8001_00kk  │ UTF-8 bytes   │          │ (u8 type, i16 id, value)     │
//! └──────────────┴───────────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! All integers are big-endian. Strings are a `u32` byte length followed by
//! UTF-8. Nested structs use the same field layout and end with their own STOP.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use rtmsg_core::prelude::*;

/// Version word carried in the high 16 bits of the first header integer.
pub const VERSION_1: u32 = 0x8001_0000;

const VERSION_MASK: u32 = 0xffff_0000;

/// Nesting limit for structs, guards against hostile frames.
const MAX_STRUCT_DEPTH: usize = 16;

/// Upper bound on a single string, guards against bogus length prefixes.
const MAX_STRING_LEN: usize = 1 << 20;

/// Kind of message carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Call,
    Reply,
    Exception,
    Oneway,
}

impl MessageKind {
    fn to_byte(self) -> u8 {
        match self {
            MessageKind::Call => 1,
            MessageKind::Reply => 2,
            MessageKind::Exception => 3,
            MessageKind::Oneway => 4,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageKind::Call),
            2 => Some(MessageKind::Reply),
            3 => Some(MessageKind::Exception),
            4 => Some(MessageKind::Oneway),
            _ => None,
        }
    }
}

/// Versioned message header preceding every body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub name: String,
    pub seq_id: i32,
}

/// Type tag of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    I32,
    I64,
    String,
    Struct,
}

impl FieldType {
    const STOP: u8 = 0;

    fn to_byte(self) -> u8 {
        match self {
            FieldType::Bool => 2,
            FieldType::I32 => 8,
            FieldType::I64 => 10,
            FieldType::String => 11,
            FieldType::Struct => 12,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            2 => Some(FieldType::Bool),
            8 => Some(FieldType::I32),
            10 => Some(FieldType::I64),
            11 => Some(FieldType::String),
            12 => Some(FieldType::Struct),
            _ => None,
        }
    }
}

/// Tag preceding each field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    pub field_type: FieldType,
    pub id: i16,
}

/// A typed struct that can be written to and read from the wire.
///
/// `read_field` is called once per field in arrival order; implementations
/// match on `(id, type)` and hand anything else to [`WireReader::skip`].
pub trait WireStruct: Default {
    fn write_fields(&self, w: &mut WireWriter<'_>);

    fn read_field(&mut self, field: FieldHeader, r: &mut WireReader<'_>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Appends header and fields to a caller-owned buffer.
pub struct WireWriter<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    pub fn write_header(&mut self, header: &MessageHeader) {
        self.buf.put_u32(VERSION_1 | u32::from(header.kind.to_byte()));
        self.put_string(&header.name);
        self.buf.put_i32(header.seq_id);
    }

    pub fn write_bool(&mut self, id: i16, value: bool) {
        self.put_field_header(FieldType::Bool, id);
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_i32(&mut self, id: i16, value: i32) {
        self.put_field_header(FieldType::I32, id);
        self.buf.put_i32(value);
    }

    pub fn write_i64(&mut self, id: i16, value: i64) {
        self.put_field_header(FieldType::I64, id);
        self.buf.put_i64(value);
    }

    pub fn write_string(&mut self, id: i16, value: &str) {
        self.put_field_header(FieldType::String, id);
        self.put_string(value);
    }

    pub fn write_struct<T: WireStruct>(&mut self, id: i16, value: &T) {
        self.put_field_header(FieldType::Struct, id);
        self.write_body(value);
    }

    /// Write `value`'s fields followed by the STOP marker.
    pub fn write_body<T: WireStruct>(&mut self, value: &T) {
        value.write_fields(self);
        self.buf.put_u8(FieldType::STOP);
    }

    fn put_field_header(&mut self, field_type: FieldType, id: i16) {
        self.buf.put_u8(field_type.to_byte());
        self.buf.put_i16(id);
    }

    fn put_string(&mut self, value: &str) {
        // MAX_STRING_LEN keeps real payloads far below u32::MAX
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over a received frame.
pub struct WireReader<'a> {
    buf: &'a [u8],
    depth: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, depth: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn read_header(&mut self) -> Result<MessageHeader> {
        let word = self.get_u32()?;
        if word & VERSION_MASK != VERSION_1 {
            return Err(Error::codec(format!("bad version word {word:#010x}")));
        }
        let kind = MessageKind::from_byte((word & 0xff) as u8)
            .ok_or_else(|| Error::codec(format!("unknown message kind {}", word & 0xff)))?;
        let name = self.get_string()?;
        let seq_id = self.get_i32()?;
        Ok(MessageHeader { kind, name, seq_id })
    }

    /// Read the next field tag, or `None` at the STOP marker.
    pub fn read_field_header(&mut self) -> Result<Option<FieldHeader>> {
        let byte = self.get_u8()?;
        if byte == FieldType::STOP {
            return Ok(None);
        }
        let field_type = FieldType::from_byte(byte)
            .ok_or_else(|| Error::codec(format!("unknown field type {byte}")))?;
        let id = self.get_i16()?;
        Ok(Some(FieldHeader { field_type, id }))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.get_i32()
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_string(&mut self) -> Result<String> {
        self.get_string()
    }

    /// Read fields until STOP into a fresh `T`.
    pub fn read_struct<T: WireStruct>(&mut self) -> Result<T> {
        if self.depth >= MAX_STRUCT_DEPTH {
            return Err(Error::codec("struct nesting too deep"));
        }
        self.depth += 1;
        let mut value = T::default();
        while let Some(field) = self.read_field_header()? {
            value.read_field(field, self)?;
        }
        self.depth -= 1;
        Ok(value)
    }

    /// Consume and discard one value of `field_type`.
    pub fn skip(&mut self, field_type: FieldType) -> Result<()> {
        match field_type {
            FieldType::Bool => self.advance(1),
            FieldType::I32 => self.advance(4),
            FieldType::I64 => self.advance(8),
            FieldType::String => {
                let len = self.get_u32()? as usize;
                self.advance(len)
            }
            FieldType::Struct => {
                if self.depth >= MAX_STRUCT_DEPTH {
                    return Err(Error::codec("struct nesting too deep"));
                }
                self.depth += 1;
                while let Some(field) = self.read_field_header()? {
                    self.skip(field.field_type)?;
                }
                self.depth -= 1;
                Ok(())
            }
        }
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::codec(format!(
                "truncated frame: need {} bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn advance(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn get_i16(&mut self) -> Result<i16> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    fn get_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn get_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(Error::codec(format!("string length {len} exceeds limit")));
        }
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        let value = std::str::from_utf8(head)
            .map_err(|e| Error::codec(format!("invalid UTF-8 in string: {e}")))?
            .to_string();
        self.buf = tail;
        Ok(value)
    }
}
