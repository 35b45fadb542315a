//! Encode/decode entry points with a reusable scratch buffer.

use bytes::{Bytes, BytesMut};

use rtmsg_core::prelude::*;

use crate::wire::{MessageHeader, MessageKind, WireReader, WireStruct, WireWriter};

const INITIAL_CAPACITY: usize = 1024;

/// Binary envelope codec.
///
/// The scratch buffer is reused across calls and is emptied after every
/// encode and decode attempt, whether it succeeded or not, so a malformed
/// frame never leaks state into the next call.
#[derive(Debug)]
pub struct BinaryCodec {
    buffer: BytesMut,
    next_seq_id: i32,
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            next_seq_id: 1,
        }
    }

    /// Encode `value` as a `kind` message named `name`, assigning the next
    /// sequence id.
    pub fn encode<T: WireStruct>(&mut self, kind: MessageKind, name: &str, value: &T) -> Bytes {
        let seq_id = self.next_seq_id;
        self.next_seq_id = self.next_seq_id.wrapping_add(1);
        self.encode_with_seq(
            &MessageHeader {
                kind,
                name: name.to_string(),
                seq_id,
            },
            value,
        )
    }

    /// Encode `value` under an explicit header.
    pub fn encode_with_seq<T: WireStruct>(&mut self, header: &MessageHeader, value: &T) -> Bytes {
        {
            let mut writer = WireWriter::new(&mut self.buffer);
            writer.write_header(header);
            writer.write_body(value);
        }
        let frame = self.buffer.split().freeze();
        self.buffer.clear();
        frame
    }

    /// Decode a whole frame into its header and typed body.
    ///
    /// # Errors
    ///
    /// [`Error::Codec`] for truncated or malformed frames. The error is logged
    /// here and returned to the caller.
    pub fn decode<T: WireStruct>(&mut self, frame: &[u8]) -> Result<(MessageHeader, T)> {
        self.buffer.extend_from_slice(frame);
        let result = decode_frame(&self.buffer);
        self.buffer.clear();

        if let Err(ref err) = result {
            warn!("Failed to decode {}-byte frame: {}", frame.len(), err);
        }
        result
    }

    /// Bytes currently held in the scratch buffer (always zero between calls).
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_frame<T: WireStruct>(frame: &[u8]) -> Result<(MessageHeader, T)> {
    let mut reader = WireReader::new(frame);
    let header = reader.read_header()?;
    let body = reader.read_struct()?;
    if reader.remaining() > 0 {
        trace!(
            "Ignoring {} trailing bytes after '{}' body",
            reader.remaining(),
            header.name
        );
    }
    Ok((header, body))
}
