//! # rtmsg-codec - Binary Envelope Codec
//!
//! Encodes typed request/notification envelopes to byte frames and back. The
//! client only relies on [`BinaryCodec::encode`] / [`BinaryCodec::decode`] and
//! on [`NotificationEnvelope::variant`] for the exactly-one-member check.
//!
//! ## Modules
//!
//! - [`wire`] — header, field tags and the bounds-checked reader/writer.
//! - [`messages`] — authentication, ping and notification message types.
//! - [`codec`] — [`BinaryCodec`] with its reusable scratch buffer.

pub mod codec;
pub mod messages;
pub mod wire;

pub use codec::BinaryCodec;
pub use messages::{
    method, AuthenticationRequest, AuthenticationResult, EnvelopeVariant, MessageNotification,
    NotificationEnvelope, Ping, PingRequest,
};
pub use wire::{
    FieldHeader, FieldType, MessageHeader, MessageKind, WireReader, WireStruct, WireWriter,
};
