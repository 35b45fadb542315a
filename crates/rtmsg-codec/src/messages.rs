//! Typed messages exchanged with the notification endpoint.
//!
//! Client → server: [`AuthenticationRequest`] (always the first frame on a new
//! socket) and [`PingRequest`].
//!
//! Server → client: [`NotificationEnvelope`], a union in which exactly one of
//! the optional members is populated.

use std::time::Duration;

use serde::Serialize;

use rtmsg_core::prelude::*;

use crate::wire::{FieldHeader, FieldType, WireReader, WireStruct, WireWriter};

/// Method names carried in the message header.
pub mod method {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const PING: &str = "ping";
    pub const NOTIFY: &str = "notify";
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthenticationRequest {
    pub auth_token: String,
}

impl WireStruct for AuthenticationRequest {
    fn write_fields(&self, w: &mut WireWriter<'_>) {
        w.write_string(1, &self.auth_token);
    }

    fn read_field(&mut self, field: FieldHeader, r: &mut WireReader<'_>) -> Result<()> {
        match (field.id, field.field_type) {
            (1, FieldType::String) => self.auth_token = r.read_string()?,
            _ => r.skip(field.field_type)?,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PingRequest {
    pub sent_at_millis: i64,
}

impl WireStruct for PingRequest {
    fn write_fields(&self, w: &mut WireWriter<'_>) {
        w.write_i64(1, self.sent_at_millis);
    }

    fn read_field(&mut self, field: FieldHeader, r: &mut WireReader<'_>) -> Result<()> {
        match (field.id, field.field_type) {
            (1, FieldType::I64) => self.sent_at_millis = r.read_i64()?,
            _ => r.skip(field.field_type)?,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// Outcome of the authentication handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResult {
    pub authenticated: bool,
    /// Server-advertised keep-alive period, in seconds. Zero or negative
    /// means the server does not want pings.
    pub ping_frequency_secs: i32,
    pub user_id: i32,
}

impl AuthenticationResult {
    /// Keep-alive period, or `None` when pings are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        u64::try_from(self.ping_frequency_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl WireStruct for AuthenticationResult {
    fn write_fields(&self, w: &mut WireWriter<'_>) {
        w.write_bool(1, self.authenticated);
        w.write_i32(2, self.ping_frequency_secs);
        w.write_i32(3, self.user_id);
    }

    fn read_field(&mut self, field: FieldHeader, r: &mut WireReader<'_>) -> Result<()> {
        match (field.id, field.field_type) {
            (1, FieldType::Bool) => self.authenticated = r.read_bool()?,
            (2, FieldType::I32) => self.ping_frequency_secs = r.read_i32()?,
            (3, FieldType::I32) => self.user_id = r.read_i32()?,
            _ => r.skip(field.field_type)?,
        }
        Ok(())
    }
}

/// A new message was posted to a thread the user participates in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNotification {
    pub thread_id: i64,
    pub message_id: i64,
    pub sender_id: i32,
    pub sent_at_millis: i64,
}

impl WireStruct for MessageNotification {
    fn write_fields(&self, w: &mut WireWriter<'_>) {
        w.write_i64(1, self.thread_id);
        w.write_i64(2, self.message_id);
        w.write_i32(3, self.sender_id);
        w.write_i64(4, self.sent_at_millis);
    }

    fn read_field(&mut self, field: FieldHeader, r: &mut WireReader<'_>) -> Result<()> {
        match (field.id, field.field_type) {
            (1, FieldType::I64) => self.thread_id = r.read_i64()?,
            (2, FieldType::I64) => self.message_id = r.read_i64()?,
            (3, FieldType::I32) => self.sender_id = r.read_i32()?,
            (4, FieldType::I64) => self.sent_at_millis = r.read_i64()?,
            _ => r.skip(field.field_type)?,
        }
        Ok(())
    }
}

/// Server-initiated liveness probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub sent_at_millis: i64,
}

impl WireStruct for Ping {
    fn write_fields(&self, w: &mut WireWriter<'_>) {
        w.write_i64(1, self.sent_at_millis);
    }

    fn read_field(&mut self, field: FieldHeader, r: &mut WireReader<'_>) -> Result<()> {
        match (field.id, field.field_type) {
            (1, FieldType::I64) => self.sent_at_millis = r.read_i64()?,
            _ => r.skip(field.field_type)?,
        }
        Ok(())
    }
}

/// Discriminated union of everything the server pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_result: Option<AuthenticationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_notification: Option<MessageNotification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<Ping>,
}

/// Borrowed view of the single populated member of a [`NotificationEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeVariant<'a> {
    AuthenticationResult(&'a AuthenticationResult),
    MessageNotification(&'a MessageNotification),
    Ping(&'a Ping),
}

impl NotificationEnvelope {
    pub fn authentication(result: AuthenticationResult) -> Self {
        Self {
            authentication_result: Some(result),
            ..Self::default()
        }
    }

    pub fn notification(notification: MessageNotification) -> Self {
        Self {
            message_notification: Some(notification),
            ..Self::default()
        }
    }

    pub fn ping(ping: Ping) -> Self {
        Self {
            ping: Some(ping),
            ..Self::default()
        }
    }

    /// Number of populated members.
    pub fn populated(&self) -> usize {
        usize::from(self.authentication_result.is_some())
            + usize::from(self.message_notification.is_some())
            + usize::from(self.ping.is_some())
    }

    /// Return the populated member.
    ///
    /// # Errors
    ///
    /// [`Error::Envelope`] when zero or more than one member is populated.
    pub fn variant(&self) -> Result<EnvelopeVariant<'_>> {
        match (
            &self.authentication_result,
            &self.message_notification,
            &self.ping,
        ) {
            (Some(auth), None, None) => Ok(EnvelopeVariant::AuthenticationResult(auth)),
            (None, Some(note), None) => Ok(EnvelopeVariant::MessageNotification(note)),
            (None, None, Some(ping)) => Ok(EnvelopeVariant::Ping(ping)),
            _ => Err(Error::Envelope {
                populated: self.populated(),
            }),
        }
    }
}

impl WireStruct for NotificationEnvelope {
    fn write_fields(&self, w: &mut WireWriter<'_>) {
        if let Some(auth) = &self.authentication_result {
            w.write_struct(1, auth);
        }
        if let Some(note) = &self.message_notification {
            w.write_struct(2, note);
        }
        if let Some(ping) = &self.ping {
            w.write_struct(3, ping);
        }
    }

    fn read_field(&mut self, field: FieldHeader, r: &mut WireReader<'_>) -> Result<()> {
        match (field.id, field.field_type) {
            (1, FieldType::Struct) => self.authentication_result = Some(r.read_struct()?),
            (2, FieldType::Struct) => self.message_notification = Some(r.read_struct()?),
            (3, FieldType::Struct) => self.ping = Some(r.read_struct()?),
            _ => r.skip(field.field_type)?,
        }
        Ok(())
    }
}
