//! Test helpers: a scripted connector and frame builders.
//!
//! Available under `cfg(test)` and the `test-helpers` feature so the root
//! integration tests can drive services without a network.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

use rtmsg_codec::{
    method, AuthenticationResult, BinaryCodec, MessageKind, MessageNotification,
    NotificationEnvelope, Ping,
};

use crate::transport::{
    Connector, SocketCommands, SocketEvent, SocketEvents, TransportCommand, TransportEvent,
};

/// Connector that records every socket instead of opening one.
#[derive(Clone, Default)]
pub struct MockConnector {
    sockets: Arc<Mutex<Vec<MockSocket>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    /// The `index`-th socket opened through this connector.
    pub fn socket(&self, index: usize) -> MockSocket {
        self.sockets.lock().unwrap()[index].clone()
    }

    pub fn last_socket(&self) -> MockSocket {
        self.sockets
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no socket has been opened")
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &Url, generation: u64, events: SocketEvents) -> SocketCommands {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.sockets.lock().unwrap().push(MockSocket {
            url: url.clone(),
            generation,
            events,
            commands: Arc::new(Mutex::new(cmd_rx)),
        });
        cmd_tx
    }
}

/// The server end of a recorded socket.
#[derive(Clone)]
pub struct MockSocket {
    pub url: Url,
    pub generation: u64,
    events: SocketEvents,
    commands: Arc<Mutex<mpsc::UnboundedReceiver<TransportCommand>>>,
}

impl MockSocket {
    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn message(&self, frame: Bytes) {
        self.emit(TransportEvent::Message(frame));
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.emit(TransportEvent::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Drain the commands the service sent since the last call.
    pub fn sent(&self) -> Vec<TransportCommand> {
        let mut rx = self.commands.lock().unwrap();
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(SocketEvent {
            generation: self.generation,
            event,
        });
    }
}

fn envelope_frame(envelope: &NotificationEnvelope) -> Bytes {
    BinaryCodec::new().encode(MessageKind::Oneway, method::NOTIFY, envelope)
}

pub fn auth_frame(ping_frequency_secs: i32) -> Bytes {
    envelope_frame(&NotificationEnvelope::authentication(AuthenticationResult {
        authenticated: true,
        ping_frequency_secs,
        user_id: 1,
    }))
}

pub fn notification_frame(notification: MessageNotification) -> Bytes {
    envelope_frame(&NotificationEnvelope::notification(notification))
}

pub fn ping_frame() -> Bytes {
    envelope_frame(&NotificationEnvelope::ping(Ping { sent_at_millis: 0 }))
}

pub fn empty_envelope_frame() -> Bytes {
    envelope_frame(&NotificationEnvelope::default())
}
