//! Connection lifecycle: the per-context state machine.
//!
//! [`ServiceCore`] owns every component of one execution context and reacts
//! to four kinds of input: public commands, shared-store changes, socket
//! events and timer expiry. It never awaits; the async driver in
//! [`crate::service`] feeds it inputs and sleeps until
//! [`ServiceCore::next_deadline`].
//!
//! ```text
//!   Disconnected ──connect()──► Connecting ──Open──► Open
//!        ▲                        ▲    │               │
//!        │ terminal / replaced    │    └─recoverable───┤
//!        └────────────────────────┴──── close ◄────────┘
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::time::Instant;
use url::Url;

use rtmsg_codec::{
    method, AuthenticationRequest, BinaryCodec, EnvelopeVariant, MessageKind,
    NotificationEnvelope, PingRequest,
};
use rtmsg_core::prelude::*;
use rtmsg_core::{KeepAliveSettings, LockSettings, ReconnectSettings, Settings};

use crate::channel::{
    CrossTabChannel, TopicHandler, TOPIC_CONNECT, TOPIC_HEARTBEAT, TOPIC_NOTIFICATION,
};
use crate::clock::{Clock, ContextId};
use crate::close::{
    classify_close, CloseDisposition, CLOSE_NORMAL, CLOSE_PONG_TIMEOUT, PONG_TIMEOUT_REASON,
};
use crate::counter::ReconnectCounter;
use crate::handlers::Handlers;
use crate::keepalive::{KeepAlive, KeepAliveAction};
use crate::lock::{LockEvent, LockManager};
use crate::store::{SharedStore, StoreChange};
use crate::transport::{
    build_url, Connector, SocketCommands, SocketEvent, SocketEvents, TransportCommand,
    TransportEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    /// Close frame sent, waiting for the transport to confirm.
    Closing,
}

/// Everything the service needs at construction, besides handlers.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host_name: String,
    pub shard_id: String,
    pub secure: bool,
    pub auth_token: String,
    pub lock: LockSettings,
    pub reconnect: ReconnectSettings,
    pub keepalive: KeepAliveSettings,
}

impl ServiceConfig {
    pub fn new(host_name: impl Into<String>, shard_id: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            shard_id: shard_id.into(),
            secure: true,
            auth_token: String::new(),
            lock: LockSettings::default(),
            reconnect: ReconnectSettings::default(),
            keepalive: KeepAliveSettings::default(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            host_name: settings.server.host_name.clone(),
            shard_id: settings.server.shard_id.clone(),
            secure: settings.server.secure,
            auth_token: settings.server.auth_token.clone().unwrap_or_default(),
            lock: settings.lock.clone(),
            reconnect: settings.reconnect.clone(),
            keepalive: settings.keepalive.clone(),
        }
    }

    pub fn url(&self) -> Result<Url> {
        build_url(&self.host_name, &self.shard_id, self.secure)
    }
}

/// Snapshot published to the public handle after every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceStatus {
    pub state: ConnectionState,
    pub holds_lock: bool,
    pub closed: bool,
}

pub struct ServiceCore {
    id: ContextId,
    url: Url,
    auth_token: String,
    clock: Clock,
    channel: CrossTabChannel,
    lock: LockManager,
    keepalive: KeepAlive,
    counter: ReconnectCounter,
    codec: BinaryCodec,
    handlers: Handlers,
    connector: Arc<dyn Connector>,
    socket_events: SocketEvents,
    socket: Option<SocketCommands>,
    generation: u64,
    state: ConnectionState,
    reconnect_at: Option<Instant>,
    closed: bool,
}

impl std::fmt::Debug for ServiceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCore")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("lock", &self.lock.state())
            .field("reconnect_at", &self.reconnect_at)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ServiceCore {
    /// # Errors
    ///
    /// Returns [`Error::Url`] if host and shard do not form a valid URL.
    pub fn new(
        id: ContextId,
        config: &ServiceConfig,
        handlers: Handlers,
        store: Arc<dyn SharedStore>,
        connector: Arc<dyn Connector>,
        clock: Clock,
        socket_events: SocketEvents,
    ) -> Result<Self> {
        let url = config.url()?;
        if !store.is_shared() {
            warn!("Store is private to this context; running without cross-context coordination");
        }
        Ok(Self {
            id,
            url,
            auth_token: config.auth_token.clone(),
            clock,
            channel: CrossTabChannel::new(Arc::clone(&store)),
            lock: LockManager::new(id, store, clock, config.lock.clone()),
            keepalive: KeepAlive::new(&config.keepalive),
            counter: ReconnectCounter::from_settings(&config.reconnect),
            codec: BinaryCodec::new(),
            handlers,
            connector,
            socket_events,
            socket: None,
            generation: 0,
            state: ConnectionState::Disconnected,
            reconnect_at: None,
            closed: false,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.holds_lock()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            state: self.state,
            holds_lock: self.lock.holds_lock(),
            closed: self.closed,
        }
    }

    /// First step after construction: contend for the lock.
    pub fn start(&mut self, now: Instant) {
        debug!("Context {} starting", self.id);
        self.lock.attempt_to_acquire(now);
    }

    // ─────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────

    /// Open the socket if this context holds the lock; otherwise ask the
    /// holder, if any, to connect.
    pub fn connect(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        if !self.lock.holds_lock() {
            debug!("Not the lock holder; asking the holder to connect");
            self.channel.publish(TOPIC_CONNECT, &self.id.to_string());
            return;
        }
        match self.state {
            ConnectionState::Disconnected => self.open_socket(now),
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing => {
                trace!("connect() ignored in state {:?}", self.state);
            }
        }
    }

    /// Shut everything down for good. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(socket) = self.socket.take() {
            self.state = ConnectionState::Closing;
            let _ = socket.send(TransportCommand::Close {
                code: CLOSE_NORMAL,
                reason: String::new(),
            });
        }
        // Anything the old socket still reports is stale from here on
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.reconnect_at = None;
        self.keepalive.reset();
        self.lock.release();
        info!("Context {} closed", self.id);
    }

    pub fn publish(&self, topic: &str, payload: &str) {
        self.channel.publish(topic, payload);
    }

    pub fn subscribe(&mut self, topic: &str, handler: TopicHandler) {
        self.channel.subscribe(topic, handler);
    }

    pub fn peek(&self, topic: &str) -> Option<String> {
        self.channel.peek(topic)
    }

    // ─────────────────────────────────────────────────────────
    // Inputs
    // ─────────────────────────────────────────────────────────

    pub fn on_socket_event(&mut self, event: SocketEvent, now: Instant) {
        if event.generation != self.generation || self.socket.is_none() {
            trace!("Dropping event from stale socket #{}", event.generation);
            return;
        }
        match event.event {
            TransportEvent::Open => self.on_open(now),
            TransportEvent::Message(frame) => self.on_frame(&frame, now),
            TransportEvent::Close { code, reason } => self.on_close(code, &reason, now),
        }
    }

    pub fn on_store_change(&mut self, change: &StoreChange, now: Instant) {
        let Some(message) = self.channel.route(change) else {
            return;
        };
        match message.topic.as_str() {
            TOPIC_HEARTBEAT => self.lock.on_heartbeat(now),
            TOPIC_NOTIFICATION => {
                if self.lock.holds_lock() {
                    return;
                }
                match BASE64.decode(message.payload.as_bytes()) {
                    Ok(frame) => {
                        if let Err(e) = self.dispatch(&frame, now, false) {
                            debug!("Ignoring relayed frame: {}", e);
                        }
                    }
                    Err(e) => warn!("Relayed notification is not valid base64: {}", e),
                }
            }
            TOPIC_CONNECT => {
                if self.lock.holds_lock() {
                    debug!("Connect requested by {}", message.payload);
                    self.connect(now);
                }
            }
            _ => {}
        }
    }

    /// Fire every timer whose deadline has passed.
    pub fn poll_timers(&mut self, now: Instant) {
        for event in self.lock.poll(now) {
            match event {
                LockEvent::Acquired => {
                    if !self.closed {
                        self.connect(now);
                    }
                }
                LockEvent::Heartbeat(heartbeat) => match serde_json::to_string(&heartbeat) {
                    Ok(payload) => self.channel.publish(TOPIC_HEARTBEAT, &payload),
                    Err(e) => warn!("Failed to encode heartbeat: {}", e),
                },
            }
        }

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            if self.lock.holds_lock() && !self.closed {
                debug!("Reconnecting (attempt after {:?})", self.counter.exponent());
                self.open_socket(now);
            } else {
                self.state = ConnectionState::Disconnected;
            }
        }

        let connected = self.state == ConnectionState::Open;
        for action in self.keepalive.poll(now, connected) {
            match action {
                KeepAliveAction::SendPing => self.send_ping(now),
                KeepAliveAction::PongTimeout => {
                    warn!("No frame received within the pong timeout; closing socket");
                    self.force_close(CLOSE_PONG_TIMEOUT, PONG_TIMEOUT_REASON);
                }
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.lock.next_deadline(),
            self.keepalive.next_deadline(),
            self.reconnect_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ─────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────

    fn open_socket(&mut self, now: Instant) {
        self.reconnect_at = None;
        self.generation += 1;
        info!("Opening socket #{} to {}", self.generation, self.url);
        self.socket = Some(
            self.connector
                .connect(&self.url, self.generation, self.socket_events.clone()),
        );
        self.state = ConnectionState::Connecting;
        trace!("Socket #{} requested at {:?}", self.generation, now);
    }

    fn on_open(&mut self, now: Instant) {
        info!("Socket #{} open", self.generation);
        self.state = ConnectionState::Open;
        self.counter.reset();
        self.keepalive.on_open(now);

        let request = AuthenticationRequest {
            auth_token: self.auth_token.clone(),
        };
        let frame = self
            .codec
            .encode(MessageKind::Call, method::AUTHENTICATE, &request);
        self.send(TransportCommand::Send(frame));
    }

    fn on_frame(&mut self, frame: &[u8], now: Instant) {
        self.keepalive.on_message_received(now);
        match self.dispatch(frame, now, true) {
            Ok(()) => self
                .channel
                .publish(TOPIC_NOTIFICATION, &BASE64.encode(frame)),
            Err(e) if e.is_recoverable() => debug!("Dropping undecodable frame: {}", e),
            Err(e) => warn!("Dropping frame: {}", e),
        }
    }

    /// Decode one frame and run the handler for its single populated member.
    ///
    /// Only a decode failure is an error; an envelope with zero or several
    /// members is logged and skipped.
    fn dispatch(&mut self, frame: &[u8], now: Instant, from_socket: bool) -> Result<()> {
        self.handlers.raw_notification(frame);

        let (_, envelope) = self.codec.decode::<NotificationEnvelope>(frame)?;
        match envelope.variant() {
            Ok(EnvelopeVariant::Ping(_)) => trace!("Server ping"),
            Ok(EnvelopeVariant::AuthenticationResult(result)) => {
                debug!(
                    "Authenticated={} ping every {}s",
                    result.authenticated, result.ping_frequency_secs
                );
                if from_socket {
                    self.keepalive.on_auth_result(result.ping_interval(), now);
                }
                self.handlers.auth(result);
            }
            Ok(EnvelopeVariant::MessageNotification(notification)) => {
                self.handlers.notification(notification);
            }
            Err(e) => warn!("Ignoring envelope: {}", e),
        }
        Ok(())
    }

    fn on_close(&mut self, code: u16, reason: &str, now: Instant) {
        self.socket = None;
        self.keepalive.reset();

        match classify_close(code, reason) {
            CloseDisposition::Reconnect if !self.closed => {
                let delay = self.counter.current();
                warn!(
                    "Socket #{} closed ({} {}), reconnecting in {:?}",
                    self.generation, code, reason, delay
                );
                self.state = ConnectionState::Connecting;
                self.reconnect_at = Some(now + delay);
                self.counter.increment();
            }
            CloseDisposition::Reconnect => {
                self.state = ConnectionState::Disconnected;
            }
            CloseDisposition::SessionReplaced => {
                info!("Session replaced by another connection; standing down");
                self.state = ConnectionState::Disconnected;
                self.reconnect_at = None;
                self.lock.relinquish(now);
            }
            CloseDisposition::Terminal => {
                error!(
                    "Socket #{} closed ({} {}); not reconnecting",
                    self.generation, code, reason
                );
                self.state = ConnectionState::Disconnected;
                self.reconnect_at = None;
                self.handlers.close(code, reason);
            }
        }
    }

    /// Ask the transport to close; the resulting close event drives the
    /// transition.
    fn force_close(&mut self, code: u16, reason: &str) {
        self.state = ConnectionState::Closing;
        self.send(TransportCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn send_ping(&mut self, now: Instant) {
        let request = PingRequest {
            sent_at_millis: self.clock.wall_millis(now),
        };
        let frame = self.codec.encode(MessageKind::Call, method::PING, &request);
        trace!("Sending ping");
        self.send(TransportCommand::Send(frame));
    }

    fn send(&mut self, command: TransportCommand) {
        let Some(socket) = self.socket.as_ref() else {
            debug!("No socket; dropping {:?}", command);
            return;
        };
        if socket.send(command).is_err() {
            debug!("Socket #{} task has gone away", self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::{CLOSE_ABNORMAL, SESSION_REPLACED_REASON};
    use crate::lock::LOCK_KEY;
    use crate::store::MemoryStore;
    use crate::test_utils::{
        auth_frame, empty_envelope_frame, notification_frame, ping_frame, MockConnector,
    };
    use rtmsg_codec::{AuthenticationResult, MessageNotification};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const SETTLE: Duration = Duration::from_millis(300);

    #[derive(Default)]
    struct Calls {
        auth: usize,
        notification: usize,
        raw: usize,
        close: Vec<(u16, String)>,
    }

    struct Harness {
        core: ServiceCore,
        events: mpsc::UnboundedReceiver<SocketEvent>,
        connector: MockConnector,
        calls: Arc<Mutex<Calls>>,
    }

    impl Harness {
        fn new(backing: &MemoryStore) -> Self {
            Self::with_handlers(backing, |calls| {
                let auth = Arc::clone(&calls);
                let notification = Arc::clone(&calls);
                let raw = Arc::clone(&calls);
                let close = calls;
                Handlers::new()
                    .on_auth(move |_: &AuthenticationResult| auth.lock().unwrap().auth += 1)
                    .on_notification(move |_: &MessageNotification| {
                        notification.lock().unwrap().notification += 1
                    })
                    .on_raw_notification(move |_: &[u8]| raw.lock().unwrap().raw += 1)
                    .on_close(move |code, reason| {
                        close.lock().unwrap().close.push((code, reason.to_string()))
                    })
            })
        }

        fn with_handlers(
            backing: &MemoryStore,
            build: impl FnOnce(Arc<Mutex<Calls>>) -> Handlers,
        ) -> Self {
            let calls = Arc::new(Mutex::new(Calls::default()));
            let connector = MockConnector::new();
            let (events_tx, events) = mpsc::unbounded_channel();
            let mut config = ServiceConfig::new("push.example.com", "s1");
            config.auth_token = "token".to_string();
            let core = ServiceCore::new(
                ContextId::new(),
                &config,
                build(Arc::clone(&calls)),
                Arc::new(backing.attach()),
                Arc::new(connector.clone()),
                Clock::anchored(Instant::now(), 1_700_000_000_000),
                events_tx,
            )
            .unwrap();
            Self {
                core,
                events,
                connector,
                calls,
            }
        }

        /// Start, win the lock and get an open socket.
        fn open(backing: &MemoryStore, t0: Instant) -> Self {
            let mut h = Self::new(backing);
            h.core.start(t0);
            h.core.poll_timers(t0 + SETTLE);
            assert!(h.core.holds_lock());
            assert_eq!(h.connector.connect_count(), 1);
            h.connector.socket(0).open();
            h.pump(t0 + SETTLE);
            assert!(h.core.is_connected());
            h
        }

        fn pump(&mut self, now: Instant) {
            while let Ok(event) = self.events.try_recv() {
                self.core.on_socket_event(event, now);
            }
        }
    }

    #[test]
    fn test_open_sends_authentication_first() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let h = Harness::open(&backing, t0);

        let sent = h.connector.socket(0).sent();
        assert_eq!(sent.len(), 1);
        let TransportCommand::Send(frame) = &sent[0] else {
            panic!("expected a frame, got {:?}", sent[0]);
        };
        let (header, request) = BinaryCodec::new()
            .decode::<AuthenticationRequest>(frame)
            .unwrap();
        assert_eq!(header.name, method::AUTHENTICATE);
        assert_eq!(request.auth_token, "token");
    }

    #[test]
    fn test_reconnect_backoff_schedule() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);

        let mut now = t0 + SETTLE;
        for (attempt, expected_ms) in [1000u64, 2000, 3000, 5000].into_iter().enumerate() {
            let socket = h.connector.last_socket();
            socket.close(CLOSE_ABNORMAL, "");
            h.pump(now);
            assert_eq!(h.core.state(), ConnectionState::Connecting);

            let delay = Duration::from_millis(expected_ms);
            h.core.poll_timers(now + delay - Duration::from_millis(1));
            assert_eq!(h.connector.connect_count(), attempt + 1);

            now += delay;
            h.core.poll_timers(now);
            assert_eq!(h.connector.connect_count(), attempt + 2);
        }

        // A successful open resets the schedule
        h.connector.last_socket().open();
        h.pump(now);
        h.connector.last_socket().close(CLOSE_ABNORMAL, "");
        h.pump(now);
        let before = h.connector.connect_count();
        h.core.poll_timers(now + Duration::from_millis(999));
        assert_eq!(h.connector.connect_count(), before);
        h.core.poll_timers(now + Duration::from_millis(1000));
        assert_eq!(h.connector.connect_count(), before + 1);
    }

    #[test]
    fn test_session_replaced_relinquishes_without_reconnect() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);

        h.connector
            .socket(0)
            .close(CLOSE_NORMAL, SESSION_REPLACED_REASON);
        h.pump(t0 + SETTLE);

        assert!(!h.core.holds_lock());
        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(backing.attach().get(LOCK_KEY).is_some());
        assert!(h.calls.lock().unwrap().close.is_empty());

        // Nothing is retried within the lease that follows
        for millis in (100..=2_900).step_by(100) {
            h.core.poll_timers(t0 + SETTLE + Duration::from_millis(millis));
        }
        assert_eq!(h.connector.connect_count(), 1);
        assert!(!h.core.holds_lock());
    }

    #[test]
    fn test_terminal_close_reports_once() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);

        h.connector.socket(0).close(CLOSE_NORMAL, "logged out");
        h.pump(t0 + SETTLE);

        assert_eq!(
            h.calls.lock().unwrap().close,
            vec![(CLOSE_NORMAL, "logged out".to_string())]
        );
        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(h.core.holds_lock());

        h.core.poll_timers(t0 + Duration::from_secs(120));
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[test]
    fn test_dispatch_exclusivity() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);
        let socket = h.connector.socket(0);

        socket.message(notification_frame(MessageNotification {
            thread_id: 1,
            message_id: 2,
            sender_id: 3,
            sent_at_millis: 4,
        }));
        h.pump(t0 + SETTLE);
        {
            let calls = h.calls.lock().unwrap();
            assert_eq!(calls.notification, 1);
            assert_eq!(calls.auth, 0);
            assert!(calls.close.is_empty());
        }

        socket.message(auth_frame(30));
        h.pump(t0 + SETTLE);
        {
            let calls = h.calls.lock().unwrap();
            assert_eq!(calls.notification, 1);
            assert_eq!(calls.auth, 1);
        }

        socket.message(ping_frame());
        h.pump(t0 + SETTLE);
        let calls = h.calls.lock().unwrap();
        assert_eq!((calls.auth, calls.notification), (1, 1));
        assert_eq!(calls.raw, 3);
    }

    #[test]
    fn test_empty_envelope_is_ignored() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);

        h.connector.socket(0).message(empty_envelope_frame());
        h.pump(t0 + SETTLE);

        let calls = h.calls.lock().unwrap();
        assert_eq!((calls.auth, calls.notification), (0, 0));
        assert!(h.core.is_connected());
    }

    #[test]
    fn test_garbage_frame_is_dropped() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);
        let observer = backing.attach();
        let mut observed = observer.subscribe();

        h.connector
            .socket(0)
            .message(bytes::Bytes::from_static(b"\x00\x01garbage"));
        h.pump(t0 + SETTLE);

        assert!(h.core.is_connected());
        let relayed = std::iter::from_fn(|| observed.try_recv().ok())
            .filter(|c| c.key.ends_with(TOPIC_NOTIFICATION) && c.new_value.is_some())
            .count();
        assert_eq!(relayed, 0);
    }

    #[test]
    fn test_handler_panic_still_relays() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::with_handlers(&backing, |_| {
            Handlers::new().on_notification(|_: &MessageNotification| panic!("handler failure"))
        });
        h.core.start(t0);
        h.core.poll_timers(t0 + SETTLE);
        h.connector.socket(0).open();
        h.pump(t0 + SETTLE);

        let observer = backing.attach();
        let mut observed = observer.subscribe();
        h.connector
            .socket(0)
            .message(notification_frame(MessageNotification::default()));
        h.pump(t0 + SETTLE);

        let relayed = std::iter::from_fn(|| observed.try_recv().ok())
            .filter(|c| c.key.ends_with(TOPIC_NOTIFICATION) && c.new_value.is_some())
            .count();
        assert_eq!(relayed, 1);
    }

    #[test]
    fn test_pong_timeout_forces_reconnect() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);
        let opened = t0 + SETTLE;

        h.connector.socket(0).message(auth_frame(30));
        h.pump(opened);

        // Heartbeats keep the lock; the ping goes out at +30s
        let mut now = opened;
        while now < opened + Duration::from_secs(30) {
            now += Duration::from_millis(500);
            h.core.poll_timers(now);
        }
        let sent = h.connector.socket(0).sent();
        let pings = sent
            .iter()
            .filter(|cmd| matches!(cmd, TransportCommand::Send(_)))
            .count();
        assert_eq!(pings, 2, "auth request plus one ping");

        // Silence until the pong deadline
        while now < opened + Duration::from_secs(45) {
            now += Duration::from_millis(500);
            h.core.poll_timers(now);
        }
        assert_eq!(h.core.state(), ConnectionState::Closing);
        let sent = h.connector.socket(0).sent();
        assert!(sent.contains(&TransportCommand::Close {
            code: CLOSE_PONG_TIMEOUT,
            reason: PONG_TIMEOUT_REASON.to_string(),
        }));

        // Some runtimes report the close as 1000; the reason still counts
        h.connector.socket(0).close(CLOSE_NORMAL, PONG_TIMEOUT_REASON);
        h.pump(now);
        assert_eq!(h.core.state(), ConnectionState::Connecting);
        h.core.poll_timers(now + Duration::from_secs(1));
        assert_eq!(h.connector.connect_count(), 2);
    }

    #[test]
    fn test_silent_socket_is_pinged_after_wake() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);
        let opened = t0 + SETTLE;

        h.connector.socket(0).message(auth_frame(30));
        h.pump(opened);
        assert_eq!(h.connector.socket(0).sent().len(), 1);

        // Suspended: no timer ran and nothing arrived for 60s (> 30s + 15s)
        let woke = opened + Duration::from_secs(60);
        h.core.poll_timers(woke);
        assert!(h.core.is_connected());

        let sent = h.connector.socket(0).sent();
        assert_eq!(sent.len(), 2, "auth request plus a single ping");
        let TransportCommand::Send(frame) = &sent[1] else {
            panic!("expected a ping frame, got {:?}", sent[1]);
        };
        let (header, _) = BinaryCodec::new().decode::<PingRequest>(frame).unwrap();
        assert_eq!(header.name, method::PING);

        // The ping armed the pong deadline; silence now forces a reconnect
        h.core.poll_timers(woke + Duration::from_secs(15));
        assert_eq!(h.core.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_close_is_idempotent_and_releases_lock() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);

        h.core.close();
        h.core.close();

        let closes = h
            .connector
            .socket(0)
            .sent()
            .into_iter()
            .filter(|cmd| matches!(cmd, TransportCommand::Close { .. }))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(!h.core.holds_lock());
        assert!(backing.attach().get(LOCK_KEY).is_none());
        assert_eq!(h.core.next_deadline(), None);

        // Late events from the closed socket change nothing
        h.connector.socket(0).close(CLOSE_ABNORMAL, "");
        h.pump(t0 + Duration::from_secs(1));
        h.core.connect(t0 + Duration::from_secs(1));
        assert_eq!(h.connector.connect_count(), 1);
        assert!(h.calls.lock().unwrap().close.is_empty());
    }

    #[test]
    fn test_stale_socket_events_ignored() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();
        let mut h = Harness::open(&backing, t0);

        h.connector.socket(0).close(CLOSE_ABNORMAL, "");
        h.pump(t0 + SETTLE);
        h.core.poll_timers(t0 + SETTLE + Duration::from_secs(1));
        assert_eq!(h.connector.connect_count(), 2);

        // The first socket speaks up again after being replaced
        h.connector.socket(0).open();
        h.pump(t0 + SETTLE + Duration::from_secs(1));
        assert_eq!(h.core.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_non_holder_connect_asks_holder() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();

        let mut holder = Harness::new(&backing);
        holder.core.start(t0);
        holder.core.poll_timers(t0 + SETTLE);
        assert!(holder.core.holds_lock());
        // Terminal close leaves the holder disconnected but holding the lock
        holder.connector.socket(0).open();
        holder.pump(t0 + SETTLE);
        holder.connector.socket(0).close(CLOSE_NORMAL, "bye");
        holder.pump(t0 + SETTLE);

        let mut follower = Harness::new(&backing);
        let observer = backing.attach();
        let mut holder_changes = observer.subscribe();
        follower.core.start(t0 + SETTLE);
        assert!(!follower.core.holds_lock());

        follower.core.connect(t0 + SETTLE);
        assert_eq!(follower.connector.connect_count(), 0);

        // Deliver what the follower published to the holder
        while let Ok(change) = holder_changes.try_recv() {
            holder.core.on_store_change(&change, t0 + SETTLE);
        }
        assert_eq!(holder.connector.connect_count(), 2);
    }

    #[test]
    fn test_follower_dispatches_relayed_notifications() {
        let t0 = Instant::now();
        let backing = MemoryStore::new();

        let mut follower = Harness::new(&backing);
        let mut holder = Harness::open(&backing, t0);
        follower.core.start(t0 + SETTLE);
        assert!(!follower.core.holds_lock());

        let follower_view = backing.attach();
        let mut relayed = follower_view.subscribe();

        holder
            .connector
            .socket(0)
            .message(notification_frame(MessageNotification::default()));
        holder.pump(t0 + SETTLE);

        while let Ok(change) = relayed.try_recv() {
            follower.core.on_store_change(&change, t0 + SETTLE);
        }
        let calls = follower.calls.lock().unwrap();
        assert_eq!(calls.notification, 1);
        assert_eq!(calls.raw, 1);
    }
}
