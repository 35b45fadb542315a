//! Public handle and the per-context driver task.
//!
//! [`RealTimeService::start`] spawns one task that owns the [`ServiceCore`]
//! and runs a `select!` loop over public commands, shared-store changes,
//! socket events and the earliest pending timer. All state transitions happen
//! on that task, one input at a time.

use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use rtmsg_core::prelude::*;

use crate::channel::TopicHandler;
use crate::clock::{Clock, ContextId};
use crate::handlers::Handlers;
use crate::lifecycle::{ConnectionState, ServiceConfig, ServiceCore, ServiceStatus};
use crate::store::{ChangeReceiver, SharedStore};
use crate::transport::{Connector, SocketEvent};

enum ServiceCommand {
    Connect,
    Publish { topic: String, payload: String },
    Subscribe { topic: String, handler: TopicHandler },
    Close { done: oneshot::Sender<()> },
}

/// Handle to one running execution context.
///
/// Methods never fail: once the context is closed they become no-ops.
/// Dropping the handle closes the context.
pub struct RealTimeService {
    id: ContextId,
    cmd_tx: mpsc::UnboundedSender<ServiceCommand>,
    store: Arc<dyn SharedStore>,
    status: Arc<RwLock<ServiceStatus>>,
}

impl std::fmt::Debug for RealTimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealTimeService")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl RealTimeService {
    /// Build the context and spawn its driver. The context immediately
    /// contends for the lock and connects on acquisition.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if the configured host and shard do not form a
    /// valid URL.
    pub fn start(
        config: &ServiceConfig,
        handlers: Handlers,
        store: Arc<dyn SharedStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        Self::start_with_clock(config, handlers, store, connector, Clock::system())
    }

    /// Like [`RealTimeService::start`], with an explicit source for lease
    /// timestamps. Tests on the paused tokio clock pass [`Clock::anchored`].
    pub fn start_with_clock(
        config: &ServiceConfig,
        handlers: Handlers,
        store: Arc<dyn SharedStore>,
        connector: Arc<dyn Connector>,
        clock: Clock,
    ) -> Result<Self> {
        let id = ContextId::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let store_rx = store.subscribe();

        let mut core = ServiceCore::new(
            id,
            config,
            handlers,
            Arc::clone(&store),
            connector,
            clock,
            events_tx,
        )?;
        core.start(Instant::now());

        let status = Arc::new(RwLock::new(core.status()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_service(
            core,
            cmd_rx,
            store_rx,
            events_rx,
            Arc::clone(&status),
        ));

        Ok(Self {
            id,
            cmd_tx,
            store,
            status,
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.id
    }

    /// Connect if this context holds the lock, otherwise ask the holder to.
    pub fn connect(&self) {
        self.send(ServiceCommand::Connect);
    }

    /// Close the socket, release the lock and stop the driver. Further calls
    /// return immediately.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(ServiceCommand::Close { done: done_tx }).is_err() {
            return;
        }
        if done_rx.await.is_err() {
            debug!(
                "Context {} driver ended before confirming close: {}",
                self.id,
                Error::ChannelClosed
            );
        }
    }

    pub fn publish(&self, topic: &str, payload: &str) {
        self.send(ServiceCommand::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    pub fn subscribe(&self, topic: &str, handler: impl FnMut(&str) + Send + 'static) {
        self.send(ServiceCommand::Subscribe {
            topic: topic.to_string(),
            handler: Box::new(handler),
        });
    }

    /// Last value published on `topic`.
    pub fn peek(&self, topic: &str) -> Option<String> {
        self.store.get(&crate::channel::topic_key(topic))
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    pub fn holds_lock(&self) -> bool {
        self.status().holds_lock
    }

    pub fn is_closed(&self) -> bool {
        self.status().closed
    }

    fn send(&self, command: ServiceCommand) {
        if self.cmd_tx.send(command).is_err() {
            debug!("Context {} is closed; command dropped", self.id);
        }
    }
}

async fn run_service(
    mut core: ServiceCore,
    mut cmd_rx: mpsc::UnboundedReceiver<ServiceCommand>,
    mut store_rx: ChangeReceiver,
    mut events_rx: mpsc::UnboundedReceiver<SocketEvent>,
    status: Arc<RwLock<ServiceStatus>>,
) {
    debug!("Driver for {} started", core.id());

    loop {
        let deadline = core.next_deadline();

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ServiceCommand::Connect) => core.connect(Instant::now()),
                    Some(ServiceCommand::Publish { topic, payload }) => {
                        core.publish(&topic, &payload);
                    }
                    Some(ServiceCommand::Subscribe { topic, handler }) => {
                        core.subscribe(&topic, handler);
                    }
                    Some(ServiceCommand::Close { done }) => {
                        core.close();
                        publish_status(&status, &core);
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        debug!("Handle for {} dropped; closing", core.id());
                        core.close();
                        publish_status(&status, &core);
                        break;
                    }
                }
            }

            Some(change) = store_rx.recv() => {
                core.on_store_change(&change, Instant::now());
            }

            Some(event) = events_rx.recv() => {
                core.on_socket_event(event, Instant::now());
            }

            () = sleep_until(deadline) => {
                core.poll_timers(Instant::now());
            }
        }

        publish_status(&status, &core);
    }

    debug!("Driver for {} exiting", core.id());
}

fn publish_status(status: &RwLock<ServiceStatus>, core: &ServiceCore) {
    *status.write().unwrap_or_else(|e| e.into_inner()) = core.status();
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TOPIC_NOTIFICATION;
    use crate::close::CLOSE_NORMAL;
    use crate::lock::LOCK_KEY;
    use crate::store::MemoryStore;
    use crate::test_utils::{auth_frame, MockConnector};
    use crate::transport::TransportCommand;
    use std::sync::Mutex;
    use std::time::Duration;

    fn start(backing: &MemoryStore, connector: &MockConnector) -> RealTimeService {
        RealTimeService::start_with_clock(
            &ServiceConfig::new("push.example.com", "s1"),
            Handlers::new(),
            Arc::new(backing.attach()),
            Arc::new(connector.clone()),
            Clock::anchored(Instant::now(), 1_700_000_000_000),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_context_connects_after_jitter() {
        let backing = MemoryStore::new();
        let connector = MockConnector::new();
        let service = start(&backing, &connector);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(service.holds_lock());
        assert_eq!(service.connection_state(), ConnectionState::Connecting);
        assert_eq!(connector.connect_count(), 1);

        connector.socket(0).open();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(service.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_terminal() {
        let backing = MemoryStore::new();
        let connector = MockConnector::new();
        let service = start(&backing, &connector);
        tokio::time::sleep(Duration::from_millis(300)).await;
        connector.socket(0).open();
        tokio::time::sleep(Duration::from_millis(10)).await;

        service.close().await;
        service.close().await;

        assert!(service.is_closed());
        assert!(!service.holds_lock());
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);
        assert!(backing.attach().get(LOCK_KEY).is_none());

        let sent = connector.socket(0).sent();
        assert_eq!(
            sent.last(),
            Some(&TransportCommand::Close {
                code: CLOSE_NORMAL,
                reason: String::new(),
            })
        );

        // Nothing is scheduled after close
        service.connect();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_publish_between_contexts() {
        let backing = MemoryStore::new();
        let connector = MockConnector::new();
        let a = start(&backing, &connector);
        let b = start(&backing, &connector);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        b.subscribe("app.topic", move |payload| {
            sink.lock().unwrap().push(payload.to_string())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        a.publish("app.topic", "hello");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(b.peek("app.topic").as_deref(), Some("hello"));

        a.close().await;
        b.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_holder_relays_frames() {
        let backing = MemoryStore::new();
        let connector = MockConnector::new();
        let service = start(&backing, &connector);
        tokio::time::sleep(Duration::from_millis(300)).await;
        connector.socket(0).open();
        connector.socket(0).message(auth_frame(30));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(service.peek(TOPIC_NOTIFICATION).is_some());
        service.close().await;
    }
}
