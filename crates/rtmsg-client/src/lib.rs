//! # rtmsg-client - Cross-Context Notification Client
//!
//! One logical WebSocket connection to a push-notification endpoint, shared
//! by any number of execution contexts through a common key/value store.
//! Exactly one context (the lock holder) owns the socket; it relays every
//! frame to the others over the cross-context channel.
//!
//! ## Components
//!
//! - [`store`] / [`file_store`] - shared store trait, in-process and
//!   directory-backed implementations
//! - [`channel`] - topic publish/subscribe on top of the store
//! - [`lock`] - lease-based leader election with heartbeats
//! - [`lifecycle`] - connection state machine, reconnect, dispatch
//! - [`keepalive`] - ping/pong watchdog and sleep/wake sweep
//! - [`service`] - [`RealTimeService`] handle and its driver task
//! - [`transport`] - socket boundary and the `tokio-tungstenite` connector
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtmsg_client::{Handlers, MemoryStore, RealTimeService, ServiceConfig, WsConnector};
//!
//! # async fn run() -> rtmsg_core::Result<()> {
//! let handlers = Handlers::new().on_notification(|note| println!("{note:?}"));
//! let service = RealTimeService::start(
//!     &ServiceConfig::new("push.example.com", "7"),
//!     handlers,
//!     Arc::new(MemoryStore::new().attach()),
//!     Arc::new(WsConnector),
//! )?;
//! // ...
//! service.close().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod clock;
pub mod close;
pub mod counter;
pub mod file_store;
pub mod handlers;
pub mod keepalive;
pub mod lifecycle;
pub mod lock;
pub mod service;
pub mod store;
pub mod transport;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use channel::{CrossTabChannel, TOPIC_CONNECT, TOPIC_HEARTBEAT, TOPIC_NOTIFICATION};
pub use clock::{Clock, ContextId};
pub use close::{classify_close, CloseDisposition};
pub use counter::ReconnectCounter;
pub use file_store::FileStore;
pub use handlers::Handlers;
pub use keepalive::{KeepAlive, KeepAliveAction};
pub use lifecycle::{ConnectionState, ServiceConfig, ServiceCore, ServiceStatus};
pub use lock::{LockManager, LockRecord, LockState};
pub use service::RealTimeService;
pub use store::{open_store, MemoryStore, MemoryStoreHandle, SharedStore, StoreChange};
pub use transport::{build_url, Connector, TransportCommand, TransportEvent, WsConnector};
