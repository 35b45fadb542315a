//! Cross-context publish/subscribe over the shared store.
//!
//! A topic maps to one store key. Publishing clears the key and then writes
//! the payload: the store only notifies on value transitions, so without the
//! clear a repeated payload would go unnoticed. The clear itself shows up as
//! a change with no new value and is filtered out here.

use std::collections::HashMap;
use std::sync::Arc;

use rtmsg_core::prelude::*;

use crate::handlers::guarded;
use crate::store::{SharedStore, StoreChange};

/// Prefix of every key owned by the channel.
pub const KEY_PREFIX: &str = "rtmsg.queue.";

/// Lock holder liveness broadcast.
pub const TOPIC_HEARTBEAT: &str = "rtmsg.heartbeat";
/// Base64 copy of every frame the holder receives.
pub const TOPIC_NOTIFICATION: &str = "rtmsg.notification";
/// A non-holder asking the holder to connect.
pub const TOPIC_CONNECT: &str = "rtmsg.connect";

pub type TopicHandler = Box<dyn FnMut(&str) + Send>;

/// Store key backing `topic`.
pub fn topic_key(topic: &str) -> String {
    format!("{KEY_PREFIX}{topic}")
}

/// A message delivered through the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub topic: String,
    pub payload: String,
}

pub struct CrossTabChannel {
    store: Arc<dyn SharedStore>,
    subscribers: HashMap<String, Vec<TopicHandler>>,
}

impl std::fmt::Debug for CrossTabChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .subscribers
            .iter()
            .map(|(topic, handlers)| (topic.as_str(), handlers.len()))
            .collect();
        f.debug_struct("CrossTabChannel")
            .field("subscribers", &counts)
            .finish()
    }
}

impl CrossTabChannel {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            subscribers: HashMap::new(),
        }
    }

    /// Broadcast `payload` to every other context. Store failures are logged.
    pub fn publish(&self, topic: &str, payload: &str) {
        let key = topic_key(topic);
        let result = self
            .store
            .remove(&key)
            .and_then(|()| self.store.set(&key, payload));
        if let Err(e) = result {
            warn!("Failed to publish on '{}': {}", topic, e);
        }
    }

    /// Register `handler` for `topic`. Handlers run in registration order.
    pub fn subscribe(&mut self, topic: &str, handler: TopicHandler) {
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    /// Last value published on `topic`, without subscribing.
    pub fn peek(&self, topic: &str) -> Option<String> {
        self.store.get(&topic_key(topic))
    }

    /// Turn a store change into a channel message, running the topic's
    /// subscribers. Returns `None` for foreign keys and for clears.
    pub fn route(&mut self, change: &StoreChange) -> Option<ChannelMessage> {
        let topic = change.key.strip_prefix(KEY_PREFIX)?;
        let payload = change.new_value.as_deref()?;

        if let Some(handlers) = self.subscribers.get_mut(topic) {
            for handler in handlers.iter_mut() {
                guarded("channel subscriber", || handler(payload));
            }
        }

        Some(ChannelMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })
    }
}
