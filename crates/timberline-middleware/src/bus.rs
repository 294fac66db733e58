//! In-process, topic-addressed publish/subscribe bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Channels are created lazily, one per topic string, the first
//! time somebody subscribes.
//!
//! The bus is deliberately as weak as the brokers it stands in for: no
//! acknowledgement, no ordering across topics, and slow subscribers lose
//! messages (they log the lag and carry on).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::RwLock;
use timberline_types::{Envelope, TimberError};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::transport::{Subscription, Transport};

/// Default channel capacity (number of buffered envelopes per topic before
/// old ones are dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Shared event bus.  Clone it cheaply – all clones share the same topic
/// channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    capacity: usize,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl EventBus {
    /// Create a new bus with the given per-topic channel capacity.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish `payload` on `topic`.
    ///
    /// Returns the number of subscribers that were handed the envelope.
    /// Returns `Ok(0)` when nobody is listening on the topic (this is a
    /// normal condition, not an error).
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<usize, TimberError> {
        let envelope = Envelope::new(topic, payload);
        let channels = self.channels.read();
        let Some(sender) = channels.get(topic) else {
            trace!(topic, "publish with no channel");
            return Ok(0);
        };
        // SendError only means every receiver has been dropped.
        Ok(sender.send(envelope).unwrap_or(0))
    }

    /// Subscribe to `topic`.
    ///
    /// Only envelopes published after this call are delivered.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let receiver = self.sender_for(topic).subscribe();
        let name = topic.to_string();
        let stream = stream::unfold(receiver, move |mut rx| {
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(envelope) => return Some((envelope, rx)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Subscriber fell behind; log and continue.
                            warn!(topic = %name, lagged_by = n, "subscription lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Subscription::new(topic, stream.boxed())
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .read()
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drop every topic channel.  Existing subscriptions drain what is
    /// already buffered and then yield `None`.
    pub fn shutdown(&self) {
        self.channels.write().clear();
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Envelope> {
        if let Some(sender) = self.channels.read().get(topic) {
            return sender.clone();
        }
        self.channels
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Transport for EventBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<usize, TimberError> {
        EventBus::publish(self, topic, payload)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TimberError> {
        Ok(EventBus::subscribe(self, topic))
    }
}
