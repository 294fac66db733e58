//! The transport seam.
//!
//! The coordinator never talks to a broker directly.  It publishes and
//! subscribes through a [`Transport`]; the in-process
//! [`EventBus`][crate::bus::EventBus] is one implementation, an MQTT or
//! WebSocket adapter would be another.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use timberline_types::{Envelope, TimberError};

/// Every publish/subscribe backend must implement this trait.
///
/// # Contract
///
/// * `publish` – hands `payload` to every current subscriber of `topic` and
///   returns how many there were.  Zero subscribers is `Ok(0)`: publishing is
///   fire-and-forget and carries no delivery acknowledgement.
///
/// * `subscribe` – returns a live [`Subscription`] that yields every envelope
///   published to `topic` after the call.  Dropping the subscription
///   unsubscribes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<usize, TimberError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TimberError>;
}

/// A live subscription to a single topic.
pub struct Subscription {
    topic: String,
    stream: BoxStream<'static, Envelope>,
}

impl Subscription {
    /// Wrap any envelope stream as a subscription to `topic`.
    pub fn new(topic: impl Into<String>, stream: BoxStream<'static, Envelope>) -> Self {
        Self {
            topic: topic.into(),
            stream,
        }
    }

    /// Wait for the next envelope.
    ///
    /// Returns `None` once the transport has shut down.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.stream.next().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
