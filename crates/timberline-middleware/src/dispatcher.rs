//! [`CommandDispatcher`] – the outbound side of the protocol.
//!
//! All traffic the controller originates goes through here: step payloads
//! for the AR users, commands for the robot, the optional presence echo, and
//! direct messages on a user's own data topic.  Nothing else in the
//! workspace publishes to the bus except the mock observers.

use std::sync::Arc;

use serde::Serialize;
use timberline_types::{InterfaceMessage, RobotCommand, StepIndex, TimberError, UserId};
use tracing::debug;

use crate::topics::TopicNamespace;
use crate::transport::Transport;

/// Publishes outbound messages through a [`Transport`].
#[derive(Clone)]
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    topics: TopicNamespace,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn Transport>, topics: TopicNamespace) -> Self {
        Self { transport, topics }
    }

    pub fn topics(&self) -> &TopicNamespace {
        &self.topics
    }

    /// Publish the payload of wave `index` to every user on the interface
    /// topic, tagged with `index` so confirmations can be correlated.
    ///
    /// Returns the number of receivers the bus reported.
    pub async fn broadcast_step(
        &self,
        index: StepIndex,
        payload: serde_json::Value,
    ) -> Result<usize, TimberError> {
        let message = InterfaceMessage::Configurations {
            step: index,
            payload,
        };
        let receivers = self.send(&self.topics.interface(), &message).await?;
        debug!(step = index, receivers, "step broadcast");
        Ok(receivers)
    }

    /// Publish a command on the robot-facing topic.  Fire-and-forget.
    pub async fn send_robot_command(&self, command: &RobotCommand) -> Result<usize, TimberError> {
        let receivers = self.send(&self.topics.command(), command).await?;
        debug!(?command, receivers, "robot command sent");
        Ok(receivers)
    }

    /// Echo the users the controller currently sees.  Diagnostic only.
    pub async fn announce_presence_echo(&self, users: Vec<UserId>) -> Result<usize, TimberError> {
        let count = users.len();
        let receivers = self
            .send(&self.topics.interface(), &InterfaceMessage::Presence { users })
            .await?;
        debug!(users = count, receivers, "presence echo");
        Ok(receivers)
    }

    /// Publish `payload` on the scoped data topic of `user`.
    pub async fn send_to_user(
        &self,
        user: &UserId,
        payload: serde_json::Value,
    ) -> Result<usize, TimberError> {
        self.transport.publish(&self.topics.user_data(user), payload).await
    }

    async fn send<T: Serialize>(&self, topic: &str, message: &T) -> Result<usize, TimberError> {
        let payload = serde_json::to_value(message)?;
        self.transport.publish(topic, payload).await
    }
}
