//! `timberline-types` – shared data model.
//!
//! Everything that crosses a crate boundary lives here: user identifiers,
//! bus envelopes, the inbound (checkin / confirmation) and outbound
//! (interface broadcast / robot command) message shapes, robot
//! configurations, and the workspace-wide [`TimberError`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Index of a confirmation wave.  Assigned by the execution controller and
/// strictly increasing over the life of a run.
pub type StepIndex = u64;

// ─────────────────────────────────────────────────────────────────────────────
// UserId
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque, client-chosen identifier of one AR observer.
///
/// Clients in the field send either a string or an integer; both are
/// normalised to their string form on decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        let id = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.trim().to_string(),
            Raw::Signed(n) => n.to_string(),
            Raw::Unsigned(n) => n.to_string(),
        };
        if id.is_empty() {
            return Err(serde::de::Error::custom("user id must not be empty"));
        }
        Ok(Self(id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Unit of delivery on the publish/subscribe bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Fully qualified topic, e.g. `/T2_command_test/interface_topic`.
    pub topic: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: topic.into(),
            payload,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound messages
// ─────────────────────────────────────────────────────────────────────────────

/// Presence signal from an AR client.  The same message doubles as the
/// heartbeat; there is no separate heartbeat type.
///
/// Legacy clients put their id in a `text` field, which is accepted as an
/// alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinMessage {
    #[serde(alias = "text")]
    pub id: UserId,
}

/// A user's acknowledgement of one broadcast wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationMessage {
    pub user_id: UserId,
    pub step: StepIndex,
    pub confirmation: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound messages
// ─────────────────────────────────────────────────────────────────────────────

/// Messages published on the interface topic, addressed to every user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterfaceMessage {
    /// Work-step data the users must confirm.  `step` correlates the
    /// confirmation back to the wave.
    Configurations {
        step: StepIndex,
        payload: serde_json::Value,
    },
    /// Diagnostic echo of the users the controller currently sees.  Carries
    /// no confirmation semantics.
    Presence { users: Vec<UserId> },
}

/// One robot joint-space configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub joint_names: Vec<String>,
    pub values: Vec<f64>,
}

impl Configuration {
    pub fn new(joint_names: Vec<String>, values: Vec<f64>) -> Self {
        Self {
            joint_names,
            values,
        }
    }
}

/// Ordered sequence of configurations produced by the motion planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub points: Vec<Configuration>,
}

/// Commands published on the robot-facing topic.  Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum RobotCommand {
    ExecuteTrajectory {
        step: StepIndex,
        trajectory: Trajectory,
    },
    SetGripper { closed: bool },
    Stop,
}

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace error type.
///
/// Presence churn (unknown users, liveness timeouts, an empty registry) is
/// never reported through this type.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimberError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Bus Channel Error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Planning failed for step {step}: {details}")]
    Planning { step: usize, details: String },

    #[error("Execution failed for step {step}: {details}")]
    Execution { step: usize, details: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for TimberError {
    fn from(e: serde_json::Error) -> Self {
        TimberError::Serialization(e.to_string())
    }
}
