//! [`TopicNamespace`] – deterministic topic names.
//!
//! Every topic is `/<root>/<suffix>`, plus `/<id>` for the per-user data
//! channel.  The root is validated once at construction so that a bad
//! configuration fails at startup instead of silently publishing into the
//! void.

use timberline_types::{TimberError, UserId};

const CHECKIN_SUFFIX: &str = "user_checkin_topic";
const INTERFACE_SUFFIX: &str = "interface_topic";
const COMMAND_SUFFIX: &str = "command_topic";
const CONFIRMATION_SUFFIX: &str = "confirmation_topic";
const USER_DATA_SUFFIX: &str = "user_data_topic";

/// Topic names derived from a configured root directory.
///
/// # Example
///
/// ```
/// use timberline_middleware::TopicNamespace;
///
/// let topics = TopicNamespace::new("T2_command_test").unwrap();
/// assert_eq!(topics.checkin(), "/T2_command_test/user_checkin_topic");
/// assert_eq!(topics.user_data(&"42".into()), "/T2_command_test/user_data_topic/42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNamespace {
    root: String,
}

impl TopicNamespace {
    /// Build a namespace rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`TimberError::Config`] when `root` is empty or contains a
    /// `/`, whitespace, or one of the MQTT wildcards `+` and `#`.
    pub fn new(root: impl Into<String>) -> Result<Self, TimberError> {
        let root = root.into();
        if root.is_empty() {
            return Err(TimberError::Config("topic root must not be empty".into()));
        }
        if let Some(bad) = root
            .chars()
            .find(|c| *c == '/' || *c == '+' || *c == '#' || c.is_whitespace())
        {
            return Err(TimberError::Config(format!(
                "topic root {root:?} contains forbidden character {bad:?}"
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Where clients announce themselves; doubles as the heartbeat topic.
    pub fn checkin(&self) -> String {
        self.topic(CHECKIN_SUFFIX)
    }

    /// Step broadcasts and presence echoes, addressed to every user.
    pub fn interface(&self) -> String {
        self.topic(INTERFACE_SUFFIX)
    }

    /// Robot-facing command stream.
    pub fn command(&self) -> String {
        self.topic(COMMAND_SUFFIX)
    }

    pub fn confirmation(&self) -> String {
        self.topic(CONFIRMATION_SUFFIX)
    }

    /// One-to-one channel scoped to a single user.
    pub fn user_data(&self, id: &UserId) -> String {
        format!("/{}/{}/{}", self.root, USER_DATA_SUFFIX, id)
    }

    fn topic(&self, suffix: &str) -> String {
        format!("/{}/{}", self.root, suffix)
    }
}
