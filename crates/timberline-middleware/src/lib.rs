//! `timberline-middleware` – bus plumbing
//!
//! Moves messages between the controller and the AR observers without
//! caring about their meaning beyond the envelope.
//!
//! # Modules
//!
//! - [`bus`] – in-process, topic-addressed publish/subscribe bus built on
//!   Tokio broadcast channels.
//! - [`transport`] – the [`Transport`] seam every bus implementation (the
//!   in-process [`EventBus`] or an external broker adapter) plugs into.
//! - [`topics`] – [`TopicNamespace`]: deterministic topic names derived from
//!   a configured root directory.
//! - [`dispatcher`] – [`CommandDispatcher`]: the single outbound path for
//!   step broadcasts, robot commands, presence echoes and direct user
//!   messages.

pub mod bus;
pub mod dispatcher;
pub mod topics;
pub mod transport;

pub use bus::EventBus;
pub use dispatcher::CommandDispatcher;
pub use topics::TopicNamespace;
pub use transport::{Subscription, Transport};
