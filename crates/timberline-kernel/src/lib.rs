//! `timberline-kernel` – presence tracking and step confirmation
//!
//! The part of the system that decides who is watching and whether everyone
//! watching has agreed.  It does not talk to the bus; the runtime feeds it.
//!
//! # Modules
//!
//! - [`registry`] – [`UserRegistry`][registry::UserRegistry]: the single,
//!   lock-serialised owner of every known AR user.  Mutation goes through
//!   `checkin` / `remove` / `sweep`; readers get immutable
//!   [`RegistrySnapshot`][registry::RegistrySnapshot]s.
//! - [`liveness`] – [`LivenessMonitor`][liveness::LivenessMonitor]: the
//!   per-user `Alive → Suspect → Remove` state machine, and
//!   [`LivenessScheduler`][liveness::LivenessScheduler]: one periodic task
//!   that drives every monitor.
//! - [`barrier`] – [`StepBarrier`][barrier::StepBarrier]: per-wave
//!   confirmation bookkeeping, satisfied only when every user in the current
//!   snapshot has confirmed.

pub mod barrier;
pub mod liveness;
pub mod registry;

pub use barrier::{BarrierStatus, ConfirmOutcome, StepBarrier};
pub use liveness::{LivenessMonitor, LivenessScheduler, LivenessState, Verdict, DEFAULT_HEARTBEAT_INTERVAL};
pub use registry::{
    CheckinOutcome, LeaveReason, MembershipChange, RegistrySnapshot, UserRegistry, UserSnapshot,
};
