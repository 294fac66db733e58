//! Heartbeat-based liveness detection.
//!
//! Every registered user owns a [`LivenessMonitor`].  It is created on the
//! user's first checkin and dropped when the user is removed, so "still
//! alive" never needs any action.  Once per heartbeat interval the monitor
//! asks a single question: was a heartbeat seen since the previous check?
//!
//! ```text
//!            no heartbeat               no heartbeat
//!   ALIVE ───────────────────▶ SUSPECT ──────────────▶ REMOVE
//!     ▲                           │
//!     └────── heartbeat ──────────┘
//! ```
//!
//! On top of the phase machine a hard deadline applies: a user whose last
//! heartbeat is two intervals old is removed at the next sweep no matter
//! which phase it is in.
//!
//! Monitors do not run on their own timers.  A single [`LivenessScheduler`]
//! task sweeps the whole [`UserRegistry`] every `period`, evaluating all
//! monitors under the registry lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::UserRegistry;

/// Expected spacing between two heartbeats of the same client.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

// ────────────────────────────────────────────────────────────────────────────
// State machine
// ────────────────────────────────────────────────────────────────────────────

/// Observable liveness phase of a registered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// A heartbeat arrived during the last evaluated interval.
    Alive,
    /// One interval passed without a heartbeat.
    Suspect,
}

/// Result of one [`LivenessMonitor::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Remove,
}

/// Per-user liveness state machine.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tokio::time::Instant;
/// use timberline_kernel::{LivenessMonitor, LivenessState, Verdict};
///
/// let interval = Duration::from_secs(1);
/// let t0 = Instant::now();
/// let mut monitor = LivenessMonitor::start(t0, interval);
///
/// // One silent interval: suspect, but kept.
/// assert_eq!(monitor.check(t0 + interval, t0), Verdict::Keep);
/// assert_eq!(monitor.state(), LivenessState::Suspect);
///
/// // Second silent interval: removed.
/// assert_eq!(monitor.check(t0 + interval * 2, t0), Verdict::Remove);
/// ```
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    state: LivenessState,
    last_check: Instant,
    interval: Duration,
}

impl LivenessMonitor {
    /// Start monitoring at `now`.  The user starts [`LivenessState::Alive`].
    pub fn start(now: Instant, interval: Duration) -> Self {
        Self {
            state: LivenessState::Alive,
            last_check: now,
            interval,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Evaluate the monitor at `now` for a user last seen at `last_seen`.
    ///
    /// Calls made less than one interval after the previous evaluation only
    /// apply the hard deadline; they never advance the phase.
    pub fn check(&mut self, now: Instant, last_seen: Instant) -> Verdict {
        if now.saturating_duration_since(last_seen) >= self.interval.saturating_mul(2) {
            return Verdict::Remove;
        }
        if now.saturating_duration_since(self.last_check) < self.interval {
            return Verdict::Keep;
        }

        let heartbeat_seen = last_seen > self.last_check;
        self.last_check = now;
        match (self.state, heartbeat_seen) {
            (_, true) => {
                self.state = LivenessState::Alive;
                Verdict::Keep
            }
            (LivenessState::Alive, false) => {
                self.state = LivenessState::Suspect;
                Verdict::Keep
            }
            (LivenessState::Suspect, false) => Verdict::Remove,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scheduler
// ────────────────────────────────────────────────────────────────────────────

/// Drives every user's [`LivenessMonitor`] from one periodic task.
pub struct LivenessScheduler {
    registry: Arc<UserRegistry>,
    period: Duration,
}

impl LivenessScheduler {
    /// Sweep `registry` every `period`.  A zero period is raised to one
    /// millisecond.
    pub fn new(registry: Arc<UserRegistry>, period: Duration) -> Self {
        Self {
            registry,
            period: period.max(Duration::from_millis(1)),
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(period_ms = self.period.as_millis() as u64, "liveness scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.registry.sweep();
                    if !removed.is_empty() {
                        info!(removed = ?removed, remaining = self.registry.len(), "liveness sweep removed users");
                    }
                }
            }
        }

        debug!("liveness scheduler stopped");
    }

    /// Spawn [`run`][Self::run] onto the current Tokio runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
