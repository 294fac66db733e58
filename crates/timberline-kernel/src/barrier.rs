//! [`StepBarrier`] – gates robot motion on confirmation from every present
//! user.
//!
//! A wave is *open* between [`StepBarrier::open_step`] and
//! [`StepBarrier::close_step`].  While open, [`StepBarrier::is_satisfied`]
//! is recomputed from a fresh [`RegistrySnapshot`] on every call, so:
//!
//! * a user who leaves stops being required immediately;
//! * a user who joins after the broadcast starts unconfirmed and extends the
//!   wait until it confirms too;
//! * an empty registry is *not* satisfied unless the barrier was built with
//!   [`StepBarrier::allow_empty`].
//!
//! Confirmations for closed or unknown waves, and from unknown users, are
//! tolerated and ignored.
//!
//! # Lock order
//!
//! The barrier's own lock is always taken before the registry lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use timberline_types::{StepIndex, TimberError, UserId};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::{RegistrySnapshot, UserRegistry};

/// Result of [`StepBarrier::confirm`].  None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Recorded,
    Duplicate,
    /// The wave is closed or was never opened.
    StepClosed,
    UnknownUser,
}

/// Diagnostic view of one open wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierStatus {
    pub step: StepIndex,
    pub confirmed: Vec<UserId>,
    pub pending: Vec<UserId>,
    pub satisfied: bool,
}

struct OpenStep {
    payload: serde_json::Value,
    opened_at: Instant,
}

/// Per-wave confirmation barrier over a shared [`UserRegistry`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use serde_json::json;
/// use timberline_kernel::{StepBarrier, UserRegistry};
///
/// let registry = Arc::new(UserRegistry::new(Duration::from_secs(2)));
/// let barrier = StepBarrier::new(Arc::clone(&registry));
///
/// registry.checkin(&"A".into());
/// assert!(!barrier.is_satisfied(0)); // not opened yet
///
/// barrier.open_step(0, json!({ "phase": "pickup" }));
/// assert!(!barrier.is_satisfied(0));
///
/// barrier.confirm(&"A".into(), 0);
/// assert!(barrier.is_satisfied(0));
/// ```
pub struct StepBarrier {
    registry: Arc<UserRegistry>,
    open: Mutex<BTreeMap<StepIndex, OpenStep>>,
    allow_empty: bool,
}

impl StepBarrier {
    pub fn new(registry: Arc<UserRegistry>) -> Self {
        Self {
            registry,
            open: Mutex::new(BTreeMap::new()),
            allow_empty: false,
        }
    }

    /// Whether a wave with no users present counts as satisfied
    /// (builder-style).  Defaults to `false`: execution waits for at least
    /// one observer.
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    pub fn registry(&self) -> &Arc<UserRegistry> {
        &self.registry
    }

    /// Open wave `index` for confirmation and keep `payload` for
    /// re-publication.  Any confirmation of `index` left over from an
    /// earlier wave is discarded, so every current user starts unconfirmed.
    pub fn open_step(&self, index: StepIndex, payload: serde_json::Value) {
        let mut open = self.open.lock();
        self.registry.clear_step(index);
        let reopened = open
            .insert(
                index,
                OpenStep {
                    payload,
                    opened_at: Instant::now(),
                },
            )
            .is_some();
        debug!(step = index, reopened, "step opened");
    }

    /// Record that `user` confirmed wave `index`.
    pub fn confirm(&self, user: &UserId, index: StepIndex) -> ConfirmOutcome {
        let open = self.open.lock();
        if !open.contains_key(&index) {
            debug!(user_id = %user, step = index, "confirmation for closed step ignored");
            return ConfirmOutcome::StepClosed;
        }
        match self.registry.record_confirmation(user, index) {
            None => {
                debug!(user_id = %user, step = index, "confirmation from unknown user ignored");
                ConfirmOutcome::UnknownUser
            }
            Some(true) => {
                info!(user_id = %user, step = index, "step confirmed");
                ConfirmOutcome::Recorded
            }
            Some(false) => ConfirmOutcome::Duplicate,
        }
    }

    /// `true` iff wave `index` is open and every user in the current
    /// registry snapshot has confirmed it.
    pub fn is_satisfied(&self, index: StepIndex) -> bool {
        let open = self.open.lock();
        if !open.contains_key(&index) {
            return false;
        }
        let snapshot = self.registry.snapshot();
        self.evaluate(&snapshot, index)
    }

    /// Confirmed/pending breakdown of an open wave.
    pub fn status(&self, index: StepIndex) -> Option<BarrierStatus> {
        let open = self.open.lock();
        if !open.contains_key(&index) {
            return None;
        }
        let snapshot = self.registry.snapshot();
        let pending = snapshot.pending(index);
        let confirmed = snapshot
            .ids()
            .into_iter()
            .filter(|id| !pending.contains(id))
            .collect();
        Some(BarrierStatus {
            step: index,
            confirmed,
            pending,
            satisfied: self.evaluate(&snapshot, index),
        })
    }

    /// Payload recorded by [`open_step`][Self::open_step], while open.
    pub fn payload(&self, index: StepIndex) -> Option<serde_json::Value> {
        self.open.lock().get(&index).map(|s| s.payload.clone())
    }

    /// Open wave indices in ascending order.
    pub fn open_steps(&self) -> Vec<StepIndex> {
        self.open.lock().keys().copied().collect()
    }

    /// Close wave `index` and discard its bookkeeping.  Later
    /// confirmations of it are no-ops.
    pub fn close_step(&self, index: StepIndex) -> bool {
        let mut open = self.open.lock();
        let Some(step) = open.remove(&index) else {
            return false;
        };
        self.registry.clear_step(index);
        debug!(
            step = index,
            open_ms = step.opened_at.elapsed().as_millis() as u64,
            "step closed"
        );
        true
    }

    /// Poll [`is_satisfied`][Self::is_satisfied] every `poll` until it holds
    /// or `cancel` fires.
    ///
    /// There is no iteration cap; users coming and going while the wave is
    /// open is normal input.  Membership changes observed while waiting are
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns [`TimberError::Cancelled`] when `cancel` fires first.
    pub async fn wait_until_satisfied(
        &self,
        index: StepIndex,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TimberError> {
        let mut ticker = tokio::time::interval(poll.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(step = index, "wait for confirmation cancelled");
                    return Err(TimberError::Cancelled);
                }
                _ = ticker.tick() => {
                    if self.registry.take_changed() {
                        if let Some(status) = self.status(index) {
                            info!(
                                step = index,
                                confirmed = ?status.confirmed,
                                pending = ?status.pending,
                                "users changed while waiting"
                            );
                        }
                    }
                    if self.is_satisfied(index) {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn evaluate(&self, snapshot: &RegistrySnapshot, index: StepIndex) -> bool {
        if snapshot.is_empty() {
            return self.allow_empty;
        }
        snapshot.all_confirmed(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const INTERVAL: Duration = Duration::from_secs(1);
    const POLL: Duration = Duration::from_millis(100);

    fn setup() -> (Arc<UserRegistry>, StepBarrier) {
        let registry = Arc::new(UserRegistry::new(INTERVAL));
        let barrier = StepBarrier::new(Arc::clone(&registry));
        (registry, barrier)
    }

    fn id(s: &str) -> UserId {
        UserId::from(s)
    }

    #[test]
    fn single_user_confirms_open_step() {
        let (registry, barrier) = setup();
        registry.checkin(&id("A"));
        assert!(!barrier.is_satisfied(0), "unopened step is never satisfied");

        barrier.open_step(0, json!({}));
        assert!(!barrier.is_satisfied(0));

        assert_eq!(barrier.confirm(&id("A"), 0), ConfirmOutcome::Recorded);
        assert!(barrier.is_satisfied(0));
    }

    #[test]
    fn late_joiner_extends_wait() {
        let (registry, barrier) = setup();
        registry.checkin(&id("A"));
        barrier.open_step(1, json!({}));
        barrier.confirm(&id("A"), 1);
        assert!(barrier.is_satisfied(1));

        registry.checkin(&id("B"));
        assert!(!barrier.is_satisfied(1), "B joined and has not confirmed");

        barrier.confirm(&id("B"), 1);
        assert!(barrier.is_satisfied(1));
    }

    #[test]
    fn departed_user_is_no_longer_required() {
        let (registry, barrier) = setup();
        registry.checkin(&id("A"));
        registry.checkin(&id("B"));
        barrier.open_step(2, json!({}));
        barrier.confirm(&id("A"), 2);
        assert!(!barrier.is_satisfied(2));

        registry.remove(&id("B"));
        assert!(barrier.is_satisfied(2));
    }

    #[test]
    fn empty_registry_is_not_satisfied() {
        let (registry, barrier) = setup();
        registry.checkin(&id("A"));
        barrier.open_step(0, json!({}));
        barrier.confirm(&id("A"), 0);
        assert!(barrier.is_satisfied(0));

        registry.remove(&id("A"));
        assert!(!barrier.is_satisfied(0), "prior confirmations do not count once nobody is left");
    }

    #[test]
    fn empty_registry_can_be_allowed() {
        let registry = Arc::new(UserRegistry::new(INTERVAL));
        let barrier = StepBarrier::new(Arc::clone(&registry)).allow_empty(true);
        barrier.open_step(0, json!({}));
        assert!(barrier.is_satisfied(0));
        assert!(!barrier.is_satisfied(1), "still requires the step to be open");
    }

    #[test]
    fn duplicate_confirmation_is_idempotent() {
        let (registry, barrier) = setup();
        registry.checkin(&id("A"));
        barrier.open_step(0, json!({}));
        barrier.confirm(&id("A"), 0);
        assert_eq!(barrier.confirm(&id("A"), 0), ConfirmOutcome::Duplicate);
        assert!(barrier.is_satisfied(0));
    }

    #[test]
    fn confirmation_for_closed_step_does_not_resurrect() {
        let (registry, barrier) = setup();
        registry.checkin(&id("A"));
        barrier.open_step(3, json!({}));
        barrier.confirm(&id("A"), 3);
        assert!(barrier.close_step(3));

        assert_eq!(barrier.confirm(&id("A"), 3), ConfirmOutcome::StepClosed);
        assert!(!barrier.is_satisfied(3));
        assert!(barrier.payload(3).is_none());
        assert!(!registry.snapshot().get(&id("A")).unwrap().has_confirmed(3));
    }

    #[test]
    fn ghost_confirmation_is_ignored() {
        let (registry, barrier) = setup();
        registry.checkin(&id("A"));
        barrier.open_step(2, json!({}));

        assert_eq!(barrier.confirm(&id("ghost"), 2), ConfirmOutcome::UnknownUser);
        assert_eq!(registry.len(), 1);
        assert!(!barrier.is_satisfied(2));
    }

    #[test]
    fn reopening_starts_unconfirmed() {
        let (registry, barrier) = setup();
        registry.checkin(&id("A"));
        barrier.open_step(5, json!({ "v": 1 }));
        barrier.confirm(&id("A"), 5);
        barrier.open_step(5, json!({ "v": 2 }));

        assert!(!barrier.is_satisfied(5));
        assert_eq!(barrier.payload(5), Some(json!({ "v": 2 })));
    }

    #[test]
    fn status_splits_confirmed_and_pending() {
        let (registry, barrier) = setup();
        registry.checkin(&id("A"));
        registry.checkin(&id("B"));
        barrier.open_step(0, json!({}));
        barrier.confirm(&id("B"), 0);

        let status = barrier.status(0).unwrap();
        assert_eq!(status.confirmed, vec![id("B")]);
        assert_eq!(status.pending, vec![id("A")]);
        assert!(!status.satisfied);
        assert!(barrier.status(9).is_none());
    }

    #[test]
    fn close_unknown_step_returns_false() {
        let (_registry, barrier) = setup();
        assert!(!barrier.close_step(42));
        assert!(barrier.open_steps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_all_confirm() {
        let (registry, barrier) = setup();
        let barrier = Arc::new(barrier);
        registry.checkin(&id("A"));
        barrier.open_step(0, json!({}));

        let confirmer = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(350)).await;
                barrier.confirm(&id("A"), 0);
            })
        };

        let cancel = CancellationToken::new();
        barrier.wait_until_satisfied(0, POLL, &cancel).await.unwrap();
        confirmer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_on_empty_registry_blocks_until_cancelled() {
        let (_registry, barrier) = setup();
        barrier.open_step(0, json!({}));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                cancel.cancel();
            })
        };

        let result = barrier.wait_until_satisfied(0, POLL, &cancel).await;
        assert_eq!(result, Err(TimberError::Cancelled));
        canceller.await.unwrap();
    }
}
