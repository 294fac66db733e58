//! [`UserRegistry`] – the set of AR users currently present.
//!
//! Delivery callbacks and the liveness sweep both mutate presence state from
//! independent tasks.  The registry is the only place that state lives, and
//! every mutation takes the same lock, so there is exactly one serialisation
//! point.  Readers never see a [`UserEntry`]; they get an owned
//! [`RegistrySnapshot`] copied out under the lock.
//!
//! Add/remove events are published on a broadcast channel
//! ([`UserRegistry::subscribe_changes`]) and also flip a "changed" flag that
//! the controller drains for diagnostics ([`UserRegistry::take_changed`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use timberline_types::{StepIndex, UserId};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::liveness::{LivenessMonitor, LivenessState, Verdict};

const CHANGE_CHANNEL_CAPACITY: usize = 128;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// What a [`UserRegistry::checkin`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// The id was unknown; a new user was created.
    Joined,
    /// The id was known; its heartbeat was refreshed.
    Refreshed,
}

/// Why a user left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    LivenessTimeout,
    Removed,
}

/// Membership event published to change listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Joined(UserId),
    Left { id: UserId, reason: LeaveReason },
}

/// Point-in-time copy of one user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSnapshot {
    pub id: UserId,
    pub last_seen: Instant,
    pub liveness: LivenessState,
    /// Only ever holds `true`; an absent entry means "not confirmed".
    pub confirmed_steps: BTreeMap<StepIndex, bool>,
}

impl UserSnapshot {
    pub fn has_confirmed(&self, step: StepIndex) -> bool {
        self.confirmed_steps.get(&step).copied().unwrap_or(false)
    }
}

/// Immutable, point-in-time copy of the whole registry.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    users: BTreeMap<UserId, UserSnapshot>,
    taken_at: Instant,
}

impl RegistrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    pub fn get(&self, id: &UserId) -> Option<&UserSnapshot> {
        self.users.get(id)
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> Vec<UserId> {
        self.users.keys().cloned().collect()
    }

    pub fn users(&self) -> impl Iterator<Item = &UserSnapshot> {
        self.users.values()
    }

    /// `true` when every user in the snapshot has confirmed `step`.
    ///
    /// Vacuously `true` for an empty snapshot; callers decide what an empty
    /// registry means.
    pub fn all_confirmed(&self, step: StepIndex) -> bool {
        self.users.values().all(|u| u.has_confirmed(step))
    }

    /// Users that have not confirmed `step` yet.
    pub fn pending(&self, step: StepIndex) -> Vec<UserId> {
        self.users
            .values()
            .filter(|u| !u.has_confirmed(step))
            .map(|u| u.id.clone())
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct UserEntry {
    last_seen: Instant,
    monitor: LivenessMonitor,
    confirmed_steps: HashMap<StepIndex, bool>,
}

// ────────────────────────────────────────────────────────────────────────────
// UserRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Lock-serialised registry of AR users.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use timberline_kernel::{CheckinOutcome, UserRegistry};
///
/// let registry = UserRegistry::new(Duration::from_secs(2));
/// assert_eq!(registry.checkin(&"A".into()), CheckinOutcome::Joined);
/// assert_eq!(registry.checkin(&"A".into()), CheckinOutcome::Refreshed);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.len(), 1);
///
/// registry.remove(&"A".into());
/// registry.remove(&"A".into()); // unknown id: silently ignored
/// assert!(registry.snapshot().is_empty());
/// ```
pub struct UserRegistry {
    users: Mutex<HashMap<UserId, UserEntry>>,
    interval: Duration,
    changed: AtomicBool,
    changes: broadcast::Sender<MembershipChange>,
}

impl UserRegistry {
    /// Create an empty registry whose users are expected to heartbeat every
    /// `heartbeat_interval`.
    pub fn new(heartbeat_interval: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            users: Mutex::new(HashMap::new()),
            interval: heartbeat_interval,
            changed: AtomicBool::new(false),
            changes,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.interval
    }

    /// Register `id`, or refresh its heartbeat if it is already known.
    ///
    /// A colliding id is a re-checkin of the same user, never a second user;
    /// its confirmations survive.
    pub fn checkin(&self, id: &UserId) -> CheckinOutcome {
        self.checkin_at(id, Instant::now())
    }

    pub(crate) fn checkin_at(&self, id: &UserId, now: Instant) -> CheckinOutcome {
        let mut users = self.users.lock();
        if let Some(entry) = users.get_mut(id) {
            entry.last_seen = now;
            return CheckinOutcome::Refreshed;
        }

        users.insert(
            id.clone(),
            UserEntry {
                last_seen: now,
                monitor: LivenessMonitor::start(now, self.interval),
                confirmed_steps: HashMap::new(),
            },
        );
        info!(user_id = %id, users = users.len(), "user joined");
        self.notify(MembershipChange::Joined(id.clone()));
        CheckinOutcome::Joined
    }

    /// Remove `id`.  Returns whether it was present; an unknown id is not an
    /// error because removal races with liveness timeouts.
    pub fn remove(&self, id: &UserId) -> bool {
        self.remove_with_reason(id, LeaveReason::Removed)
    }

    fn remove_with_reason(&self, id: &UserId, reason: LeaveReason) -> bool {
        let mut users = self.users.lock();
        if users.remove(id).is_none() {
            debug!(user_id = %id, "remove of unknown user ignored");
            return false;
        }
        info!(user_id = %id, ?reason, users = users.len(), "user left");
        self.notify(MembershipChange::Left {
            id: id.clone(),
            reason,
        });
        true
    }

    /// Evaluate every user's liveness monitor and drop the ones that must go.
    ///
    /// Returns the removed ids.
    pub fn sweep(&self) -> Vec<UserId> {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> Vec<UserId> {
        let mut users = self.users.lock();
        let expired: Vec<UserId> = users
            .iter_mut()
            .filter_map(|(id, entry)| {
                (entry.monitor.check(now, entry.last_seen) == Verdict::Remove).then(|| id.clone())
            })
            .collect();

        for id in &expired {
            users.remove(id);
            info!(user_id = %id, users = users.len(), "user timed out");
            self.notify(MembershipChange::Left {
                id: id.clone(),
                reason: LeaveReason::LivenessTimeout,
            });
        }
        expired
    }

    /// Copy the registry out under the lock.
    ///
    /// Users whose last heartbeat is two intervals old are left out even if
    /// the next sweep has not removed them yet.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> RegistrySnapshot {
        let deadline = self.interval.saturating_mul(2);
        let guard = self.users.lock();
        let users = guard
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) < deadline)
            .map(|(id, entry)| {
                let confirmed_steps = entry
                    .confirmed_steps
                    .iter()
                    .filter(|(_, confirmed)| **confirmed)
                    .map(|(step, confirmed)| (*step, *confirmed))
                    .collect();
                (
                    id.clone(),
                    UserSnapshot {
                        id: id.clone(),
                        last_seen: entry.last_seen,
                        liveness: entry.monitor.state(),
                        confirmed_steps,
                    },
                )
            })
            .collect();
        RegistrySnapshot {
            users,
            taken_at: now,
        }
    }

    pub fn contains(&self, id: &UserId) -> bool {
        self.users.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }

    /// Subscribe to join/leave events.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<MembershipChange> {
        self.changes.subscribe()
    }

    /// Return whether membership changed since the previous call, and reset
    /// the flag.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    // ── Confirmation bookkeeping (driven by the StepBarrier) ────────────────

    /// Mark `step` confirmed by `id`.  Returns `None` for an unknown user,
    /// otherwise whether this was the first confirmation.
    pub(crate) fn record_confirmation(&self, id: &UserId, step: StepIndex) -> Option<bool> {
        let mut users = self.users.lock();
        let entry = users.get_mut(id)?;
        Some(entry.confirmed_steps.insert(step, true).is_none())
    }

    /// Forget every user's confirmation of `step`.
    pub(crate) fn clear_step(&self, step: StepIndex) {
        for entry in self.users.lock().values_mut() {
            entry.confirmed_steps.remove(&step);
        }
    }

    fn notify(&self, change: MembershipChange) {
        self.changed.store(true, Ordering::Release);
        // No listeners is fine.
        let _ = self.changes.send(change);
    }
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new(crate::liveness::DEFAULT_HEARTBEAT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    const INTERVAL: Duration = Duration::from_secs(1);

    fn id(s: &str) -> UserId {
        UserId::from(s)
    }

    #[test]
    fn checkin_creates_then_refreshes() {
        let registry = UserRegistry::new(INTERVAL);
        let t0 = Instant::now();
        assert_eq!(registry.checkin_at(&id("A"), t0), CheckinOutcome::Joined);

        let t1 = t0 + Duration::from_millis(500);
        assert_eq!(registry.checkin_at(&id("A"), t1), CheckinOutcome::Refreshed);

        let snapshot = registry.snapshot_at(t1);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&id("A")).unwrap().last_seen, t1);
    }

    #[test]
    fn huge_interval_keeps_users_in_snapshot() {
        let registry = UserRegistry::new(Duration::MAX);
        let t0 = Instant::now();
        registry.checkin_at(&id("A"), t0);
        assert_eq!(registry.snapshot_at(t0 + INTERVAL * 10).len(), 1);
    }

    #[test]
    fn recheckin_keeps_confirmations() {
        let registry = UserRegistry::new(INTERVAL);
        registry.checkin(&id("A"));
        registry.record_confirmation(&id("A"), 4);
        registry.checkin(&id("A"));
        assert!(registry.snapshot().get(&id("A")).unwrap().has_confirmed(4));
    }

    #[test]
    fn remove_unknown_is_noop() {
        let registry = UserRegistry::new(INTERVAL);
        assert!(!registry.remove(&id("ghost")));
        assert!(registry.is_empty());
        assert!(!registry.take_changed());
    }

    #[test]
    fn record_confirmation_for_unknown_user_is_rejected() {
        let registry = UserRegistry::new(INTERVAL);
        assert_eq!(registry.record_confirmation(&id("ghost"), 0), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_confirmation_reports_not_first() {
        let registry = UserRegistry::new(INTERVAL);
        registry.checkin(&id("A"));
        assert_eq!(registry.record_confirmation(&id("A"), 2), Some(true));
        assert_eq!(registry.record_confirmation(&id("A"), 2), Some(false));
    }

    #[test]
    fn clear_step_resets_every_user() {
        let registry = UserRegistry::new(INTERVAL);
        registry.checkin(&id("A"));
        registry.checkin(&id("B"));
        registry.record_confirmation(&id("A"), 1);
        registry.record_confirmation(&id("B"), 1);
        registry.record_confirmation(&id("B"), 2);

        registry.clear_step(1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.pending(1), vec![id("A"), id("B")]);
        assert!(snapshot.get(&id("B")).unwrap().has_confirmed(2));
    }

    #[test]
    fn sweep_removes_after_two_silent_intervals() {
        let registry = UserRegistry::new(INTERVAL);
        let t0 = Instant::now();
        registry.checkin_at(&id("A"), t0);
        registry.checkin_at(&id("B"), t0);

        // B keeps heartbeating, A goes silent.
        registry.checkin_at(&id("B"), t0 + Duration::from_millis(900));
        assert!(registry.sweep_at(t0 + INTERVAL).is_empty());

        registry.checkin_at(&id("B"), t0 + Duration::from_millis(1_800));
        let removed = registry.sweep_at(t0 + INTERVAL * 2);
        assert_eq!(removed, vec![id("A")]);
        assert!(registry.contains(&id("B")));
    }

    #[test]
    fn snapshot_hides_users_past_deadline() {
        let registry = UserRegistry::new(INTERVAL);
        let t0 = Instant::now();
        registry.checkin_at(&id("A"), t0);

        assert_eq!(registry.snapshot_at(t0 + INTERVAL).len(), 1);
        // Not swept yet, but no longer observable.
        assert!(registry.snapshot_at(t0 + INTERVAL * 2).is_empty());
        assert!(registry.contains(&id("A")));
    }

    #[test]
    fn changes_are_broadcast_and_flagged() {
        let registry = UserRegistry::new(INTERVAL);
        let mut rx = registry.subscribe_changes();

        registry.checkin(&id("A"));
        registry.checkin(&id("A"));
        registry.remove(&id("A"));

        assert_eq!(rx.try_recv().unwrap(), MembershipChange::Joined(id("A")));
        assert_eq!(
            rx.try_recv().unwrap(),
            MembershipChange::Left {
                id: id("A"),
                reason: LeaveReason::Removed
            }
        );
        assert!(rx.try_recv().is_err(), "a refresh is not a membership change");

        assert!(registry.take_changed());
        assert!(!registry.take_changed());
    }

    #[test]
    fn timeout_is_reported_as_liveness_leave() {
        let registry = UserRegistry::new(INTERVAL);
        let mut rx = registry.subscribe_changes();
        let t0 = Instant::now();
        registry.checkin_at(&id("A"), t0);
        registry.sweep_at(t0 + INTERVAL * 2);

        let _joined = rx.try_recv().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            MembershipChange::Left {
                id: id("A"),
                reason: LeaveReason::LivenessTimeout
            }
        );
    }

    /// 50 users churned by several threads for three liveness intervals
    /// while a sweeper runs; every snapshot must be duplicate-free, contain
    /// only known ids, and never show a user older than two intervals.
    #[test]
    fn concurrent_churn_never_yields_inconsistent_snapshot() {
        const USERS: usize = 50;
        const WORKERS: usize = 6;
        let interval = Duration::from_millis(20);
        let registry = Arc::new(UserRegistry::new(interval));
        let universe: Vec<UserId> = (0..USERS).map(|i| UserId::new(format!("user-{i}"))).collect();
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..WORKERS {
            let registry = Arc::clone(&registry);
            let universe = universe.clone();
            let stop = Arc::clone(&stop);
            handles.push(thread::spawn(move || {
                let mut rng = rand::rng();
                let mut checked = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let user = &universe[rng.random_range(0..USERS)];
                    match rng.random_range(0..10) {
                        0..=5 => {
                            registry.checkin(user);
                        }
                        6 => {
                            registry.remove(user);
                        }
                        7 => {
                            registry.record_confirmation(user, 0);
                        }
                        _ => {
                            let snapshot = registry.snapshot();
                            let ids = snapshot.ids();
                            let unique: HashSet<_> = ids.iter().collect();
                            assert_eq!(unique.len(), ids.len(), "duplicated id in snapshot");
                            assert!(ids.len() <= USERS);
                            for user in snapshot.users() {
                                assert!(universe.contains(&user.id), "dangling id {}", user.id);
                                assert!(
                                    snapshot.taken_at().saturating_duration_since(user.last_seen)
                                        < interval * 2,
                                    "stale user {} visible",
                                    user.id
                                );
                            }
                            checked += 1;
                        }
                    }
                }
                checked
            }));
        }

        let sweeper = {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    registry.sweep();
                    thread::sleep(interval / 4);
                }
            })
        };

        thread::sleep(interval * 3);
        stop.store(true, Ordering::Relaxed);

        let snapshots: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        sweeper.join().unwrap();
        assert!(snapshots > 0);
        assert!(registry.len() <= USERS);
    }
}
