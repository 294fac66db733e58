//! [`Coordinator`] – wires the presence core to a transport.
//!
//! Starting a coordinator spawns:
//!
//! 1. one delivery task per inbound topic (checkin, confirmation) that
//!    decodes each envelope at the boundary and applies it through the
//!    [`UserRegistry`] / [`StepBarrier`] APIs – a malformed payload is logged
//!    and dropped without touching either;
//! 2. the [`LivenessScheduler`] sweeping the registry;
//! 3. a user-channel task that follows membership changes and keeps one
//!    subscription per present user on its `user_data_topic`.
//!
//! All tasks stop when the coordinator's cancellation token fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use timberline_kernel::{
    LivenessScheduler, MembershipChange, StepBarrier, UserRegistry, DEFAULT_HEARTBEAT_INTERVAL,
};
use timberline_middleware::{CommandDispatcher, Subscription, TopicNamespace, Transport};
use timberline_types::{CheckinMessage, ConfirmationMessage, Envelope, TimberError, UserId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Longest accepted interval or period.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration bundle for [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Root directory of every topic name.
    pub topic_root: String,
    /// Expected spacing of client heartbeats.
    pub heartbeat_interval: Duration,
    /// How often the liveness scheduler sweeps the registry.
    pub sweep_period: Duration,
    /// How often the controller polls the barrier while waiting.
    pub barrier_poll: Duration,
    /// Treat an empty registry as a satisfied barrier.
    pub allow_empty_barrier: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            topic_root: "T2_command_test".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            sweep_period: Duration::from_millis(500),
            barrier_poll: Duration::from_millis(100),
            allow_empty_barrier: false,
        }
    }
}

impl CoordinatorConfig {
    /// Check the configuration and derive the topic namespace.
    ///
    /// # Errors
    ///
    /// [`TimberError::Config`] for an invalid topic root, or an interval that
    /// is zero or longer than [`MAX_INTERVAL`].
    pub fn validate(&self) -> Result<TopicNamespace, TimberError> {
        for (name, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("sweep_period", self.sweep_period),
            ("barrier_poll", self.barrier_poll),
        ] {
            if value.is_zero() {
                return Err(TimberError::Config(format!("{name} must be non-zero")));
            }
            if value > MAX_INTERVAL {
                return Err(TimberError::Config(format!(
                    "{name} must be at most {}s",
                    MAX_INTERVAL.as_secs()
                )));
            }
        }
        TopicNamespace::new(self.topic_root.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the registry, barrier and dispatcher for one transport.
pub struct Coordinator {
    transport: Arc<dyn Transport>,
    topics: TopicNamespace,
    config: CoordinatorConfig,
    registry: Arc<UserRegistry>,
    barrier: Arc<StepBarrier>,
    dispatcher: CommandDispatcher,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Build a coordinator.  Nothing is subscribed until [`start`][Self::start].
    ///
    /// # Errors
    ///
    /// [`TimberError::Config`] when `config` does not validate.
    pub fn new(transport: Arc<dyn Transport>, config: CoordinatorConfig) -> Result<Self, TimberError> {
        let topics = config.validate()?;
        let registry = Arc::new(UserRegistry::new(config.heartbeat_interval));
        let barrier = Arc::new(
            StepBarrier::new(Arc::clone(&registry)).allow_empty(config.allow_empty_barrier),
        );
        let dispatcher = CommandDispatcher::new(Arc::clone(&transport), topics.clone());
        Ok(Self {
            transport,
            topics,
            config,
            registry,
            barrier,
            dispatcher,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Subscribe to the inbound topics and spawn the background tasks.
    ///
    /// Subscriptions are in place when this returns, so no message published
    /// afterwards is missed.
    pub async fn start(&mut self) -> Result<(), TimberError> {
        let checkins = self.transport.subscribe(&self.topics.checkin()).await?;
        let confirmations = self.transport.subscribe(&self.topics.confirmation()).await?;
        let changes = self.registry.subscribe_changes();

        let registry = Arc::clone(&self.registry);
        self.tasks.push(tokio::spawn(pump(checkins, self.cancel.clone(), move |envelope| {
            handle_checkin(&registry, envelope)
        })));

        let barrier = Arc::clone(&self.barrier);
        self.tasks.push(tokio::spawn(pump(
            confirmations,
            self.cancel.clone(),
            move |envelope| handle_confirmation(&barrier, envelope),
        )));

        self.tasks.push(
            LivenessScheduler::new(Arc::clone(&self.registry), self.config.sweep_period)
                .spawn(self.cancel.clone()),
        );

        let channels = UserChannels {
            transport: Arc::clone(&self.transport),
            topics: self.topics.clone(),
            registry: Arc::clone(&self.registry),
            open: HashMap::new(),
        };
        self.tasks.push(tokio::spawn(channels.run(changes, self.cancel.clone())));

        info!(root = self.topics.root(), "coordinator started");
        Ok(())
    }

    pub fn registry(&self) -> &Arc<UserRegistry> {
        &self.registry
    }

    pub fn barrier(&self) -> &Arc<StepBarrier> {
        &self.barrier
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn topics(&self) -> &TopicNamespace {
        &self.topics
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Token that stops every background task when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel and join all background tasks.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "coordinator task ended abnormally");
            }
        }
        info!("coordinator stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delivery boundary
// ─────────────────────────────────────────────────────────────────────────────

async fn pump<F>(mut subscription: Subscription, cancel: CancellationToken, mut handle: F)
where
    F: FnMut(&Envelope) + Send,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = subscription.recv() => match next {
                Some(envelope) => handle(&envelope),
                None => {
                    debug!(topic = subscription.topic(), "inbound subscription closed");
                    break;
                }
            }
        }
    }
}

/// Apply a checkin/heartbeat envelope.
pub(crate) fn handle_checkin(registry: &UserRegistry, envelope: &Envelope) {
    match serde_json::from_value::<CheckinMessage>(envelope.payload.clone()) {
        Ok(message) => {
            registry.checkin(&message.id);
        }
        Err(e) => {
            warn!(topic = %envelope.topic, error = %e, "malformed checkin dropped");
        }
    }
}

/// Apply a confirmation envelope.
pub(crate) fn handle_confirmation(barrier: &StepBarrier, envelope: &Envelope) {
    match serde_json::from_value::<ConfirmationMessage>(envelope.payload.clone()) {
        Ok(message) if message.confirmation => {
            let outcome = barrier.confirm(&message.user_id, message.step);
            debug!(user_id = %message.user_id, step = message.step, ?outcome, "confirmation applied");
        }
        Ok(message) => {
            debug!(user_id = %message.user_id, step = message.step, "negative confirmation ignored");
        }
        Err(e) => {
            warn!(topic = %envelope.topic, error = %e, "malformed confirmation dropped");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-user data channels
// ─────────────────────────────────────────────────────────────────────────────

struct UserChannels {
    transport: Arc<dyn Transport>,
    topics: TopicNamespace,
    registry: Arc<UserRegistry>,
    open: HashMap<UserId, JoinHandle<()>>,
}

impl UserChannels {
    async fn run(mut self, mut changes: broadcast::Receiver<MembershipChange>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(MembershipChange::Joined(id)) => self.open_channel(id, &cancel).await,
                    Ok(MembershipChange::Left { id, .. }) => self.close_channel(&id),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged_by = n, "membership listener lagged; resyncing");
                        self.resync(&cancel).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        for (_, task) in self.open.drain() {
            task.abort();
        }
    }

    async fn open_channel(&mut self, id: UserId, cancel: &CancellationToken) {
        if self.open.contains_key(&id) {
            return;
        }
        let topic = self.topics.user_data(&id);
        let subscription = match self.transport.subscribe(&topic).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(user_id = %id, topic, error = %e, "could not subscribe to user data topic");
                return;
            }
        };
        debug!(user_id = %id, topic, "subscribed to user data");
        let user = id.clone();
        let task = tokio::spawn(pump(subscription, cancel.child_token(), move |envelope| {
            info!(user_id = %user, payload = %envelope.payload, "user data received");
        }));
        self.open.insert(id, task);
    }

    fn close_channel(&mut self, id: &UserId) {
        if let Some(task) = self.open.remove(id) {
            task.abort();
            debug!(user_id = %id, "user data subscription closed");
        }
    }

    async fn resync(&mut self, cancel: &CancellationToken) {
        let present = self.registry.snapshot().ids();
        let stale: Vec<UserId> = self
            .open
            .keys()
            .filter(|id| !present.contains(id))
            .cloned()
            .collect();
        for id in stale {
            self.close_channel(&id);
        }
        for id in present {
            self.open_channel(id, cancel).await;
        }
    }
}
