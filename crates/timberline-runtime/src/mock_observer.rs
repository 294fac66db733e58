//! Simulated AR client used by the CLI demo and integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use timberline_middleware::{TopicNamespace, Transport};
use timberline_types::{
    CheckinMessage, ConfirmationMessage, InterfaceMessage, StepIndex, TimberError, UserId,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A fake AR device that checks in, confirms every step it is shown and
/// streams a status message on its own data topic.
pub struct MockObserver {
    id: UserId,
    transport: Arc<dyn Transport>,
    topics: TopicNamespace,
    heartbeat: Duration,
    confirm_delay: Duration,
}

impl MockObserver {
    pub fn new(id: impl Into<UserId>, transport: Arc<dyn Transport>, topics: TopicNamespace) -> Self {
        Self {
            id: id.into(),
            transport,
            topics,
            heartbeat: Duration::from_secs(1),
            confirm_delay: Duration::from_millis(300),
        }
    }

    /// Observer with a random `mock-xxxxxxxx` id.
    pub fn random(transport: Arc<dyn Transport>, topics: TopicNamespace) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self::new(format!("mock-{}", &suffix[..8]), transport, topics)
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    /// Subscribe to the interface topic and start the observer loop.
    ///
    /// The first check-in is published before this returns.
    pub async fn spawn(self, cancel: CancellationToken) -> Result<MockObserverHandle, TimberError> {
        let mut interface = self.transport.subscribe(&self.topics.interface()).await?;
        self.checkin().await?;
        info!(user = %self.id, "mock observer online");

        let id = self.id.clone();
        let flag = Arc::new(AtomicBool::new(false));
        let silent = Arc::clone(&flag);

        let task = tokio::spawn(async move {
            let observer = Arc::new(self);
            let mut ticker = tokio::time::interval(observer.heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut seq: u64 = 0;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if silent.load(Ordering::Relaxed) {
                            continue;
                        }
                        if let Err(e) = observer.checkin().await {
                            warn!(user = %observer.id, error = %e, "check-in failed");
                        }
                        seq += 1;
                        observer.publish_status(seq).await;
                    }
                    envelope = interface.recv() => {
                        let Some(envelope) = envelope else { break };
                        if silent.load(Ordering::Relaxed) {
                            continue;
                        }
                        if let Ok(InterfaceMessage::Configurations { step, .. }) =
                            serde_json::from_value(envelope.payload)
                        {
                            tokio::spawn(Arc::clone(&observer).confirm_later(
                                step,
                                Arc::clone(&silent),
                                cancel.clone(),
                            ));
                        }
                    }
                }
            }
            debug!(user = %observer.id, "mock observer stopped");
        });

        Ok(MockObserverHandle {
            id,
            silent: flag,
            task,
        })
    }

    async fn checkin(&self) -> Result<usize, TimberError> {
        let message = CheckinMessage { id: self.id.clone() };
        self.transport
            .publish(&self.topics.checkin(), serde_json::to_value(&message)?)
            .await
    }

    async fn publish_status(&self, seq: u64) {
        let status = json!({ "user": self.id, "seq": seq, "status": "tracking" });
        if let Err(e) = self.transport.publish(&self.topics.user_data(&self.id), status).await {
            warn!(user = %self.id, error = %e, "status publish failed");
        }
    }

    async fn confirm_later(
        self: Arc<Self>,
        step: StepIndex,
        silent: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.confirm_delay) => {}
        }
        if silent.load(Ordering::Relaxed) {
            return;
        }
        let message = ConfirmationMessage {
            user_id: self.id.clone(),
            step,
            confirmation: true,
        };
        let published = match serde_json::to_value(&message) {
            Ok(payload) => self.transport.publish(&self.topics.confirmation(), payload).await,
            Err(e) => Err(e.into()),
        };
        match published {
            Ok(_) => debug!(user = %self.id, step, "confirmed"),
            Err(e) => warn!(user = %self.id, step, error = %e, "confirmation failed"),
        }
    }
}

/// Control handle for a spawned [`MockObserver`].
pub struct MockObserverHandle {
    id: UserId,
    silent: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MockObserverHandle {
    pub fn id(&self) -> &UserId {
        &self.id
    }

    /// Stop heartbeats and confirmations, as if the device lost its link.
    pub fn go_silent(&self) {
        self.silent.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.silent.store(false, Ordering::Relaxed);
    }

    pub fn is_silent(&self) -> bool {
        self.silent.load(Ordering::Relaxed)
    }

    /// Wait for the observer loop to exit after its token is cancelled.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(user = %self.id, error = %e, "mock observer ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timberline_middleware::EventBus;

    fn setup() -> (EventBus, TopicNamespace) {
        (EventBus::default(), TopicNamespace::new("mock").unwrap())
    }

    #[tokio::test]
    async fn join_survives_a_panicked_loop() {
        let handle = MockObserverHandle {
            id: "A".into(),
            silent: Arc::new(AtomicBool::new(false)),
            task: tokio::spawn(async { panic!("observer loop failed") }),
        };
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_on_checkin_topic() {
        let (bus, topics) = setup();
        let mut checkins = bus.subscribe(&topics.checkin());
        let cancel = CancellationToken::new();

        let handle = MockObserver::new("A", Arc::new(bus.clone()), topics.clone())
            .heartbeat(Duration::from_millis(500))
            .spawn(cancel.clone())
            .await
            .unwrap();

        for _ in 0..3 {
            let envelope = checkins.recv().await.unwrap();
            let message: CheckinMessage = serde_json::from_value(envelope.payload).unwrap();
            assert_eq!(message.id, UserId::from("A"));
        }

        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn confirms_configurations_after_delay() {
        let (bus, topics) = setup();
        let mut confirmations = bus.subscribe(&topics.confirmation());
        let cancel = CancellationToken::new();

        let handle = MockObserver::new("A", Arc::new(bus.clone()), topics.clone())
            .confirm_delay(Duration::from_millis(200))
            .spawn(cancel.clone())
            .await
            .unwrap();

        let message = InterfaceMessage::Configurations {
            step: 7,
            payload: json!({}),
        };
        bus.publish(&topics.interface(), serde_json::to_value(&message).unwrap())
            .unwrap();

        let envelope = confirmations.recv().await.unwrap();
        let confirmation: ConfirmationMessage = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(confirmation.user_id, UserId::from("A"));
        assert_eq!(confirmation.step, 7);
        assert!(confirmation.confirmation);

        cancel.cancel();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_observer_stops_checking_in() {
        let (bus, topics) = setup();
        let mut checkins = bus.subscribe(&topics.checkin());
        let cancel = CancellationToken::new();

        let handle = MockObserver::new("A", Arc::new(bus.clone()), topics.clone())
            .heartbeat(Duration::from_millis(100))
            .spawn(cancel.clone())
            .await
            .unwrap();
        checkins.recv().await.unwrap();

        handle.go_silent();
        assert!(handle.is_silent());
        let quiet = tokio::time::timeout(Duration::from_secs(1), checkins.recv()).await;
        assert!(quiet.is_err(), "no check-ins while silent");

        handle.resume();
        assert!(checkins.recv().await.is_some());

        cancel.cancel();
        handle.join().await;
    }

    #[test]
    fn random_ids_are_prefixed() {
        let (bus, topics) = setup();
        let observer = MockObserver::random(Arc::new(bus), topics);
        assert!(observer.id.as_str().starts_with("mock-"));
        assert_eq!(observer.id.as_str().len(), 13);
    }
}
