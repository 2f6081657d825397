//! Job lifecycle notifications.
//!
//! The orchestrator and webhook processor publish [`JobEvent`]s to an
//! [`EventBus`]. Observers run on a single dispatcher task per bus, so
//! they see events in publish order, while a slow or failing observer never
//! delays or fails the job it is reporting on.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dispatch_common::JobEvent;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Capacity of the websocket broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait JobObserver: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &JobEvent) -> anyhow::Result<()>;
}

struct Delivery {
    event: Arc<JobEvent>,
    done: Option<oneshot::Sender<()>>,
}

type DispatchSender = mpsc::UnboundedSender<Delivery>;

/// Fan-out point for job events: registered observers plus a broadcast
/// channel of serialized events for websocket clients.
#[derive(Clone)]
pub struct EventBus {
    observers: Vec<Arc<dyn JobObserver>>,
    tx: broadcast::Sender<String>,
    /// Started on first publish; shared by every clone of this bus.
    dispatcher: Arc<OnceLock<DispatchSender>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            observers: Vec::new(),
            tx,
            dispatcher: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observers.push(observer);
        self.dispatcher = Arc::new(OnceLock::new());
        self
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Publish without waiting on observers.
    pub fn publish(&self, event: JobEvent) {
        self.broadcast(&event);
        self.dispatch(event, None);
    }

    /// Publish and wait until every observer has seen this event and
    /// everything published before it.
    #[cfg(test)]
    pub(crate) async fn publish_and_wait(&self, event: JobEvent) {
        self.broadcast(&event);
        let (done, wait) = oneshot::channel();
        if self.dispatch(event, Some(done)) {
            let _ = wait.await;
        }
    }

    fn broadcast(&self, event: &JobEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize job event"),
        }
    }

    /// Queue `event` for the dispatcher. Returns whether it was queued.
    fn dispatch(&self, event: JobEvent, done: Option<oneshot::Sender<()>>) -> bool {
        if self.observers.is_empty() {
            return false;
        }
        let sender = self
            .dispatcher
            .get_or_init(|| spawn_dispatcher(self.observers.clone()));
        let delivery = Delivery {
            event: Arc::new(event),
            done,
        };
        if sender.send(delivery).is_err() {
            tracing::warn!("Job event dispatcher stopped; event dropped");
            return false;
        }
        true
    }
}

fn spawn_dispatcher(observers: Vec<Arc<dyn JobObserver>>) -> DispatchSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            for observer in &observers {
                notify(observer.as_ref(), &delivery.event).await;
            }
            if let Some(done) = delivery.done {
                let _ = done.send(());
            }
        }
    });
    tx
}

async fn notify(observer: &dyn JobObserver, event: &JobEvent) {
    if let Err(e) = observer.on_event(event).await {
        tracing::warn!(
            observer = observer.name(),
            job_id = %event.job_id,
            event = event.kind.name(),
            error = %e,
            "Job observer failed"
        );
    }
}

/// Writes every event to the tracing log.
pub struct LoggingObserver;

#[async_trait]
impl JobObserver for LoggingObserver {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_event(&self, event: &JobEvent) -> anyhow::Result<()> {
        tracing::info!(
            workspace = %event.workspace_id,
            job_id = %event.job_id,
            card = event.card_ref.as_deref().unwrap_or("-"),
            event = event.kind.name(),
            "Job event"
        );
        Ok(())
    }
}
