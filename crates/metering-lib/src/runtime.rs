//! Controller runtime
//!
//! Routes store change notifications to the reconciler registered for the
//! object's kind, runs requeue timers, and reports pass outcomes to metrics
//! and health. Passes run as independent tasks; nothing serialises passes
//! for the same key.

use crate::error::MeteringError;
use crate::health::HealthRegistry;
use crate::observability::{MeteringMetrics, StructuredLogger};
use crate::reconcile::{Action, Reconciler};
use crate::store::{ObjectKey, ObjectStore, WatchEventType};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delay before a pass that failed with a retryable error runs again
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(30);

type Target = (&'static str, ObjectKey);

struct Shared {
    reconcilers: HashMap<&'static str, Arc<dyn Reconciler>>,
    health: HealthRegistry,
    metrics: MeteringMetrics,
    logger: StructuredLogger,
    error_requeue: Duration,
    /// Earliest pending timer per target
    scheduled: DashMap<Target, Instant>,
    requeue_tx: mpsc::UnboundedSender<Target>,
}

pub struct Controller {
    store: Arc<dyn ObjectStore>,
    reconcilers: HashMap<&'static str, Arc<dyn Reconciler>>,
    health: HealthRegistry,
    logger: StructuredLogger,
    error_requeue: Duration,
}

impl Controller {
    pub fn new(store: Arc<dyn ObjectStore>, health: HealthRegistry) -> Self {
        Self {
            store,
            reconcilers: HashMap::new(),
            health,
            logger: StructuredLogger::new("metering-controller"),
            error_requeue: DEFAULT_ERROR_REQUEUE,
        }
    }

    /// Route notifications for the reconciler's kind to it
    pub fn register(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.insert(reconciler.kind(), reconciler);
        self
    }

    pub fn error_requeue(mut self, delay: Duration) -> Self {
        self.error_requeue = delay;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Run until `shutdown` fires or the store's watch channel closes
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel();
        let store = self.store;
        let shared = Arc::new(Shared {
            reconcilers: self.reconcilers,
            health: self.health,
            metrics: MeteringMetrics::new(),
            logger: self.logger,
            error_requeue: self.error_requeue,
            scheduled: DashMap::new(),
            requeue_tx,
        });

        // Subscribe before listing so nothing between the two is missed
        let mut events = store.watch();

        for reconciler in shared.reconcilers.values() {
            shared.health.register(reconciler.component()).await;
        }
        resync(&store, &shared).await;
        shared.health.set_ready(true).await;

        info!(
            kinds = ?shared.reconcilers.keys().collect::<Vec<_>>(),
            "Controller started"
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if event.event_type == WatchEventType::Deleted {
                            shared.scheduled.remove(&(event.kind, event.key.clone()));
                        }
                        dispatch(&shared, event.kind, event.key);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch stream lagged, resyncing");
                        resync(&store, &shared).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Watch stream closed");
                        break;
                    }
                },
                Some((kind, key)) = requeue_rx.recv() => {
                    dispatch(&shared, kind, key);
                }
                _ = shutdown.recv() => {
                    info!("Shutting down controller");
                    break;
                }
            }
        }

        shared.health.set_ready(false).await;
    }
}

/// Dispatch a pass for every stored object of every registered kind
async fn resync(store: &Arc<dyn ObjectStore>, shared: &Arc<Shared>) {
    for kind in shared.reconcilers.keys().copied() {
        match store.list(kind, None).await {
            Ok(objects) => {
                debug!(kind, count = objects.len(), "Resyncing kind");
                for object in objects {
                    if let Some(key) = key_of(&object) {
                        dispatch(shared, kind, key);
                    }
                }
            }
            Err(e) => warn!(kind, error = %e, "Resync list failed"),
        }
    }
}

fn dispatch(shared: &Arc<Shared>, kind: &'static str, key: ObjectKey) {
    if !shared.reconcilers.contains_key(kind) {
        return;
    }
    tokio::spawn(run_pass(shared.clone(), kind, key));
}

fn key_of(object: &Value) -> Option<ObjectKey> {
    let metadata = object.get("metadata")?;
    Some(ObjectKey {
        namespace: metadata
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_string),
        name: metadata.get("name")?.as_str()?.to_string(),
    })
}

async fn run_pass(shared: Arc<Shared>, kind: &'static str, key: ObjectKey) {
    let Some(reconciler) = shared.reconcilers.get(kind).cloned() else {
        return;
    };
    let component = reconciler.component();

    let start = Instant::now();
    let result = reconciler.reconcile(&key).await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(action) => {
            shared.metrics.observe_pass(component, "ok", elapsed);
            shared.health.record_pass(component, Ok(())).await;
            if let Action::Requeue(delay) = action {
                schedule(&shared, kind, key, delay);
            }
        }
        Err(e) => {
            shared.metrics.observe_pass(component, e.label(), elapsed);
            shared.health.record_pass(component, Err(&e)).await;

            if let MeteringError::Invariant(violation) = &e {
                // Not retried on a timer: the next change re-triggers the pass
                shared.logger.log_invariant_violation(
                    component,
                    &key.to_string(),
                    &violation.to_string(),
                );
            } else if e.is_retryable() {
                warn!(component, key = %key, error = %e, "Pass failed, requeueing");
                let delay = shared.error_requeue;
                schedule(&shared, kind, key, delay);
            } else {
                warn!(component, key = %key, error = %e, "Pass failed");
            }
        }
    }
}

/// Arm a timer unless an earlier one is already pending for the target
fn schedule(shared: &Arc<Shared>, kind: &'static str, key: ObjectKey, delay: Duration) {
    let deadline = Instant::now() + delay;
    let target = (kind, key);

    let pending = shared.scheduled.get(&target).map(|d| *d);
    if matches!(pending, Some(existing) if existing <= deadline) {
        return;
    }
    shared.scheduled.insert(target.clone(), deadline);

    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let fire = shared
            .scheduled
            .remove_if(&target, |_, d| *d == deadline)
            .is_some();
        if fire {
            // Receiver gone means the controller stopped
            let _ = shared.requeue_tx.send(target);
        }
    });
}
