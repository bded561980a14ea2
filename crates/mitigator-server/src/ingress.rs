//! Alert Ingress
//!
//! A bounded queue feeds one dedicated alert worker. The worker drains
//! alerts strictly in arrival order and runs the attack-graph step for
//! each before touching the next, preserving the engine's ordering
//! semantics; planning and dispatch for an alert are spawned off so they
//! overlap with the next alert's graph step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mitigator_core::graphdb::GraphQuery;
use mitigator_core::{AttackEngine, Catalogs, Dispatcher, MappingSchema, Planner};

/// Handle used by the HTTP API and the bus subscriber to enqueue raw
/// alert documents.
#[derive(Clone)]
pub struct AlertQueue {
    tx: mpsc::Sender<Value>,
    dropped: Arc<AtomicU64>,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue without waiting; a full queue drops the alert.
    pub fn try_push(&self, doc: Value) -> bool {
        match self.tx.try_send(doc) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("alert queue full, dropping alert");
                false
            }
        }
    }

    /// Enqueue, waiting for room. Fails only once the worker is gone.
    pub async fn push(&self, doc: Value) -> bool {
        self.tx.send(doc).await.is_ok()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Ingress counters. `unmitigated` is shared with the spawned mitigation
/// tasks.
#[derive(Default)]
struct WorkerStats {
    received: AtomicU64,
    malformed: AtomicU64,
    unmitigated: Arc<AtomicU64>,
}

/// The dedicated alert worker. Owns the attack engine exclusively.
pub struct AlertWorker {
    schema: MappingSchema,
    engine: AttackEngine,
    planner: Arc<Planner>,
    dispatcher: Arc<Dispatcher>,
    catalogs: Arc<Catalogs>,
    graphdb: Arc<dyn GraphQuery>,
    stats: WorkerStats,
    inflight: Vec<JoinHandle<()>>,
}

impl AlertWorker {
    pub fn new(
        schema: MappingSchema,
        engine: AttackEngine,
        planner: Arc<Planner>,
        dispatcher: Arc<Dispatcher>,
        catalogs: Arc<Catalogs>,
        graphdb: Arc<dyn GraphQuery>,
    ) -> Self {
        Self {
            schema,
            engine,
            planner,
            dispatcher,
            catalogs,
            graphdb,
            stats: WorkerStats::default(),
            inflight: Vec::new(),
        }
    }

    /// Drain the queue until every sender is gone, then wait for
    /// outstanding plan/dispatch work.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Value>) {
        while let Some(doc) = rx.recv().await {
            self.handle(doc).await;
        }
        tracing::info!("alert queue drained, waiting for in-flight mitigations");
        for handle in self.inflight.drain(..) {
            handle.await.ok();
        }
        tracing::info!(
            received = self.stats.received.load(Ordering::Relaxed),
            malformed = self.stats.malformed.load(Ordering::Relaxed),
            unmitigated = self.stats.unmitigated.load(Ordering::Relaxed),
            "alert worker stopped"
        );
    }

    async fn handle(&mut self, doc: Value) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let alert = match self.schema.normalize(&doc) {
            Ok(alert) => Arc::new(alert),
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "dropping malformed alert");
                return;
            }
        };
        tracing::info!(
            description = %alert.description,
            techniques = ?alert.techniques,
            "processing alert"
        );

        let outcome = self.engine.step(Arc::clone(&alert)).await;
        for trigger in &outcome.triggers {
            tracing::info!(graph = trigger.graph, node = trigger.node, "attack node triggered");
        }
        for risky in &outcome.risky_nodes {
            tracing::warn!(graph = risky.graph, node = risky.node, "node behind a live front has been persistently risky");
        }
        for likely in &outcome.likely_nodes {
            tracing::warn!(graph = likely.graph, node = likely.node, "node ahead of a live front is likely to execute");
        }

        // The graph mutation is committed; planning and dispatch may
        // overlap with the next alert.
        self.inflight.retain(|handle| !handle.is_finished());
        let planner = Arc::clone(&self.planner);
        let dispatcher = Arc::clone(&self.dispatcher);
        let catalogs = Arc::clone(&self.catalogs);
        let graphdb = Arc::clone(&self.graphdb);
        let unmitigated = Arc::clone(&self.stats.unmitigated);
        self.inflight.push(tokio::spawn(async move {
            let plan = planner
                .plan(&[alert], catalogs.as_ref(), graphdb.as_ref())
                .await;
            unmitigated.fetch_add(plan.unmitigated.len() as u64, Ordering::Relaxed);
            let outcomes = dispatcher.dispatch(&plan).await;
            for outcome in outcomes.iter().filter(|o| !o.succeeded()) {
                tracing::error!(
                    workflow = %outcome.name,
                    url = %outcome.url,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "mitigation workflow failed"
                );
            }
        }));
    }
}
