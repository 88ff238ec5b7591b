//! # Service Engine
//!
//! The dispatcher: accepts service submissions, persists them, and hands
//! eligible records to a bounded worker pool. Suspended orchestrations are
//! resumed through completion watchers driven by the engine's own transition
//! handling, with a periodic readiness re-scan as the fallback, since the
//! persisted state is always the source of truth.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use uuid::Uuid;

use super::dedup::{DedupIndex, DedupOutcome};
use super::lifecycle;
use crate::async_result::AsyncResult;
use crate::config::EngineConfig;
use crate::error::{Result, ServiceError};
use crate::events::{TransitionEvent, TransitionPublisher};
use crate::model::ServiceRecord;
use crate::persistence::ServiceStore;
use crate::registry::ProcessorRegistry;
use crate::runner::ProcessRunner;
use crate::processor::ProcessorContext;
use crate::state_machine::{ServiceEvent, ServiceState, ServiceStateMachine};

/// Readiness of a record's dependency set
pub(crate) enum DependencyStatus {
    /// Every dependency is terminal-successful
    Ready,
    /// At least one dependency has not reached a terminal state
    Pending,
    /// A dependency reached a terminal failure state
    Failed(ServiceRecord),
}

pub(crate) struct EngineInner {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) store: Arc<dyn ServiceStore>,
    pub(crate) registry: Arc<ProcessorRegistry>,
    pub(crate) runner: Arc<dyn ProcessRunner>,
    pub(crate) publisher: TransitionPublisher,
    pub(crate) machine: ServiceStateMachine,
    pub(crate) dedup: DedupIndex,
    completions: DashMap<Uuid, AsyncResult<Value>>,
    cancel_signals: DashMap<Uuid, watch::Sender<bool>>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    shutdown_tx: watch::Sender<bool>,
}

impl EngineInner {
    /// Promise resolved when the record reaches a terminal state.
    ///
    /// Created on demand so watchers registered after resolution still fire.
    pub(crate) fn completion_for(&self, id: Uuid) -> AsyncResult<Value> {
        self.completions
            .entry(id)
            .or_insert_with(AsyncResult::pending)
            .clone()
    }

    /// Completion promise for a record, settled from the persisted record
    /// when it is already terminal.
    ///
    /// Finalized records are pruned from in-flight tracking, so a fresh
    /// promise for a terminal record must be resolved from the store.
    pub(crate) async fn completion_snapshot(&self, id: Uuid) -> Result<AsyncResult<Value>> {
        let completion = self.completion_for(id);
        if completion.is_resolved() {
            return Ok(completion);
        }
        let record = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::Infrastructure {
                message: format!("service {id} not found"),
            })?;
        if record.state.is_terminal() {
            Self::settle_from_record(&completion, &record);
            self.completions.remove(&id);
        }
        Ok(completion)
    }

    fn settle_from_record(completion: &AsyncResult<Value>, record: &ServiceRecord) {
        match record.state {
            ServiceState::Successful => {
                completion.complete(record.result.clone().unwrap_or(Value::Null));
            }
            ServiceState::Canceled => {
                completion.cancel();
            }
            ServiceState::Error | ServiceState::Timeout => {
                completion.fail(record.failure_cause.clone().unwrap_or_else(|| {
                    ServiceError::Infrastructure {
                        message: record.failure.clone().unwrap_or_else(|| {
                            format!("service {} ended in state {}", record.id, record.state)
                        }),
                    }
                }));
            }
            _ => {}
        }
    }

    /// Drop in-flight tracking for a finalized record.
    ///
    /// Must run after the completion promise is resolved; held clones keep
    /// delivering, and late queries are settled from the persisted record.
    pub(crate) fn prune(&self, id: Uuid) {
        self.completions.remove(&id);
        self.cancel_signals.remove(&id);
    }

    /// Per-record processor context carrying the cancellation signal
    pub(crate) fn context_for(&self, id: Uuid) -> ProcessorContext {
        let receiver = self
            .cancel_signals
            .entry(id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe();
        ProcessorContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&self.runner),
            receiver,
        )
    }

    pub(crate) fn requeue(&self, id: Uuid) {
        // A send error means the engine is shutting down; the poll fallback
        // or a restarted dispatcher picks the record up from the store.
        let _ = self.queue_tx.send(id);
    }

    /// Upper bound on process attempts: the record's own budget capped by
    /// the engine-wide retry policy.
    pub(crate) fn effective_max_attempts(&self, record: &ServiceRecord) -> u32 {
        record
            .max_attempts
            .max(1)
            .min(self.config.retry.max_attempts.max(1))
    }

    pub(crate) async fn dependency_status(
        &self,
        record: &ServiceRecord,
    ) -> Result<DependencyStatus> {
        let mut pending = false;
        for dependency_id in &record.depends_on {
            let dependency = self
                .store
                .find_by_id(*dependency_id)
                .await?
                .ok_or_else(|| ServiceError::Infrastructure {
                    message: format!("dependency {dependency_id} not found"),
                })?;
            if dependency.state.is_failed() {
                return Ok(DependencyStatus::Failed(dependency));
            }
            if !dependency.state.satisfies_dependents() {
                pending = true;
            }
        }
        Ok(if pending {
            DependencyStatus::Pending
        } else {
            DependencyStatus::Ready
        })
    }

    /// Register a watcher requeueing the record once every dependency is
    /// terminal (or the first one fails).
    pub(crate) async fn watch_dependencies(&self, record: &ServiceRecord) -> Result<()> {
        let mut completions = Vec::with_capacity(record.depends_on.len());
        for dependency_id in &record.depends_on {
            // Dependencies already terminal in the store may predate this
            // engine instance (or have been pruned); the snapshot settles
            // those from the persisted record so the watcher never hangs.
            completions.push(self.completion_snapshot(*dependency_id).await?);
        }

        let id = record.id;
        let queue = self.queue_tx.clone();
        AsyncResult::then_combine_all(completions, |_| ()).when_resolved(move |_| {
            let _ = queue.send(id);
        });
        Ok(())
    }

    /// Typed failure cause of a terminally-failed dependency.
    ///
    /// Prefers the in-memory completion outcome, then the persisted
    /// structured cause; the rendered text is the last resort for records
    /// persisted before a structured cause was stored.
    pub(crate) fn failure_cause_for(&self, dependency: &ServiceRecord) -> ServiceError {
        if let Some(outcome) = self
            .completions
            .get(&dependency.id)
            .and_then(|completion| completion.outcome())
        {
            match outcome {
                crate::async_result::Outcome::Failure(error) => return error,
                crate::async_result::Outcome::Canceled => {
                    return ServiceError::Canceled {
                        service_id: dependency.id,
                    }
                }
                crate::async_result::Outcome::Success(_) => {}
            }
        }

        if let Some(cause) = dependency.failure_cause.clone() {
            return cause;
        }

        ServiceError::Infrastructure {
            message: dependency.failure.clone().unwrap_or_else(|| {
                format!(
                    "dependency {} ended in state {}",
                    dependency.id, dependency.state
                )
            }),
        }
    }

    /// Whether any non-terminal record outside `excluded` depends on `id`.
    ///
    /// Deduplicated work may be shared across unrelated parents; a cascade
    /// must not cancel a record another live parent is still waiting on.
    pub(crate) async fn has_live_external_dependents(
        &self,
        id: Uuid,
        excluded: &HashSet<Uuid>,
    ) -> Result<bool> {
        let dependents = self.store.find_dependents(id).await?;
        Ok(dependents
            .iter()
            .any(|dependent| !excluded.contains(&dependent.id) && !dependent.state.is_terminal()))
    }

    /// Persist and enqueue a new record, returning its completion promise
    pub(crate) async fn submit_record(
        &self,
        mut record: ServiceRecord,
    ) -> Result<AsyncResult<Value>> {
        if !self.registry.contains(&record.name) {
            return Err(ServiceError::UnknownProcessor {
                name: record.name.clone(),
            });
        }
        for dependency_id in &record.depends_on {
            if self.store.find_by_id(*dependency_id).await?.is_none() {
                return Err(ServiceError::Validation {
                    message: format!(
                        "service {} depends on unknown record {dependency_id}",
                        record.name
                    ),
                });
            }
        }

        if record.stdout_path.is_none() {
            record.stdout_path = record.default_stdout_path();
        }
        if record.stderr_path.is_none() {
            record.stderr_path = record.default_stderr_path();
        }
        record.state = ServiceState::Created;

        self.store.save(&record).await?;
        let completion = self.completion_for(record.id);
        self.cancel_signals
            .entry(record.id)
            .or_insert_with(|| watch::channel(false).0);

        self.machine.transition(record.id, ServiceEvent::Enqueue).await?;
        self.requeue(record.id);

        tracing::info!(
            service_id = %record.id,
            service_name = %record.name,
            owner = %record.owner,
            parent_id = ?record.parent_id,
            dependency_count = record.depends_on.len(),
            "service submitted"
        );
        Ok(completion)
    }

    /// Submit a candidate dependency under a parent, reusing an equivalent
    /// already-registered record when the fingerprints match.
    ///
    /// The claim is atomic, so racing decompositions of equivalent work end
    /// up sharing a single child record.
    pub(crate) async fn submit_dependency(
        &self,
        parent: &ServiceRecord,
        mut candidate: ServiceRecord,
    ) -> Result<Uuid> {
        if candidate.parent_id.is_none() {
            candidate.parent_id = Some(parent.id);
        }
        let fingerprint = candidate.fingerprint();
        let candidate_id = candidate.id;

        match self.dedup.claim(&fingerprint, candidate_id) {
            DedupOutcome::Existing(existing) => {
                tracing::debug!(
                    parent_id = %parent.id,
                    existing_id = %existing,
                    service_name = %candidate.name,
                    "reusing equivalent dependency"
                );
                Ok(existing)
            }
            DedupOutcome::New => match self.submit_record(candidate).await {
                Ok(_) => Ok(candidate_id),
                Err(error) => {
                    self.dedup.release(&fingerprint, candidate_id);
                    Err(error)
                }
            },
        }
    }
}

/// Handle on a running orchestration engine.
///
/// Construct one per process with [`ServiceEngine::start`] and pass it by
/// reference; there is no global engine instance.
#[derive(Clone)]
pub struct ServiceEngine {
    inner: Arc<EngineInner>,
}

impl ServiceEngine {
    /// Start the engine: spawns the worker pool and the readiness re-scan
    /// task, then returns the handle.
    pub fn start(
        config: EngineConfig,
        store: Arc<dyn ServiceStore>,
        registry: Arc<ProcessorRegistry>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let config = Arc::new(config);
        let publisher = TransitionPublisher::new(config.event_channel_capacity);
        let machine = ServiceStateMachine::new(Arc::clone(&store), publisher.clone());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(EngineInner {
            config: Arc::clone(&config),
            store,
            registry,
            runner,
            publisher,
            machine,
            dedup: DedupIndex::new(),
            completions: DashMap::new(),
            cancel_signals: DashMap::new(),
            queue_tx,
            shutdown_tx,
        });

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker_id in 0..config.worker_count.max(1) {
            let engine = Arc::clone(&inner);
            let queue = Arc::clone(&queue_rx);
            let mut shutdown = inner.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = queue.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => None,
                            id = rx.recv() => id,
                        }
                    };
                    let Some(id) = next else { break };
                    lifecycle::run(&engine, id).await;
                }
                tracing::debug!(worker_id, "worker stopped");
            });
        }

        {
            // Poll fallback: push notifications cover the common case, but
            // the persisted state is authoritative, so waiting records are
            // re-scanned for readiness on an interval.
            let engine = Arc::clone(&inner);
            let mut shutdown = inner.shutdown_tx.subscribe();
            let interval = Duration::from_millis(config.poll_interval_ms.max(50));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(error) = rescan_waiting(&engine).await {
                        tracing::warn!(error = %error, "waiting readiness re-scan failed");
                    }
                }
                tracing::debug!("readiness re-scan stopped");
            });
        }

        Self { inner }
    }

    /// Submit a record for orchestration.
    ///
    /// The record is persisted, queued, and eventually driven through its
    /// processor's lifecycle; the returned promise resolves at its terminal
    /// state.
    pub async fn submit(&self, record: ServiceRecord) -> Result<AsyncResult<Value>> {
        self.inner.submit_record(record).await
    }

    /// Cancel a record and, recursively, its not-yet-terminal descendants.
    ///
    /// In-flight external processes receive a kill; already-terminal
    /// children are left untouched. A descendant that another live record
    /// outside this hierarchy still depends on (deduplicated work is shared
    /// across parents) is spared along with its subtree.
    pub async fn cancel(&self, root_id: Uuid) -> Result<()> {
        let hierarchy = self.inner.store.find_hierarchy(root_id).await?;
        if hierarchy.is_empty() {
            return Err(ServiceError::Infrastructure {
                message: format!("service {root_id} not found"),
            });
        }
        let hierarchy_ids: HashSet<Uuid> = hierarchy.iter().map(|record| record.id).collect();

        let mut frontier = vec![root_id];
        while let Some(id) = frontier.pop() {
            let Some(record) = self.inner.store.find_by_id(id).await? else {
                continue;
            };
            if id != root_id
                && self
                    .inner
                    .has_live_external_dependents(id, &hierarchy_ids)
                    .await?
            {
                tracing::debug!(
                    service_id = %id,
                    root_id = %root_id,
                    "sparing shared dependency with live dependents outside the canceled tree"
                );
                continue;
            }

            if !record.state.is_terminal() {
                if let Some(signal) = self.inner.cancel_signals.get(&record.id) {
                    let _ = signal.send(true);
                }
                match self
                    .inner
                    .machine
                    .transition(record.id, ServiceEvent::Cancel)
                    .await
                {
                    Ok(_) => {
                        self.inner
                            .store
                            .update_failure(
                                record.id,
                                ServiceError::Canceled {
                                    service_id: record.id,
                                },
                            )
                            .await?;
                        self.inner
                            .dedup
                            .release(&record.fingerprint(), record.id);
                        self.inner.completion_for(record.id).cancel();
                        self.inner.prune(record.id);
                        tracing::info!(service_id = %record.id, root_id = %root_id, "service canceled");
                    }
                    // A worker finalized the record first; its own terminal
                    // handling resolved the completion.
                    Err(ServiceError::InvalidTransition { .. }) => {
                        tracing::debug!(service_id = %record.id, "cancel lost to concurrent transition");
                    }
                    Err(error) => return Err(error),
                }
            }

            for child in self.inner.store.find_children(id).await? {
                frontier.push(child.id);
            }
        }
        Ok(())
    }

    /// Completion promise for a submitted record.
    ///
    /// Finalized records are no longer tracked in memory; those are served
    /// as already-resolved promises rebuilt from the persisted record.
    pub async fn completion(&self, id: Uuid) -> Result<AsyncResult<Value>> {
        self.inner.completion_snapshot(id).await
    }

    /// Number of in-flight completion promises currently tracked
    pub fn tracked_completions(&self) -> usize {
        self.inner.completions.len()
    }

    /// Number of in-flight cancellation signals currently tracked
    pub fn tracked_cancel_signals(&self) -> usize {
        self.inner.cancel_signals.len()
    }

    /// Subscribe to typed state-transition events
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.inner.publisher.subscribe()
    }

    /// The persistence collaborator backing this engine
    pub fn store(&self) -> Arc<dyn ServiceStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Stop workers and the re-scan task after their current item
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

async fn rescan_waiting(engine: &Arc<EngineInner>) -> Result<()> {
    let mut waiting = engine.store.find_by_state(ServiceState::Suspended).await?;
    // Queued records may have lost their in-memory queue slot or dependency
    // watcher across a restart; the persisted state is authoritative.
    waiting.extend(engine.store.find_by_state(ServiceState::Queued).await?);

    for record in waiting {
        if record
            .not_before
            .is_some_and(|not_before| chrono::Utc::now() < not_before)
        {
            continue;
        }
        match engine.dependency_status(&record).await? {
            DependencyStatus::Pending => {}
            DependencyStatus::Ready | DependencyStatus::Failed(_) => {
                tracing::debug!(service_id = %record.id, state = %record.state, "re-scan requeueing waiting record");
                engine.requeue(record.id);
            }
        }
    }
    Ok(())
}
