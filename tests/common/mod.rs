//! Shared fixtures for integration tests: in-process counting processors,
//! an engine harness wired to the in-memory store, and polling helpers for
//! awaiting persisted states.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use pipeline_core::config::EngineConfig;
use pipeline_core::dispatcher::ServiceEngine;
use pipeline_core::error::{Result, ServiceError};
use pipeline_core::model::ServiceRecord;
use pipeline_core::persistence::{InMemoryServiceStore, ServiceStore};
use pipeline_core::processor::{ProcessorContext, ServiceProcessor};
use pipeline_core::registry::ProcessorRegistry;
use pipeline_core::runner::TokioProcessRunner;
use pipeline_core::state_machine::ServiceState;

pub struct TestHarness {
    pub engine: ServiceEngine,
    pub store: Arc<InMemoryServiceStore>,
    pub registry: Arc<ProcessorRegistry>,
}

/// Engine config tuned for fast tests: short poll interval, short retry
/// delays, deterministic backoff.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker_count = 4;
    config.poll_interval_ms = 50;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.retry.jitter = false;
    config
}

pub fn start_engine(registry: Arc<ProcessorRegistry>) -> TestHarness {
    let store = Arc::new(InMemoryServiceStore::new());
    let engine = ServiceEngine::start(
        fast_config(),
        Arc::clone(&store) as Arc<dyn ServiceStore>,
        Arc::clone(&registry),
        Arc::new(TokioProcessRunner::new()),
    );
    TestHarness {
        engine,
        store,
        registry,
    }
}

/// Poll the store until the record reaches `expected`.
///
/// Panics if the record lands in a different terminal state first, or after
/// five seconds without reaching it.
pub async fn wait_for_state(
    store: &InMemoryServiceStore,
    id: Uuid,
    expected: ServiceState,
) -> ServiceRecord {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = store.find_by_id(id).await.unwrap() {
            if record.state == expected {
                return record;
            }
            if record.state.is_terminal() {
                panic!(
                    "service {id} reached terminal state {} while waiting for {expected}",
                    record.state
                );
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for service {id} to reach {expected}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the store until the record reaches any terminal state
pub async fn wait_for_terminal(store: &InMemoryServiceStore, id: Uuid) -> ServiceRecord {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = store.find_by_id(id).await.unwrap() {
            if record.state.is_terminal() {
                return record;
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for service {id} to reach a terminal state"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Direct child of `parent_id` executing under the given processor name
pub async fn child_named(
    store: &InMemoryServiceStore,
    parent_id: Uuid,
    name: &str,
) -> ServiceRecord {
    store
        .find_children(parent_id)
        .await
        .unwrap()
        .into_iter()
        .find(|child| child.name == name)
        .unwrap_or_else(|| panic!("no child named {name} under {parent_id}"))
}

/// Leaf processor that counts invocations, optionally delays, and fails a
/// configurable number of times before succeeding.
pub struct RecordingProcessor {
    name: String,
    delay: Duration,
    available: bool,
    fail_times: AtomicU32,
    failure: ServiceError,
    pub process_calls: AtomicUsize,
    pub started: Mutex<Vec<(Uuid, Instant)>>,
    pub finished: Mutex<Vec<(Uuid, Instant)>>,
}

impl RecordingProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            available: false,
            fail_times: AtomicU32::new(0),
            failure: ServiceError::Execution {
                exit_code: Some(1),
                output_excerpt: "injected failure".to_string(),
            },
            process_calls: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report the result as already materialized, short-circuiting execution
    pub fn with_available_result(mut self) -> Self {
        self.available = true;
        self
    }

    /// Fail the first `times` process invocations with `error`
    pub fn failing(self, times: u32, error: ServiceError) -> Self {
        self.fail_times.store(times, Ordering::SeqCst);
        Self {
            failure: error,
            ..self
        }
    }

    pub fn calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceProcessor for RecordingProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_result_available(
        &self,
        _ctx: &ProcessorContext,
        _record: &ServiceRecord,
    ) -> Result<bool> {
        Ok(self.available)
    }

    async fn collect_result(
        &self,
        _ctx: &ProcessorContext,
        record: &ServiceRecord,
    ) -> Result<serde_json::Value> {
        Ok(json!({ "memoized": record.name }))
    }

    async fn process(
        &self,
        _ctx: &ProcessorContext,
        record: &ServiceRecord,
    ) -> Result<serde_json::Value> {
        self.started.lock().push((record.id, Instant::now()));
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        self.process_calls.fetch_add(1, Ordering::SeqCst);

        let outcome = if self
            .fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            Err(self.failure.clone())
        } else {
            Ok(json!({ "processed": record.name, "args": record.args }))
        };

        self.finished.lock().push((record.id, Instant::now()));
        outcome
    }
}

/// Orchestrating processor that decomposes into a fixed set of child
/// records, then combines their results.
pub struct DecomposingProcessor {
    name: String,
    children: Vec<(String, Vec<String>)>,
    pub process_calls: AtomicUsize,
    pub started: Mutex<Vec<(Uuid, Instant)>>,
}

impl DecomposingProcessor {
    pub fn new(
        name: impl Into<String>,
        children: Vec<(impl Into<String>, Vec<&str>)>,
    ) -> Self {
        Self {
            name: name.into(),
            children: children
                .into_iter()
                .map(|(child, args)| {
                    (
                        child.into(),
                        args.into_iter().map(str::to_string).collect(),
                    )
                })
                .collect(),
            process_calls: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceProcessor for DecomposingProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_dependencies(
        &self,
        _ctx: &ProcessorContext,
        record: &ServiceRecord,
    ) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .children
            .iter()
            .map(|(name, args)| {
                ServiceRecord::new(name, record.owner.clone())
                    .with_args(args.clone())
                    .with_parent(record.id)
            })
            .collect())
    }

    async fn process(
        &self,
        ctx: &ProcessorContext,
        record: &ServiceRecord,
    ) -> Result<serde_json::Value> {
        self.started.lock().push((record.id, Instant::now()));
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        let results = ctx.dependency_results(record).await?;
        Ok(json!({ "combined": results }))
    }
}
