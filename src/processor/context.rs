use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Result, ServiceError};
use crate::model::ServiceRecord;
use crate::persistence::ServiceStore;
use crate::runner::ProcessRunner;

/// Everything a processor may reach while executing a lifecycle stage.
///
/// Built by the dispatcher per record and passed explicitly; processors hold
/// no global state and never reach the engine through static accessors.
#[derive(Clone)]
pub struct ProcessorContext {
    store: Arc<dyn ServiceStore>,
    config: Arc<EngineConfig>,
    runner: Arc<dyn ProcessRunner>,
    cancel: watch::Receiver<bool>,
}

impl ProcessorContext {
    pub fn new(
        store: Arc<dyn ServiceStore>,
        config: Arc<EngineConfig>,
        runner: Arc<dyn ProcessRunner>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            runner,
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runner(&self) -> &Arc<dyn ProcessRunner> {
        &self.runner
    }

    /// Whether cancellation has been requested for the owning record
    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// A fresh receiver on the cancellation signal, for use in `select!`
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    /// Collected result payloads of the record's dependencies, in
    /// `depends_on` order. Dependencies without a payload contribute `null`.
    pub async fn dependency_results(
        &self,
        record: &ServiceRecord,
    ) -> Result<Vec<serde_json::Value>> {
        let mut results = Vec::with_capacity(record.depends_on.len());
        for dependency_id in &record.depends_on {
            let dependency = self.load_dependency(*dependency_id).await?;
            results.push(dependency.result.unwrap_or(serde_json::Value::Null));
        }
        Ok(results)
    }

    /// Load the full records of the record's dependencies
    pub async fn dependency_records(&self, record: &ServiceRecord) -> Result<Vec<ServiceRecord>> {
        let mut records = Vec::with_capacity(record.depends_on.len());
        for dependency_id in &record.depends_on {
            records.push(self.load_dependency(*dependency_id).await?);
        }
        Ok(records)
    }

    async fn load_dependency(&self, dependency_id: Uuid) -> Result<ServiceRecord> {
        self.store
            .find_by_id(dependency_id)
            .await?
            .ok_or_else(|| ServiceError::Infrastructure {
                message: format!("dependency {dependency_id} not found"),
            })
    }
}
