use async_trait::async_trait;

use super::context::ProcessorContext;
use crate::error::Result;
use crate::model::ServiceRecord;

/// Generic lifecycle contract every unit of work implements.
///
/// The dispatcher drives the stages in order: `pre_process`, the result
/// probe (`is_result_available` / `collect_result`), `submit_dependencies`,
/// `process`, `post_process`. A processor overrides only the stages it
/// needs; an error at any stage is wrapped with the record id and stage name
/// and short-circuits the remaining stages.
///
/// Processors that decompose their work override `submit_dependencies` to
/// return child records; the dispatcher dedups, submits, and suspends the
/// parent until the sub-DAG is terminal before invoking `process`.
impl std::fmt::Debug for dyn ServiceProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProcessor")
            .field("name", &self.name())
            .finish()
    }
}

#[async_trait]
pub trait ServiceProcessor: Send + Sync {
    /// Registry key this processor is resolved under
    fn name(&self) -> &str;

    /// Validation and preparation, e.g. creating output directories.
    ///
    /// Fails fast on missing or invalid arguments with
    /// [`crate::error::ServiceError::Validation`].
    async fn pre_process(&self, _ctx: &ProcessorContext, _record: &ServiceRecord) -> Result<()> {
        Ok(())
    }

    /// Pure, side-effect-free probe for an already-materialized result.
    ///
    /// Must be safe to call repeatedly and from multiple workers. When this
    /// returns true, `collect_result` short-circuits directly to success and
    /// `process` is never invoked.
    async fn is_result_available(
        &self,
        _ctx: &ProcessorContext,
        _record: &ServiceRecord,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Collect the already-materialized result after a positive probe
    async fn collect_result(
        &self,
        _ctx: &ProcessorContext,
        _record: &ServiceRecord,
    ) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    /// Construct child records decomposing this unit of work into sub-steps.
    ///
    /// Returned records should carry this record's id as their parent; the
    /// dispatcher replaces candidates that normalize equal to an
    /// already-submitted sibling with the existing record.
    async fn submit_dependencies(
        &self,
        _ctx: &ProcessorContext,
        _record: &ServiceRecord,
    ) -> Result<Vec<ServiceRecord>> {
        Ok(Vec::new())
    }

    /// The actual work. Runs only after every dependency is
    /// terminal-successful.
    async fn process(
        &self,
        ctx: &ProcessorContext,
        record: &ServiceRecord,
    ) -> Result<serde_json::Value>;

    /// Cleanup, e.g. deleting scratch directories. The result passes through
    /// unchanged unless cleanup itself fails.
    async fn post_process(
        &self,
        _ctx: &ProcessorContext,
        _record: &ServiceRecord,
        result: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Ok(result)
    }
}
