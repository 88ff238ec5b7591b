//! # Lifecycle Driver
//!
//! Drives one service record through its staged lifecycle on a worker:
//! pre-process, result probe, dependency submission, suspension, final
//! processing, post-process. Suspension never holds the worker: the record
//! is parked in the `Suspended` state and resumed by a completion watcher
//! (or the dispatcher's readiness re-scan) on a later worker.

use std::sync::Arc;

use super::core::{DependencyStatus, EngineInner};
use crate::error::{LifecycleStage, Result, ServiceError};
use crate::model::ServiceRecord;
use crate::processor::{ProcessorContext, ServiceProcessor};
use crate::state_machine::{ServiceEvent, ServiceState};

/// Entry point for workers: run whatever stage the record's persisted state
/// calls for. Errors here are engine-level (store failures); stage failures
/// are finalized into the record instead of bubbling out.
pub(crate) async fn run(engine: &Arc<EngineInner>, id: uuid::Uuid) {
    if let Err(error) = drive(engine, id).await {
        tracing::error!(service_id = %id, error = %error, "lifecycle driver failed");
    }
}

async fn drive(engine: &Arc<EngineInner>, id: uuid::Uuid) -> Result<()> {
    let Some(record) = engine.store.find_by_id(id).await? else {
        tracing::warn!(service_id = %id, "queued record no longer exists");
        return Ok(());
    };

    match record.state {
        ServiceState::Queued => run_from_queued(engine, record).await,
        ServiceState::Suspended => run_from_suspended(engine, record).await,
        other => {
            // Lost a pickup race or the record was canceled while queued.
            tracing::debug!(service_id = %id, state = %other, "skipping record not eligible to run");
            Ok(())
        }
    }
}

async fn run_from_queued(engine: &Arc<EngineInner>, record: ServiceRecord) -> Result<()> {
    // A record parked for retry backoff is not eligible until its scheduled
    // time; the retry timer (or a later re-scan) delivers it.
    if record
        .not_before
        .is_some_and(|not_before| chrono::Utc::now() < not_before)
    {
        return Ok(());
    }

    // Dependency failure must be observed before the final stage would start.
    if !record.depends_on.is_empty() {
        match engine.dependency_status(&record).await? {
            DependencyStatus::Failed(dependency) => {
                return fail_for_dependency(engine, &record, &dependency).await;
            }
            DependencyStatus::Pending => {
                engine.watch_dependencies(&record).await?;
                return Ok(());
            }
            DependencyStatus::Ready => {}
        }
    }

    if !transition_or_skip(engine, record.id, ServiceEvent::Start).await? {
        return Ok(());
    }

    let processor = match engine.registry.resolve(&record.name) {
        Ok(processor) => processor,
        Err(error) => return finalize_failure(engine, &record, error).await,
    };
    let ctx = engine.context_for(record.id);

    if let Err(error) = processor.pre_process(&ctx, &record).await {
        let wrapped = error.at_stage(record.id, LifecycleStage::PreProcess);
        return finalize_failure(engine, &record, wrapped).await;
    }

    // Memoization: an already-materialized result short-circuits directly to
    // success without invoking process. Only first-time submissions consult
    // the probe; a failed attempt may leave partial output behind.
    let available = if record.attempts == 0 {
        processor.is_result_available(&ctx, &record).await
    } else {
        Ok(false)
    };
    match available {
        Ok(true) => {
            return match processor.collect_result(&ctx, &record).await {
                Ok(value) => {
                    tracing::info!(service_id = %record.id, "result already available; skipping execution");
                    finalize_success(engine, &record, value).await
                }
                Err(error) => {
                    let wrapped = error.at_stage(record.id, LifecycleStage::CollectResult);
                    finalize_failure(engine, &record, wrapped).await
                }
            };
        }
        Ok(false) => {}
        Err(error) => {
            let wrapped = error.at_stage(record.id, LifecycleStage::ResultProbe);
            return finalize_failure(engine, &record, wrapped).await;
        }
    }

    let children = match processor.submit_dependencies(&ctx, &record).await {
        Ok(children) => children,
        Err(error) => {
            let wrapped = error.at_stage(record.id, LifecycleStage::SubmitDependencies);
            return finalize_failure(engine, &record, wrapped).await;
        }
    };

    if !children.is_empty() {
        for child in children {
            let dependency_id = match engine.submit_dependency(&record, child).await {
                Ok(dependency_id) => dependency_id,
                Err(error) => {
                    let wrapped = error.at_stage(record.id, LifecycleStage::SubmitDependencies);
                    return finalize_failure(engine, &record, wrapped).await;
                }
            };
            engine.store.add_dependency(record.id, dependency_id).await?;
        }

        // Park the record and free this worker; a completion watcher (or the
        // readiness re-scan) requeues it once the sub-DAG is terminal.
        if !transition_or_skip(engine, record.id, ServiceEvent::Suspend).await? {
            return Ok(());
        }
        let Some(suspended) = engine.store.find_by_id(record.id).await? else {
            return Ok(());
        };
        engine.watch_dependencies(&suspended).await?;
        tracing::debug!(
            service_id = %record.id,
            dependency_count = suspended.depends_on.len(),
            "suspended awaiting dependencies"
        );
        return Ok(());
    }

    run_final_stages(engine, processor.as_ref(), &ctx, &record).await
}

async fn run_from_suspended(engine: &Arc<EngineInner>, record: ServiceRecord) -> Result<()> {
    match engine.dependency_status(&record).await? {
        DependencyStatus::Failed(dependency) => {
            fail_for_dependency(engine, &record, &dependency).await
        }
        // Spurious requeue from the poll fallback; the watcher will fire
        // again once the remaining dependencies settle.
        DependencyStatus::Pending => Ok(()),
        DependencyStatus::Ready => {
            if !transition_or_skip(engine, record.id, ServiceEvent::Resume).await? {
                return Ok(());
            }
            let processor = match engine.registry.resolve(&record.name) {
                Ok(processor) => processor,
                Err(error) => return finalize_failure(engine, &record, error).await,
            };
            let ctx = engine.context_for(record.id);
            run_final_stages(engine, processor.as_ref(), &ctx, &record).await
        }
    }
}

/// Run `process` (with retry policy) and `post_process`, then finalize.
async fn run_final_stages(
    engine: &Arc<EngineInner>,
    processor: &dyn ServiceProcessor,
    ctx: &ProcessorContext,
    record: &ServiceRecord,
) -> Result<()> {
    let max_attempts = engine.effective_max_attempts(record);
    let attempts = engine.store.increment_attempts(record.id).await?;

    let value = match processor.process(ctx, record).await {
        Ok(value) => value,
        Err(error) if matches!(error.root_cause(), ServiceError::Canceled { .. }) => {
            return finalize_canceled(engine, record).await;
        }
        Err(error) => {
            let wrapped = error.at_stage(record.id, LifecycleStage::Process);
            if wrapped.is_retryable() && attempts < max_attempts {
                return park_for_retry(engine, record, attempts, max_attempts, wrapped).await;
            }
            return finalize_failure(engine, record, wrapped).await;
        }
    };

    match processor.post_process(ctx, record, value).await {
        Ok(value) => finalize_success(engine, record, value).await,
        Err(error) => {
            let wrapped = error.at_stage(record.id, LifecycleStage::PostProcess);
            finalize_failure(engine, record, wrapped).await
        }
    }
}

/// Park a retryable failure: the record goes back to the queue with an
/// eligibility time and a timer requeues it once the backoff delay elapses,
/// so no worker is held across the wait.
async fn park_for_retry(
    engine: &Arc<EngineInner>,
    record: &ServiceRecord,
    attempts: u32,
    max_attempts: u32,
    error: ServiceError,
) -> Result<()> {
    let delay = engine.config.retry.delay_for(attempts);
    tracing::warn!(
        service_id = %record.id,
        attempts,
        max_attempts,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "process stage failed; scheduling retry"
    );

    let not_before = chrono::Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
    engine.store.schedule_retry(record.id, not_before).await?;

    if transition_or_skip(engine, record.id, ServiceEvent::Requeue).await? {
        let engine = Arc::clone(engine);
        let id = record.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.requeue(id);
        });
    }
    Ok(())
}

async fn fail_for_dependency(
    engine: &Arc<EngineInner>,
    record: &ServiceRecord,
    dependency: &ServiceRecord,
) -> Result<()> {
    let error = ServiceError::DependencyFailure {
        service_id: record.id,
        dependency_id: dependency.id,
        cause: Box::new(engine.failure_cause_for(dependency)),
    };
    finalize_failure(engine, record, error).await
}

async fn finalize_success(
    engine: &Arc<EngineInner>,
    record: &ServiceRecord,
    value: serde_json::Value,
) -> Result<()> {
    engine.store.update_result(record.id, value.clone()).await?;

    if transition_or_skip(engine, record.id, ServiceEvent::Complete).await? {
        tracing::info!(service_id = %record.id, service_name = %record.name, "service successful");
        engine.completion_for(record.id).complete(value);
        engine.prune(record.id);
    } else {
        // A cancelation landed first; the completion was resolved there.
        tracing::debug!(service_id = %record.id, "completion lost to a concurrent terminal transition");
    }
    Ok(())
}

async fn finalize_failure(
    engine: &Arc<EngineInner>,
    record: &ServiceRecord,
    error: ServiceError,
) -> Result<()> {
    // Dependency failures always settle as Error; only a directly timed-out
    // or canceled record takes the dedicated terminal state.
    let event = if matches!(error, ServiceError::DependencyFailure { .. }) {
        ServiceEvent::Fail
    } else {
        match error.root_cause() {
            ServiceError::Timeout { .. } => ServiceEvent::TimeoutExpired,
            ServiceError::Canceled { .. } => ServiceEvent::Cancel,
            _ => ServiceEvent::Fail,
        }
    };

    engine.store.update_failure(record.id, error.clone()).await?;
    engine.dedup.release(&record.fingerprint(), record.id);

    if transition_or_skip(engine, record.id, event).await? {
        tracing::warn!(
            service_id = %record.id,
            service_name = %record.name,
            error = %error,
            "service failed"
        );
        if event == ServiceEvent::Cancel {
            engine.completion_for(record.id).cancel();
        } else {
            engine.completion_for(record.id).fail(error);
        }
        // Pruning belongs to whoever resolved the promise; a lost
        // compare-and-set means the winner will prune.
        engine.prune(record.id);
    }
    Ok(())
}

async fn finalize_canceled(engine: &Arc<EngineInner>, record: &ServiceRecord) -> Result<()> {
    engine
        .store
        .update_failure(
            record.id,
            ServiceError::Canceled {
                service_id: record.id,
            },
        )
        .await?;
    engine.dedup.release(&record.fingerprint(), record.id);
    if transition_or_skip(engine, record.id, ServiceEvent::Cancel).await? {
        tracing::info!(service_id = %record.id, "service canceled during execution");
    }
    engine.completion_for(record.id).cancel();
    engine.prune(record.id);
    Ok(())
}

/// Apply a transition, treating a compare-and-set loss as "someone else owns
/// this record now" rather than an error.
async fn transition_or_skip(
    engine: &Arc<EngineInner>,
    id: uuid::Uuid,
    event: ServiceEvent,
) -> Result<bool> {
    match engine.machine.transition(id, event).await {
        Ok(_) => Ok(true),
        Err(ServiceError::InvalidTransition { .. }) => Ok(false),
        Err(error) => Err(error),
    }
}
