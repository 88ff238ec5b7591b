//! External-process execution tests driving real `/bin/sh` invocations
//! through the engine, with output capture, error-pattern scanning,
//! timeouts, memoization probes, and in-flight cancellation.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use pipeline_core::error::ServiceError;
use pipeline_core::model::ServiceRecord;
use pipeline_core::processor::{
    ErrorPatternMatcher, ExternalExecutionProcessor, FileResultProbe,
};
use pipeline_core::registry::ProcessorRegistry;
use pipeline_core::script::PassthroughRenderer;
use pipeline_core::state_machine::ServiceState;

use common::{start_engine, wait_for_state, wait_for_terminal, TestHarness};

fn shell_harness(name: &str) -> TestHarness {
    let registry = Arc::new(ProcessorRegistry::new());
    registry.register_instance(Arc::new(ExternalExecutionProcessor::new(
        name,
        Arc::new(PassthroughRenderer::new("/bin/sh")),
    )));
    start_engine(registry)
}

#[tokio::test]
async fn test_shell_command_runs_and_captures_output() {
    let harness = shell_harness("shell");
    let workspace = tempfile::tempdir().unwrap();

    let record = ServiceRecord::new("shell", "pipeline")
        .with_args(["-c", "echo processing complete"])
        .with_workspace(workspace.path());
    let id = record.id;
    let completion = harness.engine.submit(record).await.unwrap();

    let outcome = completion.wait().await;
    let value = outcome.success().unwrap();
    assert_eq!(value["exit_code"], 0);

    let stored = wait_for_state(&harness.store, id, ServiceState::Successful).await;
    let stdout_path = stored.stdout_path.unwrap();
    let captured = tokio::fs::read_to_string(&stdout_path).await.unwrap();
    assert!(captured.contains("processing complete"));
    harness.engine.shutdown();
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_exit_code() {
    let harness = shell_harness("shell");
    let workspace = tempfile::tempdir().unwrap();

    let record = ServiceRecord::new("shell", "pipeline")
        .with_args(["-c", "echo broken >&2; exit 2"])
        .with_workspace(workspace.path());
    let id = record.id;
    let completion = harness.engine.submit(record).await.unwrap();

    let outcome = completion.wait().await;
    let error = outcome.failure().cloned().unwrap();
    match error.root_cause() {
        ServiceError::Execution {
            exit_code,
            output_excerpt,
        } => {
            assert_eq!(*exit_code, Some(2));
            assert!(output_excerpt.contains("broken"));
        }
        other => panic!("expected execution failure, got {other:?}"),
    }

    let stored = wait_for_terminal(&harness.store, id).await;
    assert_eq!(stored.state, ServiceState::Error);
    harness.engine.shutdown();
}

#[tokio::test]
async fn test_error_pattern_overrides_clean_exit() {
    let harness = shell_harness("shell");
    let workspace = tempfile::tempdir().unwrap();

    // Exit code 0, but the captured output carries a fatal error line.
    let record = ServiceRecord::new("shell", "pipeline")
        .with_args(["-c", "echo 'ERROR out of memory'; exit 0"])
        .with_workspace(workspace.path());
    let id = record.id;
    let completion = harness.engine.submit(record).await.unwrap();

    let outcome = completion.wait().await;
    let error = outcome.failure().cloned().unwrap();
    match error.root_cause() {
        ServiceError::Execution {
            exit_code,
            output_excerpt,
        } => {
            assert_eq!(*exit_code, Some(0));
            assert!(output_excerpt.contains("ERROR out of memory"));
        }
        other => panic!("expected execution failure, got {other:?}"),
    }

    let stored = wait_for_terminal(&harness.store, id).await;
    assert_eq!(stored.state, ServiceState::Error);
    harness.engine.shutdown();
}

#[tokio::test]
async fn test_custom_matcher_accepts_benign_output() {
    let registry = Arc::new(ProcessorRegistry::new());
    registry.register_instance(Arc::new(
        ExternalExecutionProcessor::new("shell", Arc::new(PassthroughRenderer::new("/bin/sh")))
            .with_matcher(ErrorPatternMatcher::none()),
    ));
    let harness = start_engine(registry);
    let workspace = tempfile::tempdir().unwrap();

    let record = ServiceRecord::new("shell", "pipeline")
        .with_args(["-c", "echo 'ERROR tolerated by this tool'"])
        .with_workspace(workspace.path());
    let completion = harness.engine.submit(record).await.unwrap();

    assert!(completion.wait().await.is_success());
    harness.engine.shutdown();
}

#[tokio::test]
async fn test_timeout_kills_process_and_settles_as_timeout() {
    let harness = shell_harness("shell");
    let workspace = tempfile::tempdir().unwrap();

    let record = ServiceRecord::new("shell", "pipeline")
        .with_args(["-c", "sleep 30"])
        .with_workspace(workspace.path())
        .with_timeout(Duration::from_millis(200));
    let id = record.id;
    let completion = harness.engine.submit(record).await.unwrap();

    let outcome = completion.wait().await;
    let error = outcome.failure().cloned().unwrap();
    assert!(matches!(error.root_cause(), ServiceError::Timeout { .. }));

    let stored = wait_for_terminal(&harness.store, id).await;
    assert_eq!(stored.state, ServiceState::Timeout);
    harness.engine.shutdown();
}

#[tokio::test]
async fn test_probe_skips_execution_when_output_exists() {
    let workspace = tempfile::tempdir().unwrap();
    let output_path = workspace.path().join("result.raw");
    tokio::fs::write(&output_path, b"materialized earlier")
        .await
        .unwrap();

    // The wrapped program always fails, so a run would be unmistakable.
    let registry = Arc::new(ProcessorRegistry::new());
    registry.register_instance(Arc::new(
        ExternalExecutionProcessor::new("convert", Arc::new(PassthroughRenderer::new("/bin/false")))
            .with_probe(Arc::new(FileResultProbe::for_flag("-output"))),
    ));
    let harness = start_engine(registry);

    let record = ServiceRecord::new("convert", "pipeline")
        .with_args(["-output", output_path.to_str().unwrap()])
        .with_workspace(workspace.path());
    let id = record.id;
    let completion = harness.engine.submit(record).await.unwrap();

    let outcome = completion.wait().await;
    assert!(outcome.is_success());
    let stored = wait_for_terminal(&harness.store, id).await;
    assert_eq!(stored.state, ServiceState::Successful);
    harness.engine.shutdown();
}

#[tokio::test]
async fn test_missing_workspace_fails_validation() {
    let harness = shell_harness("shell");

    let record = ServiceRecord::new("shell", "pipeline").with_args(["-c", "true"]);
    let completion = harness.engine.submit(record).await.unwrap();

    let outcome = completion.wait().await;
    let error = outcome.failure().cloned().unwrap();
    assert!(matches!(
        error.root_cause(),
        ServiceError::Validation { .. }
    ));
    harness.engine.shutdown();
}

#[tokio::test]
async fn test_cancel_kills_in_flight_process() {
    let harness = shell_harness("shell");
    let workspace = tempfile::tempdir().unwrap();

    let record = ServiceRecord::new("shell", "pipeline")
        .with_args(["-c", "sleep 30"])
        .with_workspace(workspace.path());
    let id = record.id;
    let completion = harness.engine.submit(record).await.unwrap();

    wait_for_state(&harness.store, id, ServiceState::Running).await;
    // Give the runner a moment to actually spawn the child.
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.engine.cancel(id).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), completion.wait())
        .await
        .expect("cancellation did not settle the completion");
    assert!(outcome.is_canceled());

    let stored = wait_for_terminal(&harness.store, id).await;
    assert_eq!(stored.state, ServiceState::Canceled);
    harness.engine.shutdown();
}
