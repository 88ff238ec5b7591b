//! # Process Runner Collaborator
//!
//! Spawns a rendered invocation and hands back a handle with an async exit
//! wait and a kill capability. The engine never joins a worker thread on a
//! running process: the handle is awaited inside the worker task and killed
//! on timeout or cancellation.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::error::{Result, ServiceError};
use crate::script::ExternalInvocation;

/// Handle over a launched external process
#[async_trait]
pub trait ProcessHandle: Send {
    /// Wait for the process to exit and return its exit code.
    ///
    /// A signal-terminated process reports exit code -1.
    async fn wait(&mut self) -> Result<i32>;

    /// Forcibly terminate the process
    async fn kill(&mut self) -> Result<()>;
}

impl std::fmt::Debug for dyn ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").finish()
    }
}

/// Collaborator that launches rendered invocations
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Launch the invocation in its working directory with stdout/stderr
    /// captured to the given paths.
    async fn spawn(
        &self,
        invocation: &ExternalInvocation,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<Box<dyn ProcessHandle>>;
}

/// Tokio-backed process runner used in production
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

struct TokioProcessHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn spawn(
        &self,
        invocation: &ExternalInvocation,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<Box<dyn ProcessHandle>> {
        if let Some(parent) = stdout_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Some(parent) = stderr_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stdout_file = std::fs::File::create(stdout_path)?;
        let stderr_file = std::fs::File::create(stderr_path)?;

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);

        if let Some(working_dir) = &invocation.working_dir {
            command.current_dir(working_dir);
        }

        let child = command.spawn().map_err(|e| ServiceError::Infrastructure {
            message: format!("failed to spawn {}: {e}", invocation.program),
        })?;

        tracing::debug!(
            program = %invocation.program,
            args = ?invocation.args,
            working_dir = ?invocation.working_dir,
            "spawned external process"
        );

        Ok(Box::new(TokioProcessHandle { child }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::script::InvocationBuilder;

    #[tokio::test]
    async fn test_spawn_captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("stdout.log");
        let stderr = dir.path().join("stderr.log");

        let invocation = InvocationBuilder::new("/bin/sh")
            .arg("-c")
            .arg("echo hello")
            .build();

        let mut handle = TokioProcessRunner::new()
            .spawn(&invocation, &stdout, &stderr)
            .await
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), 0);

        let captured = std::fs::read_to_string(&stdout).unwrap();
        assert_eq!(captured.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = InvocationBuilder::new("/bin/sh").arg("-c").arg("exit 3").build();

        let mut handle = TokioProcessRunner::new()
            .spawn(
                &invocation,
                &dir.path().join("out.log"),
                &dir.path().join("err.log"),
            )
            .await
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_kill_terminates_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = InvocationBuilder::new("/bin/sleep").arg("30").build();

        let mut handle = TokioProcessRunner::new()
            .spawn(
                &invocation,
                &dir.path().join("out.log"),
                &dir.path().join("err.log"),
            )
            .await
            .unwrap();
        handle.kill().await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_spawn_missing_program_is_infrastructure_error() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = InvocationBuilder::new("/nonexistent/tool-binary").build();

        let err = TokioProcessRunner::new()
            .spawn(
                &invocation,
                &dir.path().join("out.log"),
                &dir.path().join("err.log"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Infrastructure { .. }));
    }
}
