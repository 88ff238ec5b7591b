//! # External Execution Processor
//!
//! Leaf processor that renders a script, launches the external process in
//! the record workspace, and scans its captured output for latent errors.
//! Exit code alone is not proof of success: many wrapped tools exit 0 after
//! printing a fatal error, so any matched error pattern converts an
//! apparently-successful exit into a failure.

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use super::context::ProcessorContext;
use super::probe::ResultProbe;
use super::service_processor::ServiceProcessor;
use crate::error::{Result, ServiceError};
use crate::model::ServiceRecord;
use crate::script::ScriptRenderer;

/// Configurable matcher for latent errors in captured tool output
#[derive(Debug, Clone)]
pub struct ErrorPatternMatcher {
    patterns: Vec<String>,
}

impl ErrorPatternMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Matcher that accepts all output
    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// First line of `output` containing any configured pattern
    pub fn first_match<'a>(&self, output: &'a str) -> Option<&'a str> {
        output.lines().find(|line| {
            self.patterns
                .iter()
                .any(|pattern| line.contains(pattern.as_str()))
        })
    }
}

impl Default for ErrorPatternMatcher {
    fn default() -> Self {
        Self::new(["Error:", "ERROR", "Exception", "Segmentation fault"])
    }
}

/// Leaf processor wrapping one external tool invocation.
///
/// The renderer owns the tool's flag schema; the probe (when present) makes
/// resubmission of completed work a no-op.
pub struct ExternalExecutionProcessor {
    name: String,
    renderer: Arc<dyn ScriptRenderer>,
    probe: Option<Arc<dyn ResultProbe>>,
    matcher: ErrorPatternMatcher,
}

impl ExternalExecutionProcessor {
    pub fn new(name: impl Into<String>, renderer: Arc<dyn ScriptRenderer>) -> Self {
        Self {
            name: name.into(),
            renderer,
            probe: None,
            matcher: ErrorPatternMatcher::default(),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResultProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_matcher(mut self, matcher: ErrorPatternMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    fn capture_paths(record: &ServiceRecord) -> Result<(PathBuf, PathBuf)> {
        let stdout = record
            .stdout_path
            .clone()
            .or_else(|| record.default_stdout_path());
        let stderr = record
            .stderr_path
            .clone()
            .or_else(|| record.default_stderr_path());
        match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => Ok((stdout, stderr)),
            _ => Err(ServiceError::Validation {
                message: format!(
                    "service {} has neither capture paths nor a workspace",
                    record.id
                ),
            }),
        }
    }

    async fn captured_output(stdout: &PathBuf, stderr: &PathBuf) -> String {
        let mut combined = String::new();
        for path in [stdout, stderr] {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                combined.push_str(&content);
                if !content.ends_with('\n') {
                    combined.push('\n');
                }
            }
        }
        combined
    }

    fn excerpt(output: &str, max_lines: usize) -> String {
        let lines: Vec<&str> = output.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

#[async_trait]
impl ServiceProcessor for ExternalExecutionProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_process(&self, _ctx: &ProcessorContext, record: &ServiceRecord) -> Result<()> {
        if record.args.is_empty() {
            return Err(ServiceError::Validation {
                message: format!("service {} submitted without arguments", record.name),
            });
        }
        let workspace = record
            .workspace
            .as_ref()
            .ok_or_else(|| ServiceError::Validation {
                message: format!("service {} requires a workspace directory", record.name),
            })?;
        tokio::fs::create_dir_all(workspace).await?;
        Ok(())
    }

    async fn is_result_available(
        &self,
        _ctx: &ProcessorContext,
        record: &ServiceRecord,
    ) -> Result<bool> {
        match &self.probe {
            Some(probe) => probe.is_available(record).await,
            None => Ok(false),
        }
    }

    async fn collect_result(
        &self,
        _ctx: &ProcessorContext,
        record: &ServiceRecord,
    ) -> Result<serde_json::Value> {
        match &self.probe {
            Some(probe) => probe.collect(record).await,
            None => Ok(serde_json::Value::Null),
        }
    }

    async fn process(
        &self,
        ctx: &ProcessorContext,
        record: &ServiceRecord,
    ) -> Result<serde_json::Value> {
        if ctx.is_canceled() {
            return Err(ServiceError::Canceled {
                service_id: record.id,
            });
        }

        let mut invocation = self.renderer.render(record)?;
        if invocation.working_dir.is_none() {
            invocation.working_dir = record.workspace.clone();
        }
        let (stdout_path, stderr_path) = Self::capture_paths(record)?;

        let timeout = ctx.config().effective_timeout(record.timeout);
        let mut handle = ctx
            .runner()
            .spawn(&invocation, &stdout_path, &stderr_path)
            .await?;

        enum WaitOutcome {
            Exited(i32),
            WaitFailed(ServiceError),
            TimedOut,
            Canceled,
        }

        let mut cancel = ctx.cancel_signal();
        let waited = tokio::select! {
            waited = tokio::time::timeout(timeout, handle.wait()) => match waited {
                Ok(Ok(code)) => WaitOutcome::Exited(code),
                Ok(Err(e)) => WaitOutcome::WaitFailed(e),
                Err(_elapsed) => WaitOutcome::TimedOut,
            },
            _ = cancel.changed() => WaitOutcome::Canceled,
        };

        let exit_code = match waited {
            WaitOutcome::Exited(code) => code,
            WaitOutcome::WaitFailed(error) => return Err(error),
            WaitOutcome::TimedOut => {
                if let Err(e) = handle.kill().await {
                    tracing::warn!(service_id = %record.id, error = %e, "failed to kill timed-out process");
                }
                return Err(ServiceError::Timeout { timeout });
            }
            WaitOutcome::Canceled => {
                if let Err(e) = handle.kill().await {
                    tracing::warn!(service_id = %record.id, error = %e, "failed to kill canceled process");
                }
                return Err(ServiceError::Canceled {
                    service_id: record.id,
                });
            }
        };

        let output = Self::captured_output(&stdout_path, &stderr_path).await;
        let max_lines = ctx.config().output_excerpt_lines;

        if exit_code != 0 {
            return Err(ServiceError::Execution {
                exit_code: Some(exit_code),
                output_excerpt: Self::excerpt(&output, max_lines),
            });
        }

        if let Some(line) = self.matcher.first_match(&output) {
            tracing::warn!(
                service_id = %record.id,
                matched = line,
                "error pattern matched despite clean exit"
            );
            return Err(ServiceError::Execution {
                exit_code: Some(exit_code),
                output_excerpt: line.to_string(),
            });
        }

        Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout_path.to_string_lossy(),
            "stderr": stderr_path.to_string_lossy(),
        }))
    }
}
