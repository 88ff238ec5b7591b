//! # Structured Error Handling
//!
//! Typed error taxonomy for the orchestration engine. Every stage failure is
//! wrapped with the originating service id and stage name before it travels
//! through an [`crate::async_result::AsyncResult`] chain, so a failed root
//! record exposes the full causal chain down to the leaf execution that broke.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Lifecycle stages a service record moves through while a worker owns it.
///
/// Used for error wrapping so failures name the stage that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    PreProcess,
    ResultProbe,
    CollectResult,
    SubmitDependencies,
    AwaitDependencies,
    Process,
    PostProcess,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreProcess => write!(f, "pre_process"),
            Self::ResultProbe => write!(f, "result_probe"),
            Self::CollectResult => write!(f, "collect_result"),
            Self::SubmitDependencies => write!(f, "submit_dependencies"),
            Self::AwaitDependencies => write!(f, "await_dependencies"),
            Self::Process => write!(f, "process"),
            Self::PostProcess => write!(f, "post_process"),
        }
    }
}

/// Error taxonomy for the orchestration core.
///
/// The five base kinds (validation, dependency failure, execution, timeout,
/// infrastructure) carry the retry semantics; the remaining variants are
/// engine-level wrappers. Variants are `Clone` because a single failure may be
/// delivered to many registered continuations, and `Serialize`/`Deserialize`
/// because stores persist the structured cause alongside the rendered text.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ServiceError {
    /// Bad or missing arguments. Fatal, surfaced at pre-process, never retried.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// A declared dependency reached a terminal failure state; the dependent's
    /// `process` stage was never invoked.
    #[error("dependency {dependency_id} of service {service_id} failed: {cause}")]
    DependencyFailure {
        service_id: Uuid,
        dependency_id: Uuid,
        cause: Box<ServiceError>,
    },

    /// Nonzero exit code or a matched error pattern in captured output.
    #[error("execution failed (exit code {exit_code:?}): {output_excerpt}")]
    Execution {
        exit_code: Option<i32>,
        output_excerpt: String,
    },

    /// The record timeout elapsed and the external process was killed.
    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Filesystem or persistence failure. Always surfaced, never swallowed.
    #[error("infrastructure failure: {message}")]
    Infrastructure { message: String },

    /// The service was canceled before it could complete.
    #[error("service {service_id} was canceled")]
    Canceled { service_id: Uuid },

    /// A lifecycle stage failed; wraps the underlying cause with the record id
    /// and stage name.
    #[error("stage {stage} of service {service_id} failed: {cause}")]
    Stage {
        service_id: Uuid,
        stage: LifecycleStage,
        cause: Box<ServiceError>,
    },

    /// A state transition was requested that the lifecycle machine forbids.
    #[error("invalid state transition for service {service_id}: {from} -> {to}")]
    InvalidTransition {
        service_id: Uuid,
        from: String,
        to: String,
    },

    /// No processor factory is registered under the requested service name.
    #[error("unknown processor: {name}")]
    UnknownProcessor { name: String },
}

impl ServiceError {
    /// Wrap this error with the record id and lifecycle stage it came from.
    ///
    /// Stage wrappers are not nested: wrapping an already-wrapped error keeps
    /// the innermost stage, which is the one that actually failed.
    pub fn at_stage(self, service_id: Uuid, stage: LifecycleStage) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                service_id,
                stage,
                cause: Box::new(other),
            },
        }
    }

    /// Walk wrapper variants down to the error that started the chain.
    pub fn root_cause(&self) -> &ServiceError {
        match self {
            Self::Stage { cause, .. } | Self::DependencyFailure { cause, .. } => {
                cause.root_cause()
            }
            other => other,
        }
    }

    /// Whether retry policy may apply to this failure.
    ///
    /// Only execution, timeout, and infrastructure failures are retryable;
    /// validation and dependency failures never are.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, Self::DependencyFailure { .. }) {
            return false;
        }
        matches!(
            self.root_cause(),
            Self::Execution { .. } | Self::Timeout { .. } | Self::Infrastructure { .. }
        )
    }

    /// Whether any link in the causal chain references the given service id.
    pub fn references(&self, service_id: Uuid) -> bool {
        match self {
            Self::DependencyFailure {
                service_id: sid,
                dependency_id,
                cause,
            } => *sid == service_id || *dependency_id == service_id || cause.references(service_id),
            Self::Stage {
                service_id: sid,
                cause,
                ..
            } => *sid == service_id || cause.references(service_id),
            Self::Canceled { service_id: sid } => *sid == service_id,
            Self::InvalidTransition { service_id: sid, .. } => *sid == service_id,
            _ => false,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        Self::Infrastructure {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infrastructure {
            message: format!("serialization error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution_error() -> ServiceError {
        ServiceError::Execution {
            exit_code: Some(1),
            output_excerpt: "boom".to_string(),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(execution_error().is_retryable());
        assert!(ServiceError::Timeout {
            timeout: Duration::from_secs(5)
        }
        .is_retryable());
        assert!(ServiceError::Infrastructure {
            message: "disk full".to_string()
        }
        .is_retryable());

        assert!(!ServiceError::Validation {
            message: "missing -input".to_string()
        }
        .is_retryable());

        let dep_failure = ServiceError::DependencyFailure {
            service_id: Uuid::new_v4(),
            dependency_id: Uuid::new_v4(),
            cause: Box::new(execution_error()),
        };
        assert!(!dep_failure.is_retryable());
    }

    #[test]
    fn test_stage_wrapping_keeps_innermost_stage() {
        let id = Uuid::new_v4();
        let wrapped = execution_error()
            .at_stage(id, LifecycleStage::Process)
            .at_stage(id, LifecycleStage::PostProcess);

        match wrapped {
            ServiceError::Stage { stage, .. } => assert_eq!(stage, LifecycleStage::Process),
            other => panic!("expected stage wrapper, got {other:?}"),
        }
    }

    #[test]
    fn test_root_cause_unwraps_chain() {
        let leaf = Uuid::new_v4();
        let parent = Uuid::new_v4();
        let err = ServiceError::DependencyFailure {
            service_id: parent,
            dependency_id: leaf,
            cause: Box::new(execution_error().at_stage(leaf, LifecycleStage::Process)),
        };

        assert_eq!(err.root_cause(), &execution_error());
        assert!(err.references(leaf));
        assert!(err.references(parent));
        assert!(!err.references(Uuid::new_v4()));
    }
}
