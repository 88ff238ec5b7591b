use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;

use crate::error::{Result, ServiceError};
use crate::model::ServiceRecord;

/// Idempotent "is the result already materialized" contract.
///
/// `is_available` must be pure and safe to call repeatedly from multiple
/// workers; it is checked before any real work runs, which is what makes
/// resubmission of an already-completed pipeline step a no-op.
#[async_trait]
pub trait ResultProbe: Send + Sync {
    async fn is_available(&self, record: &ServiceRecord) -> Result<bool>;

    /// Collect the materialized result for a record whose probe reported
    /// availability.
    async fn collect(&self, record: &ServiceRecord) -> Result<serde_json::Value>;
}

enum ProbeTarget {
    /// The token following this flag in the record arguments is the path
    Flag(String),
    /// A fixed path, resolved against the record workspace when relative
    Fixed(PathBuf),
}

/// Probe that reports availability when an expected output file exists.
pub struct FileResultProbe {
    target: ProbeTarget,
}

impl FileResultProbe {
    /// Expect the output path as the token following `flag` in the args
    pub fn for_flag(flag: impl Into<String>) -> Self {
        Self {
            target: ProbeTarget::Flag(flag.into()),
        }
    }

    /// Expect the output at a fixed path
    pub fn fixed(path: impl Into<PathBuf>) -> Self {
        Self {
            target: ProbeTarget::Fixed(path.into()),
        }
    }

    /// Resolve the expected output path for a record
    pub fn expected_path(&self, record: &ServiceRecord) -> Result<PathBuf> {
        let raw = match &self.target {
            ProbeTarget::Fixed(path) => path.clone(),
            ProbeTarget::Flag(flag) => {
                let args = record.normalized_args();
                let value = args
                    .iter()
                    .position(|token| token == flag)
                    .and_then(|index| args.get(index + 1))
                    .ok_or_else(|| ServiceError::Validation {
                        message: format!("missing {flag} argument for service {}", record.name),
                    })?;
                PathBuf::from(value)
            }
        };

        if raw.is_relative() {
            if let Some(workspace) = &record.workspace {
                return Ok(workspace.join(raw));
            }
        }
        Ok(raw)
    }
}

#[async_trait]
impl ResultProbe for FileResultProbe {
    async fn is_available(&self, record: &ServiceRecord) -> Result<bool> {
        let path = self.expected_path(record)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn collect(&self, record: &ServiceRecord) -> Result<serde_json::Value> {
        let path = self.expected_path(record)?;
        Ok(json!({ "output": path.to_string_lossy() }))
    }
}
