//! # Service Record
//!
//! The persisted description of one unit of orchestrated work: one node in
//! the work DAG. The engine treats arguments as an opaque ordered string
//! array; their meaning belongs to the processor registered under
//! [`ServiceRecord::name`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::state_machine::ServiceState;

/// One node in the work DAG.
///
/// `parent_id` forms the "who requested this" tree; `depends_on` is the
/// execution gate. The two are distinct: a parent may have many children that
/// are not its dependencies, and a dependency may be shared across unrelated
/// parents through deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Uuid,
    /// Registry key naming the processor that executes this record
    pub name: String,
    /// Owner or queue the record was submitted under
    pub owner: String,
    /// Ordered string-array calling convention, opaque to the engine
    pub args: Vec<String>,
    pub state: ServiceState,
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Working directory for external execution
    pub workspace: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    /// Serialized result payload, present once the record is successful
    pub result: Option<serde_json::Value>,
    /// Rendered failure cause chain, present once the record has failed
    pub failure: Option<String>,
    /// Structured failure cause, preserved for dependents' causal chains
    pub failure_cause: Option<ServiceError>,
    /// Earliest time the record may run again, set by retry backoff
    pub not_before: Option<DateTime<Utc>>,
    pub parent_id: Option<Uuid>,
    /// Ids whose terminal success gates this record's final process stage
    pub depends_on: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    /// Create a new record in the `Created` state
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner: owner.into(),
            args: Vec::new(),
            state: ServiceState::Created,
            priority: 0,
            timeout: None,
            attempts: 0,
            max_attempts: 1,
            workspace: None,
            stdout_path: None,
            stderr_path: None,
            result: None,
            failure: None,
            failure_cause: None,
            not_before: None,
            parent_id: None,
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Declare an execution dependency on another record
    pub fn add_dependency(&mut self, dependency_id: Uuid) {
        if !self.depends_on.contains(&dependency_id) {
            self.depends_on.push(dependency_id);
        }
    }

    /// Update the modification timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Arguments with surrounding whitespace stripped and empty tokens dropped.
    ///
    /// Order is preserved: the string-array calling convention is positional.
    pub fn normalized_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.trim().to_string())
            .filter(|arg| !arg.is_empty())
            .collect()
    }

    /// Equality key for dedup: service name plus normalized arguments.
    ///
    /// Two records with equal fingerprints describe the same unit of work,
    /// regardless of incidental whitespace in their argument lists.
    pub fn fingerprint(&self) -> String {
        let mut key = self.name.clone();
        for arg in self.normalized_args() {
            key.push('\u{1f}');
            key.push_str(&arg);
        }
        key
    }

    /// Default stdout capture path inside the workspace
    pub fn default_stdout_path(&self) -> Option<PathBuf> {
        self.workspace.as_ref().map(|w| w.join("stdout.log"))
    }

    /// Default stderr capture path inside the workspace
    pub fn default_stderr_path(&self) -> Option<PathBuf> {
        self.workspace.as_ref().map(|w| w.join("stderr.log"))
    }
}
