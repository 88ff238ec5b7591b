//! # Persistence Collaborator
//!
//! The engine never keeps authoritative record state only in memory: every
//! state transition, result, and failure goes through a [`ServiceStore`],
//! which is the single source of truth. The trait is the contract a real
//! deployment implements against its database; [`InMemoryServiceStore`] is
//! the reference implementation used for embedded operation and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{Result, ServiceError};
use crate::model::ServiceRecord;
use crate::state_machine::ServiceState;

/// Storage contract the engine calls for all authoritative record state.
///
/// `transition_state` must be an atomic compare-and-set: it fails when the
/// persisted state no longer matches `from`, which is how racing workers are
/// serialized without the engine holding its own locks.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Persist a record, replacing any existing row with the same id
    async fn save(&self, record: &ServiceRecord) -> Result<()>;

    /// Load a record by id
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ServiceRecord>>;

    /// Load a root record and every descendant reachable through parent links
    async fn find_hierarchy(&self, root_id: Uuid) -> Result<Vec<ServiceRecord>>;

    /// Load the direct children of a record (by parent link)
    async fn find_children(&self, parent_id: Uuid) -> Result<Vec<ServiceRecord>>;

    /// Load all records currently in the given state
    async fn find_by_state(&self, state: ServiceState) -> Result<Vec<ServiceRecord>>;

    /// Load all records listing the given id in their dependency set
    async fn find_dependents(&self, dependency_id: Uuid) -> Result<Vec<ServiceRecord>>;

    /// Atomically transition a record from `from` to `to`.
    ///
    /// Fails with [`ServiceError::InvalidTransition`] when the persisted state
    /// is not `from` at the moment of the update.
    async fn transition_state(&self, id: Uuid, from: ServiceState, to: ServiceState)
        -> Result<()>;

    /// Store the serialized result payload for a record
    async fn update_result(&self, id: Uuid, result: serde_json::Value) -> Result<()>;

    /// Store the failure cause for a record, both structured and rendered
    async fn update_failure(&self, id: Uuid, cause: ServiceError) -> Result<()>;

    /// Append a dependency edge to a record, keeping the edge set unique
    async fn add_dependency(&self, id: Uuid, dependency_id: Uuid) -> Result<()>;

    /// Increment and return the attempt counter for a record
    async fn increment_attempts(&self, id: Uuid) -> Result<u32>;

    /// Record the earliest time the record may be picked up again
    async fn schedule_retry(&self, id: Uuid, not_before: DateTime<Utc>) -> Result<()>;
}

/// In-memory store backing tests and embedded single-process deployments.
///
/// Each record lives under one `DashMap` entry; `get_mut` holds that entry's
/// shard lock for the duration of a mutation, which gives every update
/// (including the transition compare-and-set) single-transaction atomicity.
#[derive(Debug, Default)]
pub struct InMemoryServiceStore {
    records: DashMap<Uuid, ServiceRecord>,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn with_record<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut ServiceRecord) -> Result<T>,
    ) -> Result<T> {
        match self.records.get_mut(&id) {
            Some(mut entry) => {
                let result = f(entry.value_mut())?;
                entry.value_mut().touch();
                Ok(result)
            }
            None => Err(ServiceError::Infrastructure {
                message: format!("service {id} not found"),
            }),
        }
    }
}

#[async_trait]
impl ServiceStore for InMemoryServiceStore {
    async fn save(&self, record: &ServiceRecord) -> Result<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ServiceRecord>> {
        Ok(self.records.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_hierarchy(&self, root_id: Uuid) -> Result<Vec<ServiceRecord>> {
        let mut result = Vec::new();
        let Some(root) = self.find_by_id(root_id).await? else {
            return Ok(result);
        };
        result.push(root);

        let mut frontier = vec![root_id];
        while let Some(parent_id) = frontier.pop() {
            for entry in &self.records {
                if entry.value().parent_id == Some(parent_id) {
                    frontier.push(entry.value().id);
                    result.push(entry.value().clone());
                }
            }
        }
        Ok(result)
    }

    async fn find_children(&self, parent_id: Uuid) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.value().parent_id == Some(parent_id))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_by_state(&self, state: ServiceState) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.value().state == state)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_dependents(&self, dependency_id: Uuid) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.value().depends_on.contains(&dependency_id))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn transition_state(
        &self,
        id: Uuid,
        from: ServiceState,
        to: ServiceState,
    ) -> Result<()> {
        self.with_record(id, |record| {
            if record.state != from {
                return Err(ServiceError::InvalidTransition {
                    service_id: id,
                    from: record.state.to_string(),
                    to: to.to_string(),
                });
            }
            record.state = to;
            Ok(())
        })
    }

    async fn update_result(&self, id: Uuid, result: serde_json::Value) -> Result<()> {
        self.with_record(id, |record| {
            record.result = Some(result);
            Ok(())
        })
    }

    async fn update_failure(&self, id: Uuid, cause: ServiceError) -> Result<()> {
        self.with_record(id, |record| {
            record.failure = Some(cause.to_string());
            record.failure_cause = Some(cause);
            Ok(())
        })
    }

    async fn add_dependency(&self, id: Uuid, dependency_id: Uuid) -> Result<()> {
        self.with_record(id, |record| {
            record.add_dependency(dependency_id);
            Ok(())
        })
    }

    async fn increment_attempts(&self, id: Uuid) -> Result<u32> {
        self.with_record(id, |record| {
            record.attempts += 1;
            Ok(record.attempts)
        })
    }

    async fn schedule_retry(&self, id: Uuid, not_before: DateTime<Utc>) -> Result<()> {
        self.with_record(id, |record| {
            record.not_before = Some(not_before);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_find() {
        let store = InMemoryServiceStore::new();
        let record = ServiceRecord::new("convert", "pipeline");
        store.save(&record).await.unwrap();

        let loaded = store.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, record.id);
        assert!(store.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_compare_and_set() {
        let store = InMemoryServiceStore::new();
        let record = ServiceRecord::new("convert", "pipeline");
        store.save(&record).await.unwrap();

        store
            .transition_state(record.id, ServiceState::Created, ServiceState::Queued)
            .await
            .unwrap();

        // Second worker racing with a stale expected state loses.
        let err = store
            .transition_state(record.id, ServiceState::Created, ServiceState::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_find_hierarchy_walks_parent_links() {
        let store = InMemoryServiceStore::new();
        let root = ServiceRecord::new("stitch", "pipeline");
        let child = ServiceRecord::new("convert", "pipeline").with_parent(root.id);
        let grandchild = ServiceRecord::new("probe", "pipeline").with_parent(child.id);
        let unrelated = ServiceRecord::new("align", "pipeline");

        for record in [&root, &child, &grandchild, &unrelated] {
            store.save(record).await.unwrap();
        }

        let hierarchy = store.find_hierarchy(root.id).await.unwrap();
        let ids: Vec<Uuid> = hierarchy.iter().map(|r| r.id).collect();
        assert_eq!(hierarchy.len(), 3);
        assert!(ids.contains(&root.id));
        assert!(ids.contains(&child.id));
        assert!(ids.contains(&grandchild.id));
        assert!(!ids.contains(&unrelated.id));
    }

    #[tokio::test]
    async fn test_find_dependents_matches_dependency_edges() {
        let store = InMemoryServiceStore::new();
        let leaf = ServiceRecord::new("convert", "pipeline");
        let mut left = ServiceRecord::new("stitch", "pipeline");
        left.add_dependency(leaf.id);
        let mut right = ServiceRecord::new("stitch", "pipeline");
        right.add_dependency(leaf.id);
        let unrelated = ServiceRecord::new("align", "pipeline");

        for record in [&leaf, &left, &right, &unrelated] {
            store.save(record).await.unwrap();
        }

        let dependents = store.find_dependents(leaf.id).await.unwrap();
        let ids: Vec<Uuid> = dependents.iter().map(|r| r.id).collect();
        assert_eq!(dependents.len(), 2);
        assert!(ids.contains(&left.id));
        assert!(ids.contains(&right.id));
    }

    #[tokio::test]
    async fn test_update_failure_keeps_structured_cause() {
        let store = InMemoryServiceStore::new();
        let record = ServiceRecord::new("convert", "pipeline");
        store.save(&record).await.unwrap();

        let cause = ServiceError::Execution {
            exit_code: Some(2),
            output_excerpt: "broken".to_string(),
        };
        store.update_failure(record.id, cause.clone()).await.unwrap();

        let loaded = store.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.failure_cause, Some(cause));
        assert!(loaded.failure.unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn test_attempt_counter() {
        let store = InMemoryServiceStore::new();
        let record = ServiceRecord::new("convert", "pipeline");
        store.save(&record).await.unwrap();

        assert_eq!(store.increment_attempts(record.id).await.unwrap(), 1);
        assert_eq!(store.increment_attempts(record.id).await.unwrap(), 2);
    }
}
