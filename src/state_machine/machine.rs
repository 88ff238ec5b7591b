use std::sync::Arc;

use super::events::ServiceEvent;
use super::states::ServiceState;
use crate::error::{Result, ServiceError};
use crate::events::TransitionPublisher;
use crate::persistence::ServiceStore;
use uuid::Uuid;

/// State machine applying lifecycle transitions against the persistence store.
///
/// The store is the single source of truth: every transition is an atomic
/// compare-and-set on the persisted record, so two workers racing on the same
/// record id cannot both win. A successful transition is published as a typed
/// event before this call returns.
#[derive(Clone)]
pub struct ServiceStateMachine {
    store: Arc<dyn ServiceStore>,
    publisher: TransitionPublisher,
}

impl ServiceStateMachine {
    pub fn new(store: Arc<dyn ServiceStore>, publisher: TransitionPublisher) -> Self {
        Self { store, publisher }
    }

    /// Get the current persisted state of a record
    pub async fn current_state(&self, service_id: Uuid) -> Result<ServiceState> {
        let record = self
            .store
            .find_by_id(service_id)
            .await?
            .ok_or_else(|| ServiceError::Infrastructure {
                message: format!("service {service_id} not found"),
            })?;
        Ok(record.state)
    }

    /// Attempt to transition the record, returning the new state.
    ///
    /// Fails with [`ServiceError::InvalidTransition`] when the event is not
    /// legal from the current state, including any event against a terminal
    /// state and any compare-and-set loss against a concurrent worker.
    pub async fn transition(&self, service_id: Uuid, event: ServiceEvent) -> Result<ServiceState> {
        let current = self.current_state(service_id).await?;
        let target = Self::determine_target_state(service_id, current, event)?;

        self.store.transition_state(service_id, current, target).await?;
        self.publisher.publish(service_id, current, target);

        tracing::debug!(
            service_id = %service_id,
            from = %current,
            to = %target,
            event = %event,
            "service state transition"
        );

        Ok(target)
    }

    /// Determine the target state for `(current, event)`.
    ///
    /// Pure transition table; exposed so callers can validate a transition
    /// without applying it.
    pub fn determine_target_state(
        service_id: Uuid,
        current: ServiceState,
        event: ServiceEvent,
    ) -> Result<ServiceState> {
        let target = match (current, event) {
            (ServiceState::Created, ServiceEvent::Enqueue) => ServiceState::Queued,

            (ServiceState::Queued, ServiceEvent::Start) => ServiceState::Running,

            // Dependency wait cycle
            (ServiceState::Running, ServiceEvent::Suspend) => ServiceState::Suspended,
            (ServiceState::Suspended, ServiceEvent::Resume) => ServiceState::Running,

            // Retry backoff parks the record back in the queue
            (ServiceState::Running, ServiceEvent::Requeue) => ServiceState::Queued,

            (ServiceState::Running, ServiceEvent::Complete) => ServiceState::Successful,

            // Failure may be observed before the record ever ran, e.g. when a
            // dependency fails while this record is still queued.
            (
                ServiceState::Created
                | ServiceState::Queued
                | ServiceState::Running
                | ServiceState::Suspended,
                ServiceEvent::Fail,
            ) => ServiceState::Error,

            (
                ServiceState::Created
                | ServiceState::Queued
                | ServiceState::Running
                | ServiceState::Suspended,
                ServiceEvent::Cancel,
            ) => ServiceState::Canceled,

            (ServiceState::Running, ServiceEvent::TimeoutExpired) => ServiceState::Timeout,

            (from, event) => {
                return Err(ServiceError::InvalidTransition {
                    service_id,
                    from: from.to_string(),
                    to: event.to_string(),
                })
            }
        };

        Ok(target)
    }
}
