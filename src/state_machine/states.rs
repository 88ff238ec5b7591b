use serde::{Deserialize, Serialize};
use std::fmt;

/// Service record state definitions for the orchestration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Record persisted, not yet eligible for execution
    Created,
    /// Eligible; the dispatcher will pick it up when a worker is free
    Queued,
    /// A worker is actively executing one lifecycle stage
    Running,
    /// Awaiting dependency completion without occupying a worker
    Suspended,
    /// Terminal: all stages completed and the result was collected
    Successful,
    /// Terminal: a stage failed with a structured cause
    Error,
    /// Terminal: canceled before completion
    Canceled,
    /// Terminal: the record timeout elapsed during execution
    Timeout,
}

impl ServiceState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Error | Self::Canceled | Self::Timeout
        )
    }

    /// Check if this state satisfies dependents waiting on this record
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Successful)
    }

    /// Check if this is a terminal state other than success
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Error | Self::Canceled | Self::Timeout)
    }

    /// Check if a worker currently owns the record
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::Created
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Successful => write!(f, "successful"),
            Self::Error => write!(f, "error"),
            Self::Canceled => write!(f, "canceled"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for ServiceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "successful" => Ok(Self::Successful),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid service state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_check() {
        assert!(ServiceState::Successful.is_terminal());
        assert!(ServiceState::Error.is_terminal());
        assert!(ServiceState::Canceled.is_terminal());
        assert!(ServiceState::Timeout.is_terminal());
        assert!(!ServiceState::Created.is_terminal());
        assert!(!ServiceState::Queued.is_terminal());
        assert!(!ServiceState::Running.is_terminal());
        assert!(!ServiceState::Suspended.is_terminal());
    }

    #[test]
    fn test_dependency_satisfaction() {
        assert!(ServiceState::Successful.satisfies_dependents());
        assert!(!ServiceState::Error.satisfies_dependents());
        assert!(!ServiceState::Timeout.satisfies_dependents());
        assert!(!ServiceState::Suspended.satisfies_dependents());
    }

    #[test]
    fn test_string_conversion() {
        assert_eq!(ServiceState::Suspended.to_string(), "suspended");
        assert_eq!(
            "successful".parse::<ServiceState>().unwrap(),
            ServiceState::Successful
        );
        assert!("bogus".parse::<ServiceState>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let state = ServiceState::Running;
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, "\"running\"");

        let parsed: ServiceState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
