use serde::{Deserialize, Serialize};
use std::fmt;

/// Events that drive service record state transitions.
///
/// Events are emitted by the dispatcher and its workers; the state machine
/// maps `(current state, event)` to a target state and rejects everything
/// else, which is what keeps terminal states final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEvent {
    /// Record is fully persisted and eligible for scheduling
    Enqueue,
    /// A worker picked the record up
    Start,
    /// The record is waiting for its dependency sub-DAG
    Suspend,
    /// All dependencies are terminal; the final stages may run
    Resume,
    /// A retryable failure parked the record back in the queue
    Requeue,
    /// All stages completed successfully
    Complete,
    /// A stage failed
    Fail,
    /// The record was canceled
    Cancel,
    /// The record timeout elapsed
    TimeoutExpired,
}

impl fmt::Display for ServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enqueue => write!(f, "enqueue"),
            Self::Start => write!(f, "start"),
            Self::Suspend => write!(f, "suspend"),
            Self::Resume => write!(f, "resume"),
            Self::Requeue => write!(f, "requeue"),
            Self::Complete => write!(f, "complete"),
            Self::Fail => write!(f, "fail"),
            Self::Cancel => write!(f, "cancel"),
            Self::TimeoutExpired => write!(f, "timeout_expired"),
        }
    }
}
