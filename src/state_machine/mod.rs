// State machine module for the service lifecycle
//
// Maps (current state, event) pairs to target states and applies transitions
// as atomic compare-and-set operations against the persistence store, which
// is the single source of truth for record state.

pub mod events;
pub mod machine;
pub mod states;

// Re-export main types for convenient access
pub use events::ServiceEvent;
pub use machine::ServiceStateMachine;
pub use states::ServiceState;
