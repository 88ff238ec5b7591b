// Typed lifecycle event publishing

pub mod publisher;

pub use publisher::{TransitionEvent, TransitionPublisher};
