// Processor contracts: the staged lifecycle every unit of work implements,
// the result probe that makes resubmission a no-op, and the external
// execution leaf.

pub mod context;
pub mod external;
pub mod probe;
pub mod service_processor;

pub use context::ProcessorContext;
pub use external::{ErrorPatternMatcher, ExternalExecutionProcessor};
pub use probe::{FileResultProbe, ResultProbe};
pub use service_processor::ServiceProcessor;
