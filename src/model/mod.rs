// Data model for orchestrated work

pub mod service_record;

pub use service_record::ServiceRecord;
