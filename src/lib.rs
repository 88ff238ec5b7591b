#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pipeline Core
//!
//! Asynchronous service-orchestration core for image-processing pipelines.
//!
//! ## Overview
//!
//! The engine submits units of computational work ("services"), builds a
//! dependency DAG of sub-services on demand, memoizes already-completed work
//! via result probes, executes leaf units in-process or as spawned external
//! processes, and propagates success or failure through composed
//! asynchronous continuations.
//!
//! ## Architecture
//!
//! A caller submits a [`model::ServiceRecord`] to the [`dispatcher::ServiceEngine`].
//! A worker drives the record's [`processor::ServiceProcessor`] lifecycle:
//! validation, a result probe that short-circuits already-materialized work,
//! optional dependency decomposition (suspending the record without holding
//! the worker), the final `process` stage, and cleanup. Completion resolves
//! an [`async_result::AsyncResult`], propagating to every registered
//! continuation.
//!
//! ## Key Properties
//!
//! - **Memoization**: a positive result probe skips execution entirely
//! - **Dedup**: at most one equivalent sub-service is active at a time
//! - **Failure propagation**: a failed dependency fails its dependents
//!   before their final stage ever starts, with the full causal chain
//! - **No hostage workers**: dependency waits and external processes never
//!   block a worker thread
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pipeline_core::config::EngineConfig;
//! use pipeline_core::dispatcher::ServiceEngine;
//! use pipeline_core::model::ServiceRecord;
//! use pipeline_core::persistence::InMemoryServiceStore;
//! use pipeline_core::processor::{ExternalExecutionProcessor, FileResultProbe};
//! use pipeline_core::registry::ProcessorRegistry;
//! use pipeline_core::runner::TokioProcessRunner;
//! use pipeline_core::script::PassthroughRenderer;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Arc::new(ProcessorRegistry::new());
//! registry.register_instance(Arc::new(
//!     ExternalExecutionProcessor::new("convert", Arc::new(PassthroughRenderer::new("convert-tool")))
//!         .with_probe(Arc::new(FileResultProbe::for_flag("-output"))),
//! ));
//!
//! let engine = ServiceEngine::start(
//!     EngineConfig::from_env()?,
//!     Arc::new(InMemoryServiceStore::new()),
//!     registry,
//!     Arc::new(TokioProcessRunner::new()),
//! );
//!
//! let record = ServiceRecord::new("convert", "pipeline")
//!     .with_args(["-input", "a.raw", "-output", "b.raw"])
//!     .with_workspace("/tmp/convert");
//! let completion = engine.submit(record).await?;
//! let outcome = completion.wait().await;
//! println!("terminal outcome: {:?}", outcome.is_success());
//! # Ok(())
//! # }
//! ```

pub mod async_result;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod persistence;
pub mod processor;
pub mod registry;
pub mod runner;
pub mod script;
pub mod state_machine;

pub use async_result::{AsyncResult, Outcome};
pub use config::{EngineConfig, RetryPolicy};
pub use dispatcher::ServiceEngine;
pub use error::{LifecycleStage, Result, ServiceError};
pub use events::{TransitionEvent, TransitionPublisher};
pub use model::ServiceRecord;
pub use persistence::{InMemoryServiceStore, ServiceStore};
pub use processor::{
    ErrorPatternMatcher, ExternalExecutionProcessor, FileResultProbe, ProcessorContext,
    ResultProbe, ServiceProcessor,
};
pub use registry::ProcessorRegistry;
pub use runner::{ProcessHandle, ProcessRunner, TokioProcessRunner};
pub use script::{ExternalInvocation, InvocationBuilder, PassthroughRenderer, ScriptRenderer};
pub use state_machine::{ServiceEvent, ServiceState, ServiceStateMachine};
