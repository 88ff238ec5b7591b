//! # Processor Registry
//!
//! Explicit mapping from a service-name string to a processor factory,
//! built once at startup and passed by reference through the engine. There
//! is no reflection and no global lookup: a name either resolves here or
//! submission fails with [`ServiceError::UnknownProcessor`].

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{Result, ServiceError};
use crate::processor::ServiceProcessor;

/// Factory producing a processor instance for a registered service name
pub type ProcessorFactory = Arc<dyn Fn() -> Arc<dyn ServiceProcessor> + Send + Sync>;

/// Thread-safe registry of processor factories.
///
/// Factories run at most once per name; the built instance is cached and
/// shared across workers.
#[derive(Default)]
pub struct ProcessorRegistry {
    factories: DashMap<String, ProcessorFactory>,
    instances: DashMap<String, Arc<dyn ServiceProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a service name, replacing any previous entry
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ServiceProcessor> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(service_name = %name, "registered processor factory");
        self.instances.remove(&name);
        self.factories.insert(name, Arc::new(factory));
    }

    /// Register an already-built processor instance
    pub fn register_instance(&self, processor: Arc<dyn ServiceProcessor>) {
        let name = processor.name().to_string();
        self.register(name, move || Arc::clone(&processor));
    }

    /// Resolve a service name to its processor, building it on first use
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ServiceProcessor>> {
        if let Some(instance) = self.instances.get(name) {
            return Ok(Arc::clone(instance.value()));
        }

        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ServiceError::UnknownProcessor {
                name: name.to_string(),
            })?;

        let instance = factory.value()();
        self.instances
            .insert(name.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Whether a factory is registered under the given name
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Names of all registered factories
    pub fn registered_names(&self) -> Vec<String> {
        self.factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorContext;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopProcessor {
        name: String,
    }

    #[async_trait]
    impl ServiceProcessor for NoopProcessor {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(
            &self,
            _ctx: &ProcessorContext,
            _record: &crate::model::ServiceRecord,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ProcessorRegistry::new();
        registry.register("convert", || {
            Arc::new(NoopProcessor {
                name: "convert".to_string(),
            })
        });

        assert!(registry.contains("convert"));
        let processor = registry.resolve("convert").unwrap();
        assert_eq!(processor.name(), "convert");
    }

    #[test]
    fn test_unknown_name_fails() {
        let registry = ProcessorRegistry::new();
        let err = registry.resolve("missing").unwrap_err();
        assert!(matches!(err, ServiceError::UnknownProcessor { .. }));
    }

    #[test]
    fn test_factory_runs_once_per_name() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);

        let registry = ProcessorRegistry::new();
        registry.register("convert", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(NoopProcessor {
                name: "convert".to_string(),
            })
        });

        registry.resolve("convert").unwrap();
        registry.resolve("convert").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }
}
