//! Lookup of strategies and collectors by id.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::{
    default_merge_result, Collector, HttpRequestCollector, HttpStrategy, ProbeError, ProbeStrategy, TcpBannerCollector,
    TcpStrategy,
};
use crate::aggregation::AggregatedResult;
use crate::db::Run;
use crate::versioning::{VersionedRecord, VersionedSchema};

/// Folds one run into a live aggregated result.
pub type ResultMerger = Box<dyn Fn(Option<AggregatedResult>, &Run) -> AggregatedResult + Send + Sync>;

struct RegisteredStrategy {
    strategy: Arc<dyn ProbeStrategy>,
    schema: VersionedSchema,
}

/// Immutable after startup; share it behind an `Arc`.
#[derive(Default)]
pub struct ProbeRegistry {
    strategies: HashMap<String, RegisteredStrategy>,
    collectors: HashMap<String, Arc<dyn Collector>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the HTTP and TCP strategies and their collectors.
    pub fn with_builtins() -> Result<Self, ProbeError> {
        let mut registry = Self::new();
        registry.register_strategy(Arc::new(HttpStrategy))?;
        registry.register_strategy(Arc::new(TcpStrategy))?;
        registry.register_collector(Arc::new(HttpRequestCollector));
        registry.register_collector(Arc::new(TcpBannerCollector));
        Ok(registry)
    }

    /// Register a strategy. Its configuration migration chain is validated
    /// here, once, and cached.
    pub fn register_strategy(&mut self, strategy: Arc<dyn ProbeStrategy>) -> Result<(), ProbeError> {
        let schema = strategy.config_schema()?;
        tracing::info!(
            "ProbeRegistry: registered strategy {} (config v{})",
            strategy.id(),
            schema.current_version()
        );
        self.strategies
            .insert(strategy.id().to_string(), RegisteredStrategy { strategy, schema });
        Ok(())
    }

    pub fn register_collector(&mut self, collector: Arc<dyn Collector>) {
        self.collectors.insert(collector.id().to_string(), collector);
    }

    pub fn strategy(&self, id: &str) -> Option<Arc<dyn ProbeStrategy>> {
        self.strategies.get(id).map(|r| r.strategy.clone())
    }

    pub fn collector(&self, id: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.get(id).cloned()
    }

    /// Migrate a stored strategy configuration to its current version.
    pub fn parse_config(&self, strategy_id: &str, record: &VersionedRecord) -> Result<Value, ProbeError> {
        let registered = self
            .strategies
            .get(strategy_id)
            .ok_or_else(|| ProbeError::UnknownStrategy(strategy_id.to_string()))?;
        let migrated = registered.schema.migrate(record.clone())?;
        Ok(migrated.data)
    }

    /// The strategy's result merger, or the default one for unknown strategies.
    pub fn result_merger(&self, strategy_id: &str) -> ResultMerger {
        match self.strategy(strategy_id) {
            Some(strategy) => Box::new(move |existing: Option<AggregatedResult>, run: &Run| {
                strategy.merge_result(existing, run)
            }),
            None => Box::new(default_merge_result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeConnection;
    use crate::versioning::{MigrationStep, VersionError};
    use async_trait::async_trait;
    use serde_json::json;

    struct RenamingStrategy;

    #[async_trait]
    impl ProbeStrategy for RenamingStrategy {
        fn id(&self) -> &str {
            "renaming"
        }

        fn config_schema(&self) -> Result<VersionedSchema, VersionError> {
            VersionedSchema::new(
                2,
                vec![MigrationStep::new(1, 2, "address -> url", |mut data| {
                    if let Some(obj) = data.as_object_mut() {
                        if let Some(v) = obj.remove("address") {
                            obj.insert("url".to_string(), v);
                        }
                    }
                    Ok(data)
                })],
            )
        }

        async fn create_connection(&self, _config: &Value) -> Result<Arc<dyn ProbeConnection>, ProbeError> {
            Err(ProbeError::Network("unused".to_string()))
        }
    }

    struct BrokenStrategy;

    #[async_trait]
    impl ProbeStrategy for BrokenStrategy {
        fn id(&self) -> &str {
            "broken"
        }

        fn config_schema(&self) -> Result<VersionedSchema, VersionError> {
            VersionedSchema::new(3, vec![MigrationStep::new(1, 2, "only step", Ok)])
        }

        async fn create_connection(&self, _config: &Value) -> Result<Arc<dyn ProbeConnection>, ProbeError> {
            Err(ProbeError::Network("unused".to_string()))
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ProbeRegistry::with_builtins().unwrap();
        assert!(registry.strategy("http").is_some());
        assert!(registry.strategy("tcp").is_some());
        assert!(registry.collector("http.request").is_some());
        assert!(registry.collector("tcp.banner").is_some());
        assert!(registry.strategy("smtp").is_none());
    }

    #[test]
    fn test_parse_config_migrates() {
        let mut registry = ProbeRegistry::new();
        registry.register_strategy(Arc::new(RenamingStrategy)).unwrap();

        let config = registry
            .parse_config("renaming", &VersionedRecord::new(1, json!({"address": "x"})))
            .unwrap();
        assert_eq!(config, json!({"url": "x"}));

        let err = registry
            .parse_config("renaming", &VersionedRecord::new(5, json!({})))
            .unwrap_err();
        assert!(matches!(err, ProbeError::Version(VersionError::FromFuture { .. })));

        assert!(matches!(
            registry.parse_config("missing", &VersionedRecord::new(1, json!({}))),
            Err(ProbeError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_invalid_chain_rejected_at_registration() {
        let mut registry = ProbeRegistry::new();
        let err = registry.register_strategy(Arc::new(BrokenStrategy)).unwrap_err();
        assert!(matches!(err, ProbeError::Version(VersionError::WrongEnd { .. })));
        assert!(registry.strategy("broken").is_none());
    }
}
