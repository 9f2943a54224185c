//! Probe strategies and collectors.
//!
//! A strategy opens a connection to the monitored system; collectors run
//! against that connection and report results that assertions are checked
//! against. HTTP and TCP strategies are built in.

mod assertion;
mod http;
mod registry;
mod tcp;

pub use assertion::*;
pub use http::*;
pub use registry::*;
pub use tcp::*;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::aggregation::AggregatedResult;
use crate::db::Run;
use crate::health::HealthStatus;
use crate::versioning::{VersionError, VersionedSchema};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("unknown collector: {0}")]
    UnknownCollector(String),
    #[error("configuration version error: {0}")]
    Version(#[from] VersionError),
}

/// An open handle to a monitored system.
#[async_trait]
pub trait ProbeConnection: Send + Sync {
    /// Perform one request over the connection.
    async fn invoke(&self, request: &Value) -> Result<Value, ProbeError>;

    /// Release the connection. Called exactly once per connection.
    async fn close(&self);
}

/// Output of one collector execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorOutput {
    pub result: Value,
    pub error: Option<String>,
}

impl CollectorOutput {
    pub fn ok(result: Value) -> Self {
        Self { result, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// A sub-probe run against an open connection.
#[async_trait]
pub trait Collector: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(&self, config: &Value, connection: &dyn ProbeConnection) -> CollectorOutput;
}

/// A pluggable way of reaching a monitored system.
#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    fn id(&self) -> &str;

    /// Migration chain for this strategy's configuration.
    fn config_schema(&self) -> Result<VersionedSchema, VersionError> {
        Ok(VersionedSchema::current(1))
    }

    /// Open a connection. Must fail cleanly when the target is unreachable.
    async fn create_connection(&self, config: &Value) -> Result<Arc<dyn ProbeConnection>, ProbeError>;

    /// Fold one run into the live aggregated result for this strategy.
    fn merge_result(&self, existing: Option<AggregatedResult>, run: &Run) -> AggregatedResult {
        default_merge_result(existing, run)
    }
}

/// Latency, success-rate, error-count and latency-range statistics common to every strategy.
pub fn default_merge_result(existing: Option<AggregatedResult>, run: &Run) -> AggregatedResult {
    let mut result = existing.unwrap_or_default();
    result.observe_average("avgResponseTimeMs", run.latency_ms);
    result.observe_rate("successRate", Some(run.status == HealthStatus::Healthy));
    result.observe_flag("errorCount", Some(run.status == HealthStatus::Unhealthy));
    result.observe_min_max("responseTimeRange", run.latency_ms);
    result
}

/// Read an optional millisecond timeout from a config object.
pub(crate) fn config_timeout(config: &Value, default: Duration) -> Duration {
    config
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
