//! Configuration module for HealthTrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "HEALTHTRAIL_";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "healthtrail.db")
    pub db_path: String,
    /// Consumer group health-check workers join (default: "health-checks")
    pub consumer_group: String,
    /// Maximum concurrent health-check executions (default: 10)
    pub worker_concurrency: usize,
    /// Deadline for connect plus collectors of one firing (default: 60s)
    pub execution_timeout: Duration,
    pub rollup_interval: Duration,
    /// How long a closed hour or day waits for late runs before rollup.
    pub rollup_grace: Duration,
    pub retention_interval: Duration,
    /// Webhook receiving state changes, if any.
    pub webhook_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "healthtrail.db".to_string(),
            consumer_group: "health-checks".to_string(),
            worker_concurrency: 10,
            execution_timeout: Duration::from_secs(60),
            rollup_interval: Duration::from_secs(60),
            rollup_grace: Duration::from_secs(60),
            retention_interval: Duration::from_secs(3600),
            webhook_url: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HEALTHTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `HEALTHTRAIL_DB_PATH`: Database file path (default: "healthtrail.db")
    /// - `HEALTHTRAIL_CONSUMER_GROUP`: Worker consumer group (default: "health-checks")
    /// - `HEALTHTRAIL_WORKER_CONCURRENCY`: Concurrent executions (default: 10)
    /// - `HEALTHTRAIL_EXECUTION_TIMEOUT_SECS`: Per-firing deadline (default: 60)
    /// - `HEALTHTRAIL_ROLLUP_INTERVAL_SECS`: Rollup period (default: 60)
    /// - `HEALTHTRAIL_ROLLUP_GRACE_SECS`: Late-run grace (default: 60)
    /// - `HEALTHTRAIL_RETENTION_INTERVAL_SECS`: Retention period (default: 3600)
    /// - `HEALTHTRAIL_WEBHOOK_URL`: State-change webhook (default: unset)
    pub fn load() -> Self {
        Self::load_from(|key| env::var(key).ok())
    }

    /// Load from an arbitrary variable source. Keys are unprefixed.
    pub fn load_from<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        if let Some(port) = var("HTTP_PORT").and_then(|v| parse(&v)) {
            cfg.http_port = port;
        }
        if let Some(db_path) = var("DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(group) = var("CONSUMER_GROUP") {
            cfg.consumer_group = group;
        }
        if let Some(n) = var("WORKER_CONCURRENCY").and_then(|v| parse::<usize>(&v)) {
            if n > 0 {
                cfg.worker_concurrency = n;
            }
        }
        if let Some(d) = var("EXECUTION_TIMEOUT_SECS").and_then(|v| seconds(&v)) {
            if !d.is_zero() {
                cfg.execution_timeout = d;
            }
        }
        if let Some(d) = var("ROLLUP_INTERVAL_SECS").and_then(|v| seconds(&v)) {
            if !d.is_zero() {
                cfg.rollup_interval = d;
            }
        }
        if let Some(d) = var("ROLLUP_GRACE_SECS").and_then(|v| seconds(&v)) {
            cfg.rollup_grace = d;
        }
        if let Some(d) = var("RETENTION_INTERVAL_SECS").and_then(|v| seconds(&v)) {
            if !d.is_zero() {
                cfg.retention_interval = d;
            }
        }
        cfg.webhook_url = var("WEBHOOK_URL");

        cfg
    }
}

fn parse<T: FromStr>(value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Config: Ignoring unparseable value {:?}", value);
            None
        }
    }
}

fn seconds(value: &str) -> Option<Duration> {
    parse::<u64>(value).map(Duration::from_secs)
}
