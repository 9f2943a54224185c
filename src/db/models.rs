//! Database model types.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::aggregation::AggregatedResult;
use crate::health::{HealthStatus, StateThresholds};
use crate::probe::Assertion;
use crate::versioning::{VersionError, VersionedRecord};

/// A check configuration: which strategy to run, how, and how often.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConfiguration {
    pub id: String,
    pub name: String,
    pub strategy_id: String,
    pub config: VersionedRecord,
    #[serde(default)]
    pub collectors: Vec<CollectorEntry>,
    pub interval_seconds: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// One configured sub-probe of a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorEntry {
    /// Key under which this collector's result is stored.
    pub id: String,
    pub collector_id: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

/// Retention horizons for one pair. Must satisfy `raw < hourly < daily`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    pub raw_retention_days: u32,
    pub hourly_retention_days: u32,
    pub daily_retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_retention_days: 7,
            hourly_retention_days: 30,
            daily_retention_days: 365,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.raw_retention_days == 0 {
            return Err("raw retention must be at least one day".to_string());
        }
        if self.raw_retention_days >= self.hourly_retention_days {
            return Err(format!(
                "raw retention ({} days) must be shorter than hourly retention ({} days)",
                self.raw_retention_days, self.hourly_retention_days
            ));
        }
        if self.hourly_retention_days >= self.daily_retention_days {
            return Err(format!(
                "hourly retention ({} days) must be shorter than daily retention ({} days)",
                self.hourly_retention_days, self.daily_retention_days
            ));
        }
        Ok(())
    }
}

/// Association of a monitored system with a check configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCheck {
    pub system_id: String,
    pub configuration_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub thresholds: Option<VersionedRecord>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl SystemCheck {
    /// The configured policy, or the default when none is stored.
    pub fn state_thresholds(&self) -> Result<StateThresholds, VersionError> {
        match &self.thresholds {
            Some(record) => StateThresholds::from_record(record.clone()),
            None => Ok(StateThresholds::default()),
        }
    }
}

/// One probe execution outcome. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: i64,
    pub system_id: String,
    pub configuration_id: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

/// Retention tier of a stored summary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateTier {
    Hourly,
    Daily,
}

impl AggregateTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateTier::Hourly => "hourly",
            AggregateTier::Daily => "daily",
        }
    }

    pub fn duration(&self) -> ChronoDuration {
        match self {
            AggregateTier::Hourly => ChronoDuration::hours(1),
            AggregateTier::Daily => ChronoDuration::days(1),
        }
    }

    pub fn window_seconds(&self) -> i64 {
        self.duration().num_seconds()
    }
}

impl fmt::Display for AggregateTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(AggregateTier::Hourly),
            "daily" => Ok(AggregateTier::Daily),
            other => Err(format!("unknown aggregate tier: {}", other)),
        }
    }
}

/// A compacted summary of all runs of one pair within one tier window.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub system_id: String,
    pub configuration_id: String,
    pub tier: AggregateTier,
    pub bucket_start: DateTime<Utc>,
    pub run_count: u64,
    pub healthy_count: u64,
    pub degraded_count: u64,
    pub unhealthy_count: u64,
    pub latency_sum_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    /// Serialized latency t-digest, empty when no latencies were recorded.
    pub latency_digest: Vec<u8>,
    pub aggregated_result: Option<AggregatedResult>,
}

/// A maintenance window for a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Maintenance {
    pub id: i64,
    pub system_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub suppress_notifications: bool,
    #[serde(default)]
    pub description: String,
}
