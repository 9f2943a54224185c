//! Hysteresis policies for the state evaluator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

use crate::versioning::{MigrationStep, VersionError, VersionedRecord, VersionedSchema};

pub const THRESHOLDS_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessThreshold {
    pub min_success_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureThreshold {
    pub min_failure_count: u32,
}

/// How a run history becomes a debounced status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum StateThresholds {
    /// Compare the newest streak of same-class runs against the thresholds.
    Consecutive {
        healthy: SuccessThreshold,
        degraded: FailureThreshold,
        unhealthy: FailureThreshold,
    },
    /// Count failures among the newest `window_size` runs.
    Window {
        #[serde(rename = "windowSize")]
        window_size: u32,
        degraded: FailureThreshold,
        unhealthy: FailureThreshold,
    },
}

impl Default for StateThresholds {
    fn default() -> Self {
        StateThresholds::Consecutive {
            healthy: SuccessThreshold { min_success_count: 1 },
            degraded: FailureThreshold { min_failure_count: 2 },
            unhealthy: FailureThreshold { min_failure_count: 5 },
        }
    }
}

impl StateThresholds {
    /// Number of newest runs the evaluator needs to see.
    pub fn required_history(&self) -> usize {
        match self {
            StateThresholds::Consecutive {
                healthy,
                degraded,
                unhealthy,
            } => healthy
                .min_success_count
                .max(degraded.min_failure_count)
                .max(unhealthy.min_failure_count)
                .max(1) as usize,
            StateThresholds::Window { window_size, .. } => (*window_size).max(1) as usize,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let counts = match self {
            StateThresholds::Consecutive {
                healthy,
                degraded,
                unhealthy,
            } => [
                ("healthy.minSuccessCount", healthy.min_success_count),
                ("degraded.minFailureCount", degraded.min_failure_count),
                ("unhealthy.minFailureCount", unhealthy.min_failure_count),
            ],
            StateThresholds::Window {
                window_size,
                degraded,
                unhealthy,
            } => [
                ("windowSize", *window_size),
                ("degraded.minFailureCount", degraded.min_failure_count),
                ("unhealthy.minFailureCount", unhealthy.min_failure_count),
            ],
        };
        for (name, value) in counts {
            if value == 0 {
                return Err(format!("{} must be at least 1", name));
            }
        }
        Ok(())
    }

    /// Wrap at the current schema version for storage.
    pub fn to_record(&self) -> Result<VersionedRecord, VersionError> {
        thresholds_schema().wrap(self)
    }

    /// Migrate a stored record and parse it.
    pub fn from_record(record: VersionedRecord) -> Result<Self, VersionError> {
        thresholds_schema().parse(record)
    }
}

/// Version 1 had no `mode` tag and was always consecutive.
fn tag_consecutive_mode(mut data: Value) -> Result<Value, String> {
    let obj = data
        .as_object_mut()
        .ok_or_else(|| "thresholds must be an object".to_string())?;
    obj.entry("mode")
        .or_insert_with(|| Value::String("consecutive".to_string()));
    Ok(data)
}

fn build_thresholds_schema() -> Result<VersionedSchema, VersionError> {
    VersionedSchema::new(
        THRESHOLDS_VERSION,
        vec![MigrationStep::new(
            1,
            2,
            "tag legacy thresholds with consecutive mode",
            tag_consecutive_mode,
        )],
    )
}

/// The validated threshold schema, built once.
pub fn thresholds_schema() -> &'static VersionedSchema {
    static SCHEMA: OnceLock<VersionedSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| match build_thresholds_schema() {
        Ok(schema) => schema,
        Err(e) => {
            tracing::error!("Thresholds: invalid migration chain, accepting current version only: {}", e);
            VersionedSchema::current(THRESHOLDS_VERSION)
        }
    })
}
