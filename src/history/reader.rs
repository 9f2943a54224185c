//! Read-side queries over stored runs and aggregates.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use super::{
    buckets_from_runs, calculate_bucket_interval, compute_availability, merge_tiered_buckets,
    reaggregate_buckets, Bucket, DEFAULT_TARGET_POINTS,
};
use crate::db::{AggregateTier, DbError, Store, SystemCheck};
use crate::health::{evaluate_health_status, worst_status, HealthStatus};
use crate::probe::{default_merge_result, ProbeRegistry, ResultMerger};
use crate::versioning::VersionError;

const HOUR_MS: i64 = 3_600_000;

/// History error types.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("stored thresholds are invalid: {0}")]
    Version(#[from] VersionError),
    #[error("invalid range: {0}")]
    InvalidRange(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckHealth {
    pub configuration_id: String,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub system_id: String,
    pub status: HealthStatus,
    pub evaluated_at: DateTime<Utc>,
    pub checks: Vec<CheckHealth>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub system_id: String,
    pub configuration_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub target_points: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOptions {
    #[serde(default)]
    pub include_aggregated_result: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedHistory {
    pub buckets: Vec<Bucket>,
    pub bucket_interval_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityStats {
    pub availability_31_days: Option<f64>,
    pub availability_365_days: Option<f64>,
    pub total_runs_31_days: u64,
    pub total_runs_365_days: u64,
}

/// Composes stored runs and tier rows into caller-facing answers.
pub struct RetentionReader {
    store: Arc<Store>,
    registry: Arc<ProbeRegistry>,
}

impl RetentionReader {
    pub fn new(store: Arc<Store>, registry: Arc<ProbeRegistry>) -> Self {
        Self { store, registry }
    }

    /// Debounced status of one pair.
    pub fn get_pair_status(&self, system_id: &str, configuration_id: &str) -> Result<HealthStatus, HistoryError> {
        match self.store.get_system_check(system_id, configuration_id)? {
            Some(pair) => self.evaluate_pair(&pair),
            None => Ok(HealthStatus::Healthy),
        }
    }

    fn evaluate_pair(&self, pair: &SystemCheck) -> Result<HealthStatus, HistoryError> {
        let thresholds = pair.state_thresholds()?;
        let runs = self.store.get_recent_runs(
            &pair.system_id,
            &pair.configuration_id,
            thresholds.required_history(),
        )?;
        let statuses: Vec<HealthStatus> = runs.iter().map(|r| r.status).collect();
        Ok(evaluate_health_status(&statuses, &thresholds))
    }

    /// Worst status over every enabled check of a system.
    pub fn get_system_health_status(&self, system_id: &str) -> Result<SystemHealth, HistoryError> {
        let pairs = self.store.get_system_checks_for_system(system_id)?;
        let mut checks = Vec::new();
        for pair in pairs.iter().filter(|p| p.enabled) {
            checks.push(CheckHealth {
                configuration_id: pair.configuration_id.clone(),
                status: self.evaluate_pair(pair)?,
            });
        }

        Ok(SystemHealth {
            system_id: system_id.to_string(),
            status: worst_status(checks.iter().map(|c| c.status)),
            evaluated_at: Utc::now(),
            checks,
        })
    }

    /// Bucketed history of a pair over `[start_date, end_date)`.
    pub fn get_aggregated_history(
        &self,
        query: &HistoryQuery,
        options: HistoryOptions,
    ) -> Result<AggregatedHistory, HistoryError> {
        let start = query.start_date;
        let end = query.end_date;
        if end <= start {
            return Err(HistoryError::InvalidRange(format!(
                "end {} is not after start {}",
                end, start
            )));
        }

        let interval_ms = calculate_bucket_interval(
            start,
            end,
            query.target_points.unwrap_or(DEFAULT_TARGET_POINTS),
        );
        let sys = query.system_id.as_str();
        let cfg = query.configuration_id.as_str();

        let runs = self.store.get_runs(sys, cfg, start, end)?;
        let merge = self.result_merger(cfg);
        let raw = buckets_from_runs(&runs, start, end, interval_ms.min(HOUR_MS), merge.as_ref());

        // Rows that start before the range can still overlap it.
        let hourly = self.tier_buckets(sys, cfg, AggregateTier::Hourly, start, end)?;
        let daily = self.tier_buckets(sys, cfg, AggregateTier::Daily, start, end)?;

        let merged = merge_tiered_buckets(raw, hourly, daily);
        let mut buckets = reaggregate_buckets(&merged, interval_ms, start, end);

        if !options.include_aggregated_result {
            for b in &mut buckets {
                b.aggregated_result = None;
            }
        }

        tracing::debug!(
            "RetentionReader: {} buckets for {}/{} ({} raw runs, interval {}ms)",
            buckets.len(),
            sys,
            cfg,
            runs.len(),
            interval_ms
        );

        Ok(AggregatedHistory {
            buckets,
            bucket_interval_seconds: interval_ms as f64 / 1000.0,
        })
    }

    /// Availability over the last 31 and 365 UTC days, today included.
    pub fn get_availability_stats(
        &self,
        system_id: &str,
        configuration_id: &str,
    ) -> Result<AvailabilityStats, HistoryError> {
        let now = Utc::now();
        let month = self.availability_since(system_id, configuration_id, now, 31)?;
        let year = self.availability_since(system_id, configuration_id, now, 365)?;
        Ok(AvailabilityStats {
            availability_31_days: month.percent,
            availability_365_days: year.percent,
            total_runs_31_days: month.total_runs,
            total_runs_365_days: year.total_runs,
        })
    }

    fn availability_since(
        &self,
        system_id: &str,
        configuration_id: &str,
        now: DateTime<Utc>,
        days: i64,
    ) -> Result<super::Availability, HistoryError> {
        let start = super::day_start(now) - ChronoDuration::days(days - 1);
        let end = now + ChronoDuration::milliseconds(1);

        let daily: Vec<Bucket> = self
            .store
            .get_aggregates(system_id, configuration_id, AggregateTier::Daily, start, end)?
            .iter()
            .map(Bucket::from_aggregate)
            .collect();
        let hourly: Vec<Bucket> = self
            .store
            .get_aggregates(system_id, configuration_id, AggregateTier::Hourly, start, end)?
            .iter()
            .map(Bucket::from_aggregate)
            .collect();
        let runs = self.store.get_runs(system_id, configuration_id, start, end)?;
        let raw = buckets_from_runs(&runs, start, end, HOUR_MS, &default_merge_result);

        Ok(compute_availability(&daily, &hourly, &raw))
    }

    fn tier_buckets(
        &self,
        system_id: &str,
        configuration_id: &str,
        tier: AggregateTier,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, HistoryError> {
        let rows = self
            .store
            .get_aggregates(system_id, configuration_id, tier, start - tier.duration(), end)?;
        Ok(rows
            .iter()
            .map(Bucket::from_aggregate)
            .filter(|b| b.overlaps(start, end))
            .collect())
    }

    /// The strategy's result merger for a configuration, or the default one.
    fn result_merger(&self, configuration_id: &str) -> ResultMerger {
        match self.store.get_configuration(configuration_id) {
            Ok(Some(cfg)) => self.registry.result_merger(&cfg.strategy_id),
            _ => Box::new(default_merge_result),
        }
    }
}
