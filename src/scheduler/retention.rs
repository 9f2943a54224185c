//! Retention manager for deleting runs and rows past their horizon.

use crate::db::{AggregateTier, DbError, Store, SystemCheck};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Rows deleted by one retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub runs: usize,
    pub hourly: usize,
    pub daily: usize,
}

/// Manager for deleting data past retention periods.
pub struct RetentionManager {
    store: Arc<Store>,
    interval: Duration,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let (tx, _) = broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Apply every pair's retention horizons as of `now`.
pub fn process_retention(store: &Store, now: DateTime<Utc>) -> RetentionReport {
    let pairs = match store.get_system_checks() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("RetentionManager: Failed to get system checks: {}", e);
            return RetentionReport::default();
        }
    };

    let mut report = RetentionReport::default();
    for pair in pairs {
        match prune_pair(store, &pair, now) {
            Ok(r) => {
                report.runs += r.runs;
                report.hourly += r.hourly;
                report.daily += r.daily;
            }
            Err(e) => tracing::error!(
                "RetentionManager: Failed to prune {}/{}: {}",
                pair.system_id,
                pair.configuration_id,
                e
            ),
        }
    }

    if report != RetentionReport::default() {
        tracing::info!(
            "RetentionManager: Deleted {} runs, {} hourly rows, {} daily rows",
            report.runs,
            report.hourly,
            report.daily
        );
    }
    report
}

fn prune_pair(store: &Store, pair: &SystemCheck, now: DateTime<Utc>) -> Result<RetentionReport, DbError> {
    let (sys, cfg) = (pair.system_id.as_str(), pair.configuration_id.as_str());
    let retention = &pair.retention;
    let horizon = |days: u32| now - ChronoDuration::days(i64::from(days));

    Ok(RetentionReport {
        runs: store.delete_runs_before(sys, cfg, horizon(retention.raw_retention_days))?,
        hourly: store.delete_aggregates_before(
            sys,
            cfg,
            AggregateTier::Hourly,
            horizon(retention.hourly_retention_days),
        )?,
        daily: store.delete_aggregates_before(
            sys,
            cfg,
            AggregateTier::Daily,
            horizon(retention.daily_retention_days),
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AggregateRow, CheckConfiguration, RetentionConfig, Run};
    use crate::health::HealthStatus;
    use crate::versioning::VersionedRecord;
    use chrono::TimeZone;
    use serde_json::json;

    fn store() -> Store {
        let store = Store::in_memory().unwrap();
        store
            .upsert_configuration(&CheckConfiguration {
                id: "cfg".to_string(),
                name: "tcp".to_string(),
                strategy_id: "tcp".to_string(),
                config: VersionedRecord::new(1, json!({"host": "localhost", "port": 22})),
                collectors: Vec::new(),
                interval_seconds: 60,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();
        store
    }

    fn pair(system_id: &str, retention: RetentionConfig) -> SystemCheck {
        SystemCheck {
            system_id: system_id.to_string(),
            configuration_id: "cfg".to_string(),
            enabled: true,
            thresholds: None,
            retention,
            updated_at: Utc::now(),
        }
    }

    fn add_run(store: &Store, system_id: &str, ts: DateTime<Utc>) {
        let mut run = Run {
            id: 0,
            system_id: system_id.to_string(),
            configuration_id: "cfg".to_string(),
            status: HealthStatus::Healthy,
            latency_ms: Some(10.0),
            result: json!({}),
            timestamp: ts,
        };
        store.add_run(&mut run).unwrap();
    }

    fn row(system_id: &str, tier: AggregateTier, start: DateTime<Utc>) -> AggregateRow {
        AggregateRow {
            system_id: system_id.to_string(),
            configuration_id: "cfg".to_string(),
            tier,
            bucket_start: start,
            run_count: 1,
            healthy_count: 1,
            degraded_count: 0,
            unhealthy_count: 0,
            latency_sum_ms: Some(10.0),
            min_latency_ms: Some(10.0),
            max_latency_ms: Some(10.0),
            p95_latency_ms: Some(10.0),
            latency_digest: Vec::new(),
            aggregated_result: None,
        }
    }

    #[test]
    fn test_each_tier_has_its_own_horizon() {
        let store = store();
        store.upsert_system_check(&pair("sys", RetentionConfig::default())).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        for days in [1, 8, 20] {
            add_run(&store, "sys", now - ChronoDuration::days(days));
        }
        store
            .add_aggregates(&[
                row("sys", AggregateTier::Hourly, now - ChronoDuration::days(20)),
                row("sys", AggregateTier::Hourly, now - ChronoDuration::days(40)),
                row("sys", AggregateTier::Daily, now - ChronoDuration::days(200)),
                row("sys", AggregateTier::Daily, now - ChronoDuration::days(400)),
            ])
            .unwrap();

        let report = process_retention(&store, now);
        assert_eq!(
            report,
            RetentionReport {
                runs: 2,
                hourly: 1,
                daily: 1
            }
        );

        let runs = store.get_recent_runs("sys", "cfg", 10).unwrap();
        assert_eq!(runs.len(), 1);
        let earliest = now - ChronoDuration::days(500);
        assert_eq!(
            store
                .get_aggregates("sys", "cfg", AggregateTier::Hourly, earliest, now)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .get_aggregates("sys", "cfg", AggregateTier::Daily, earliest, now)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_pairs_use_their_own_config() {
        let store = store();
        store.upsert_system_check(&pair("short", RetentionConfig {
            raw_retention_days: 1,
            hourly_retention_days: 2,
            daily_retention_days: 3,
        }))
        .unwrap();
        store.upsert_system_check(&pair("long", RetentionConfig::default())).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        add_run(&store, "short", now - ChronoDuration::days(2));
        add_run(&store, "long", now - ChronoDuration::days(2));

        let report = process_retention(&store, now);
        assert_eq!(report.runs, 1);
        assert!(store.get_recent_runs("short", "cfg", 10).unwrap().is_empty());
        assert_eq!(store.get_recent_runs("long", "cfg", 10).unwrap().len(), 1);
    }
}
