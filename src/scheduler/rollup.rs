//! Rollup manager for compacting raw runs into hourly and daily rows.

use crate::db::{
    estimate_p95, latency_digest, merge_latency_digests, serialize_tdigest, AggregateRow,
    AggregateTier, DbError, Store, SystemCheck,
};
use crate::history::{buckets_from_runs, Bucket};
use crate::probe::ProbeRegistry;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Rows written by one rollup pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RollupReport {
    pub hourly: usize,
    pub daily: usize,
}

/// Manager for rolling up raw runs into tier rows.
pub struct RollupManager {
    store: Arc<Store>,
    registry: Arc<ProbeRegistry>,
    interval: Duration,
    grace: ChronoDuration,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl RollupManager {
    /// `grace` is how long a window stays open after its end for late runs.
    pub fn new(store: Arc<Store>, registry: Arc<ProbeRegistry>, interval: Duration, grace: ChronoDuration) -> Self {
        Self {
            store,
            registry,
            interval,
            grace,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the rollup manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let stop = self.stop.clone();
        let period = self.interval;
        let grace = self.grace;

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
                        process_rollups(&store, &registry, Utc::now(), grace);
                    }
                }
            }
            tracing::info!("RollupManager: Stopped");
        });
    }

    /// Stop the rollup manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Roll up every pair. Failures are logged per pair and do not stop the pass.
pub fn process_rollups(store: &Store, registry: &ProbeRegistry, now: DateTime<Utc>, grace: ChronoDuration) -> RollupReport {
    let pairs = match store.get_system_checks() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("RollupManager: Failed to get system checks: {}", e);
            return RollupReport::default();
        }
    };

    let mut report = RollupReport::default();
    for pair in pairs {
        // Hourly first; daily rows are built from it.
        match roll_hourly(store, registry, &pair, now, grace) {
            Ok(n) => report.hourly += n,
            Err(e) => {
                tracing::error!(
                    "RollupManager: Hourly rollup failed for {}/{}: {}",
                    pair.system_id,
                    pair.configuration_id,
                    e
                );
                continue;
            }
        }
        match roll_daily(store, &pair, now, grace) {
            Ok(n) => report.daily += n,
            Err(e) => tracing::error!(
                "RollupManager: Daily rollup failed for {}/{}: {}",
                pair.system_id,
                pair.configuration_id,
                e
            ),
        }
    }
    report
}

/// Compact closed hours of raw runs. Hours without runs get no row.
fn roll_hourly(
    store: &Store,
    registry: &ProbeRegistry,
    pair: &SystemCheck,
    now: DateTime<Utc>,
    grace: ChronoDuration,
) -> Result<usize, DbError> {
    let (sys, cfg) = (pair.system_id.as_str(), pair.configuration_id.as_str());
    let tier = AggregateTier::Hourly;

    let start = match store.get_last_aggregate_start(sys, cfg, tier)? {
        Some(last) => last + tier.duration(),
        None => match store.get_earliest_run_time(sys, cfg)? {
            Some(earliest) => truncate_to_window(earliest, tier.window_seconds()),
            None => return Ok(0),
        },
    };
    let cutoff = truncate_to_window(now - grace, tier.window_seconds());
    if start >= cutoff {
        return Ok(0);
    }

    let runs = store.get_runs(sys, cfg, start, cutoff)?;
    if runs.is_empty() {
        return Ok(0);
    }

    let strategy_id = store
        .get_configuration(cfg)?
        .map(|c| c.strategy_id)
        .unwrap_or_default();
    let merge = registry.result_merger(&strategy_id);
    let rows: Vec<AggregateRow> = buckets_from_runs(
        &runs,
        start,
        cutoff,
        tier.duration().num_milliseconds(),
        merge.as_ref(),
    )
    .into_iter()
    .map(|bucket| {
        let digest = latency_digest(&bucket.latencies_ms);
        row_from_bucket(pair, tier, bucket, digest)
    })
    .collect();

    store.add_aggregates(&rows)?;
    tracing::debug!(
        "RollupManager: Saved {} hourly rows for {}/{} ({} runs)",
        rows.len(),
        sys,
        cfg,
        runs.len()
    );
    Ok(rows.len())
}

/// Compact closed days of hourly rows. The p95 comes from the merged digests.
fn roll_daily(store: &Store, pair: &SystemCheck, now: DateTime<Utc>, grace: ChronoDuration) -> Result<usize, DbError> {
    let (sys, cfg) = (pair.system_id.as_str(), pair.configuration_id.as_str());
    let tier = AggregateTier::Daily;

    let start = match store.get_last_aggregate_start(sys, cfg, tier)? {
        Some(last) => last + tier.duration(),
        None => match store.get_earliest_aggregate_start(sys, cfg, AggregateTier::Hourly)? {
            Some(earliest) => truncate_to_window(earliest, tier.window_seconds()),
            None => return Ok(0),
        },
    };
    let cutoff = truncate_to_window(now - grace, tier.window_seconds());
    if start >= cutoff {
        return Ok(0);
    }

    let hourly = store.get_aggregates(sys, cfg, AggregateTier::Hourly, start, cutoff)?;
    let mut days: BTreeMap<DateTime<Utc>, Vec<AggregateRow>> = BTreeMap::new();
    for row in hourly {
        days.entry(truncate_to_window(row.bucket_start, tier.window_seconds()))
            .or_default()
            .push(row);
    }

    let rows: Vec<AggregateRow> = days
        .into_iter()
        .map(|(day, hours)| {
            let mut bucket = Bucket::empty(day, day + tier.duration(), tier.into());
            for hour in &hours {
                bucket.absorb(&Bucket::from_aggregate(hour));
            }

            let digest = merge_latency_digests(hours.iter().map(|h| h.latency_digest.as_slice()));
            bucket.p95_latency_ms = match &digest {
                Some(td) => Some(estimate_p95(td)),
                // Rows written without a digest still carry their own p95.
                None => hours.iter().filter_map(|h| h.p95_latency_ms).reduce(f64::max),
            };
            let blob = digest.as_ref().map(serialize_tdigest).unwrap_or_default();
            row_from_bucket(pair, tier, bucket, blob)
        })
        .collect();

    store.add_aggregates(&rows)?;
    if !rows.is_empty() {
        tracing::info!(
            "RollupManager: Saved {} daily rows for {}/{}",
            rows.len(),
            sys,
            cfg
        );
    }
    Ok(rows.len())
}

fn row_from_bucket(pair: &SystemCheck, tier: AggregateTier, bucket: Bucket, latency_digest: Vec<u8>) -> AggregateRow {
    AggregateRow {
        system_id: pair.system_id.clone(),
        configuration_id: pair.configuration_id.clone(),
        tier,
        bucket_start: bucket.bucket_start,
        run_count: bucket.run_count,
        healthy_count: bucket.healthy_count,
        degraded_count: bucket.degraded_count,
        unhealthy_count: bucket.unhealthy_count,
        latency_sum_ms: bucket.latency_sum_ms,
        min_latency_ms: bucket.min_latency_ms,
        max_latency_ms: bucket.max_latency_ms,
        p95_latency_ms: bucket.p95_latency_ms,
        latency_digest,
        aggregated_result: bucket.aggregated_result,
    }
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}
