//! Tiered history: raw runs, hourly rows and daily rows combined into one
//! timeline at query time.
//!
//! Every source is first normalized into [`Bucket`]s. Buckets of different
//! tiers never blend: where spans overlap, the more precise tier wins.

mod merger;
mod reader;

pub use merger::*;
pub use reader::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::aggregation::{merge_aggregated_results, AggregatedResult};
use crate::db::{AggregateRow, AggregateTier, Run};
use crate::health::HealthStatus;

/// Origin of a bucket. Declaration order is precision order, most precise first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Raw,
    Hourly,
    Daily,
}

impl From<AggregateTier> for SourceTier {
    fn from(tier: AggregateTier) -> Self {
        match tier {
            AggregateTier::Hourly => SourceTier::Hourly,
            AggregateTier::Daily => SourceTier::Daily,
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceTier::Raw => "raw",
            SourceTier::Hourly => "hourly",
            SourceTier::Daily => "daily",
        })
    }
}

/// Aggregate of run outcomes over `[bucket_start, bucket_end)`.
///
/// `healthy_count + degraded_count + unhealthy_count == run_count` always holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub run_count: u64,
    pub healthy_count: u64,
    pub degraded_count: u64,
    pub unhealthy_count: u64,
    pub latency_sum_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_result: Option<AggregatedResult>,
    pub source_tier: SourceTier,
    /// Individual latencies, kept only for raw buckets so percentiles stay exact.
    #[serde(skip)]
    pub latencies_ms: Vec<f64>,
}

impl Bucket {
    pub fn empty(start: DateTime<Utc>, end: DateTime<Utc>, tier: SourceTier) -> Self {
        Self {
            bucket_start: start,
            bucket_end: end,
            run_count: 0,
            healthy_count: 0,
            degraded_count: 0,
            unhealthy_count: 0,
            latency_sum_ms: None,
            min_latency_ms: None,
            max_latency_ms: None,
            p95_latency_ms: None,
            aggregated_result: None,
            source_tier: tier,
            latencies_ms: Vec::new(),
        }
    }

    /// Normalize a stored hourly or daily row.
    pub fn from_aggregate(row: &AggregateRow) -> Self {
        Self {
            bucket_start: row.bucket_start,
            bucket_end: row.bucket_start + row.tier.duration(),
            run_count: row.run_count,
            healthy_count: row.healthy_count,
            degraded_count: row.degraded_count,
            unhealthy_count: row.unhealthy_count,
            latency_sum_ms: row.latency_sum_ms,
            min_latency_ms: row.min_latency_ms,
            max_latency_ms: row.max_latency_ms,
            p95_latency_ms: row.p95_latency_ms,
            aggregated_result: row.aggregated_result.clone(),
            source_tier: row.tier.into(),
            latencies_ms: Vec::new(),
        }
    }

    /// Fold one raw run into this bucket. `merge` is the strategy's result merger.
    pub fn observe_run<F>(&mut self, run: &Run, merge: &F)
    where
        F: Fn(Option<AggregatedResult>, &Run) -> AggregatedResult + ?Sized,
    {
        self.run_count += 1;
        match run.status {
            HealthStatus::Healthy => self.healthy_count += 1,
            HealthStatus::Degraded => self.degraded_count += 1,
            HealthStatus::Unhealthy => self.unhealthy_count += 1,
        }
        if let Some(latency) = run.latency_ms {
            self.latency_sum_ms = Some(self.latency_sum_ms.unwrap_or(0.0) + latency);
            self.min_latency_ms = Some(self.min_latency_ms.map_or(latency, |m| m.min(latency)));
            self.max_latency_ms = Some(self.max_latency_ms.map_or(latency, |m| m.max(latency)));
            self.latencies_ms.push(latency);
        }
        self.aggregated_result = Some(merge(self.aggregated_result.take(), run));
    }

    /// Add another bucket's counts, latency statistics and aggregated result.
    /// Percentiles are not touched; they cannot be combined this way.
    pub fn absorb(&mut self, other: &Bucket) {
        self.run_count += other.run_count;
        self.healthy_count += other.healthy_count;
        self.degraded_count += other.degraded_count;
        self.unhealthy_count += other.unhealthy_count;
        self.latency_sum_ms = add_options(self.latency_sum_ms, other.latency_sum_ms, |a, b| a + b);
        self.min_latency_ms = add_options(self.min_latency_ms, other.min_latency_ms, f64::min);
        self.max_latency_ms = add_options(self.max_latency_ms, other.max_latency_ms, f64::max);
        self.aggregated_result =
            merge_aggregated_results(self.aggregated_result.as_ref(), other.aggregated_result.as_ref());
        self.latencies_ms.extend_from_slice(&other.latencies_ms);
    }

    /// Set the exact p95 from the collected latencies.
    pub fn finish_raw(&mut self) {
        self.p95_latency_ms = nearest_rank_percentile(&self.latencies_ms, 95.0);
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.bucket_start < end && start < self.bucket_end
    }
}

fn add_options(a: Option<f64>, b: Option<f64>, f: impl Fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Nearest-rank percentile. `None` for an empty set.
pub fn nearest_rank_percentile(values: &[f64], percentile: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}

/// Group raw runs into buckets of `interval_ms` aligned to `range_start`.
/// Runs must lie within the range; buckets come back in time order.
pub fn buckets_from_runs<F>(
    runs: &[Run],
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    interval_ms: i64,
    merge: &F,
) -> Vec<Bucket>
where
    F: Fn(Option<AggregatedResult>, &Run) -> AggregatedResult + ?Sized,
{
    let interval_ms = interval_ms.max(1);
    let mut buckets: std::collections::BTreeMap<i64, Bucket> = std::collections::BTreeMap::new();

    for run in runs {
        if run.timestamp < range_start || run.timestamp >= range_end {
            continue;
        }
        let offset = (run.timestamp - range_start).num_milliseconds();
        let index = offset / interval_ms;
        let bucket = buckets.entry(index).or_insert_with(|| {
            let start = range_start + chrono::Duration::milliseconds(index * interval_ms);
            let end = (start + chrono::Duration::milliseconds(interval_ms)).min(range_end);
            Bucket::empty(start, end, SourceTier::Raw)
        });
        bucket.observe_run(run, merge);
    }

    buckets
        .into_values()
        .map(|mut b| {
            b.finish_raw();
            b
        })
        .collect()
}
