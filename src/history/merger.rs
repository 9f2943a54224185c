//! Tier precedence and re-bucketing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, BTreeSet};

use super::{nearest_rank_percentile, Bucket, SourceTier};

pub const DEFAULT_TARGET_POINTS: usize = 500;
pub const MIN_BUCKET_INTERVAL_MS: i64 = 1000;

/// Bucket width for a range: `max(range / target_points, 1s)`.
pub fn calculate_bucket_interval(start: DateTime<Utc>, end: DateTime<Utc>, target_points: usize) -> i64 {
    let points = if target_points == 0 {
        DEFAULT_TARGET_POINTS
    } else {
        target_points
    };
    let range_ms = (end - start).num_milliseconds().max(0);
    (range_ms / points as i64).max(MIN_BUCKET_INTERVAL_MS)
}

/// Sorted, non-overlapping spans already claimed by a more precise tier.
struct Coverage {
    spans: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Coverage {
    fn from_buckets<'a>(buckets: impl IntoIterator<Item = &'a Bucket>) -> Self {
        let mut raw: Vec<(DateTime<Utc>, DateTime<Utc>)> =
            buckets.into_iter().map(|b| (b.bucket_start, b.bucket_end)).collect();
        raw.sort();

        let mut spans: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::with_capacity(raw.len());
        for (start, end) in raw {
            match spans.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => spans.push((start, end)),
            }
        }
        Self { spans }
    }

    fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        // First span ending after `start`; spans are disjoint and sorted by end too.
        let idx = self.spans.partition_point(|(_, span_end)| *span_end <= start);
        self.spans.get(idx).is_some_and(|(span_start, _)| *span_start < end)
    }
}

/// Combine the three tiers into one timeline. Raw buckets are always kept;
/// an hourly bucket is kept only if no raw bucket overlaps it, and a daily
/// bucket only if no kept raw or hourly bucket overlaps it.
pub fn merge_tiered_buckets(raw: Vec<Bucket>, hourly: Vec<Bucket>, daily: Vec<Bucket>) -> Vec<Bucket> {
    let raw_coverage = Coverage::from_buckets(&raw);
    let kept_hourly: Vec<Bucket> = hourly
        .into_iter()
        .filter(|b| !raw_coverage.overlaps(b.bucket_start, b.bucket_end))
        .collect();

    let finer_coverage = Coverage::from_buckets(raw.iter().chain(kept_hourly.iter()));
    let kept_daily: Vec<Bucket> = daily
        .into_iter()
        .filter(|b| !finer_coverage.overlaps(b.bucket_start, b.bucket_end))
        .collect();

    let mut merged: Vec<Bucket> = raw.into_iter().chain(kept_hourly).chain(kept_daily).collect();
    merged.sort_by(|a, b| {
        a.bucket_start
            .cmp(&b.bucket_start)
            .then(a.source_tier.cmp(&b.source_tier))
    });
    merged
}

#[derive(Default)]
struct TargetAccumulator {
    bucket: Option<Bucket>,
    /// Precomputed p95 values of non-raw contributors.
    tier_p95: Vec<(SourceTier, f64)>,
    best_tier: Option<SourceTier>,
}

/// Re-bucket a merged timeline into buckets aligned to
/// `range_start + k * interval_ms`. A source bucket is attributed whole to
/// every target bucket it intersects. Only target buckets with at least one
/// contributor are returned.
pub fn reaggregate_buckets(
    sources: &[Bucket],
    interval_ms: i64,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> Vec<Bucket> {
    let interval_ms = interval_ms.max(1);
    if range_end <= range_start {
        return Vec::new();
    }
    let range_ms = (range_end - range_start).num_milliseconds();
    let target_count = (range_ms + interval_ms - 1) / interval_ms;

    let mut ordered: Vec<&Bucket> = sources.iter().collect();
    ordered.sort_by(|a, b| {
        a.bucket_start
            .cmp(&b.bucket_start)
            .then(a.source_tier.cmp(&b.source_tier))
            .then(a.bucket_end.cmp(&b.bucket_end))
    });

    let mut targets: BTreeMap<i64, TargetAccumulator> = BTreeMap::new();

    for source in ordered {
        if source.bucket_end <= range_start || source.bucket_start >= range_end {
            continue;
        }
        let start_offset = (source.bucket_start - range_start).num_milliseconds().max(0);
        let end_offset = (source.bucket_end - range_start).num_milliseconds().min(range_ms);
        let first = start_offset / interval_ms;
        let last = ((end_offset - 1).max(start_offset) / interval_ms).min(target_count - 1);

        for index in first..=last {
            let acc = targets.entry(index).or_default();
            let bucket = acc.bucket.get_or_insert_with(|| {
                let start = range_start + ChronoDuration::milliseconds(index * interval_ms);
                let end = (start + ChronoDuration::milliseconds(interval_ms)).min(range_end);
                Bucket::empty(start, end, source.source_tier)
            });
            bucket.absorb(source);

            if source.source_tier != SourceTier::Raw {
                if let Some(p95) = source.p95_latency_ms {
                    acc.tier_p95.push((source.source_tier, p95));
                }
            }
            acc.best_tier = Some(match acc.best_tier {
                Some(t) => t.min(source.source_tier),
                None => source.source_tier,
            });
        }
    }

    targets
        .into_values()
        .filter_map(|acc| {
            let mut bucket = acc.bucket?;
            if let Some(tier) = acc.best_tier {
                bucket.source_tier = tier;
            }
            bucket.p95_latency_ms = if bucket.latencies_ms.is_empty() {
                best_tier_p95(&acc.tier_p95)
            } else {
                nearest_rank_percentile(&bucket.latencies_ms, 95.0)
            };
            Some(bucket)
        })
        .collect()
}

/// The p95 of the most precise contributing tier; the larger value on ties.
fn best_tier_p95(candidates: &[(SourceTier, f64)]) -> Option<f64> {
    let best_tier = candidates.iter().map(|(tier, _)| *tier).min()?;
    candidates
        .iter()
        .filter(|(tier, _)| *tier == best_tier)
        .map(|(_, p95)| *p95)
        .max_by(f64::total_cmp)
}

/// Availability over a period and the number of runs it is based on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Availability {
    /// Healthy share in percent, rounded to two decimals. `None` without runs.
    pub percent: Option<f64>,
    pub total_runs: u64,
}

/// Sum daily rows, then hourly rows for days without a daily row, then raw
/// buckets for hours covered by neither. Raw buckets must be hour-aligned.
pub fn compute_availability(daily: &[Bucket], hourly: &[Bucket], raw: &[Bucket]) -> Availability {
    let mut counted: BTreeMap<(DateTime<Utc>, SourceTier), (u64, u64)> = BTreeMap::new();
    let mut covered_days: BTreeSet<DateTime<Utc>> = BTreeSet::new();
    let mut covered_hours: BTreeSet<DateTime<Utc>> = BTreeSet::new();

    for b in daily {
        covered_days.insert(b.bucket_start);
        counted.insert((b.bucket_start, SourceTier::Daily), (b.healthy_count, b.run_count));
    }
    for b in hourly {
        if covered_days.contains(&day_start(b.bucket_start)) {
            continue;
        }
        covered_hours.insert(b.bucket_start);
        counted.insert((b.bucket_start, SourceTier::Hourly), (b.healthy_count, b.run_count));
    }
    for b in raw {
        if covered_days.contains(&day_start(b.bucket_start)) || covered_hours.contains(&b.bucket_start) {
            continue;
        }
        let entry = counted.entry((b.bucket_start, SourceTier::Raw)).or_insert((0, 0));
        entry.0 += b.healthy_count;
        entry.1 += b.run_count;
    }

    let (healthy, total) = counted
        .values()
        .fold((0u64, 0u64), |(h, t), (bh, bt)| (h + bh, t + bt));

    let percent = if total == 0 {
        None
    } else {
        let pct = healthy as f64 * 100.0 / total as f64;
        Some((pct * 100.0).round() / 100.0)
    };

    Availability {
        percent,
        total_runs: total,
    }
}

pub(crate) fn day_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    let ts = dt.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(86_400), 0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregatedResult, AverageState, SummaryState};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn bucket(tier: SourceTier, start: DateTime<Utc>, span: ChronoDuration, runs: u64, healthy: u64) -> Bucket {
        let mut b = Bucket::empty(start, start + span, tier);
        b.run_count = runs;
        b.healthy_count = healthy;
        b.unhealthy_count = runs - healthy;
        b
    }

    fn hour(tier: SourceTier, h: i64, runs: u64, healthy: u64) -> Bucket {
        bucket(tier, t0() + ChronoDuration::hours(h), ChronoDuration::hours(1), runs, healthy)
    }

    #[test]
    fn test_bucket_interval() {
        let start = t0();
        let three_days = calculate_bucket_interval(start, start + ChronoDuration::days(3), 500);
        let fifteen_days = calculate_bucket_interval(start, start + ChronoDuration::days(15), 0);
        assert_eq!(three_days, 518_400);
        assert_eq!(fifteen_days, 2_592_000);
        assert!(fifteen_days > three_days);

        // Same inputs, same interval.
        assert_eq!(
            calculate_bucket_interval(start, start + ChronoDuration::days(15), 500),
            fifteen_days
        );
        // Floor of one second.
        assert_eq!(calculate_bucket_interval(start, start + ChronoDuration::seconds(10), 500), 1000);
    }

    #[test]
    fn test_raw_wins_over_hourly_and_daily() {
        let raw = vec![hour(SourceTier::Raw, 2, 60, 60)];
        let hourly = vec![
            hour(SourceTier::Hourly, 1, 60, 50),
            hour(SourceTier::Hourly, 2, 60, 10),
        ];
        let daily = vec![bucket(SourceTier::Daily, t0(), ChronoDuration::days(1), 1440, 1000)];

        let merged = merge_tiered_buckets(raw, hourly, daily);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source_tier, SourceTier::Hourly);
        assert_eq!(merged[0].bucket_start, t0() + ChronoDuration::hours(1));
        assert_eq!(merged[1].source_tier, SourceTier::Raw);
        assert_eq!(merged[1].healthy_count, 60);
    }

    #[test]
    fn test_daily_kept_where_nothing_finer() {
        let hourly = vec![hour(SourceTier::Hourly, 24 + 3, 60, 60)];
        let daily = vec![
            bucket(SourceTier::Daily, t0(), ChronoDuration::days(1), 1440, 1440),
            bucket(SourceTier::Daily, t0() + ChronoDuration::days(1), ChronoDuration::days(1), 1440, 1440),
        ];
        let merged = merge_tiered_buckets(Vec::new(), hourly, daily);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source_tier, SourceTier::Daily);
        assert_eq!(merged[0].bucket_start, t0());
        assert_eq!(merged[1].source_tier, SourceTier::Hourly);
    }

    #[test]
    fn test_reaggregate_sums_and_aligns_to_range_start() {
        let start = t0() + ChronoDuration::minutes(30);
        let end = start + ChronoDuration::hours(4);
        let sources = vec![
            hour(SourceTier::Hourly, 1, 10, 9),
            hour(SourceTier::Hourly, 2, 10, 8),
            hour(SourceTier::Hourly, 3, 10, 10),
        ];

        let out = reaggregate_buckets(&sources, 2 * 3_600_000, start, end);
        // Targets: [00:30, 02:30) and [02:30, 04:30).
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bucket_start, start);
        // Hours 01 and 02 intersect the first target; 02 and 03 the second.
        assert_eq!(out[0].run_count, 20);
        assert_eq!(out[0].healthy_count, 17);
        assert_eq!(out[1].run_count, 20);
        assert_eq!(out[1].healthy_count, 18);
        for b in &out {
            assert_eq!(b.run_count, b.healthy_count + b.degraded_count + b.unhealthy_count);
        }
    }

    #[test]
    fn test_reaggregate_is_deterministic() {
        let mut sources = Vec::new();
        for h in 0..48 {
            let mut b = hour(SourceTier::Hourly, h, 10, (h % 10) as u64);
            b.latency_sum_ms = Some(0.1 * h as f64);
            b.p95_latency_ms = Some(h as f64);
            sources.push(b);
        }
        let start = t0();
        let end = start + ChronoDuration::days(2);
        let interval = calculate_bucket_interval(start, end, 7);

        let forward = reaggregate_buckets(&sources, interval, start, end);
        sources.reverse();
        let backward = reaggregate_buckets(&sources, interval, start, end);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_reaggregate_p95_from_raw_latencies_only() {
        let start = t0();
        let end = start + ChronoDuration::hours(2);

        let mut raw = hour(SourceTier::Raw, 1, 3, 3);
        raw.latencies_ms = vec![10.0, 20.0, 30.0];
        raw.p95_latency_ms = Some(30.0);
        let mut hourly = hour(SourceTier::Hourly, 0, 10, 10);
        hourly.p95_latency_ms = Some(500.0);

        let out = reaggregate_buckets(&[hourly.clone(), raw], 2 * 3_600_000, start, end);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].p95_latency_ms, Some(30.0));
        assert_eq!(out[0].source_tier, SourceTier::Raw);

        // Without raw latencies the most precise tier's p95 is surfaced, never averaged.
        let mut daily = bucket(SourceTier::Daily, start, ChronoDuration::days(1), 100, 100);
        daily.p95_latency_ms = Some(900.0);
        let out = reaggregate_buckets(&[daily, hourly], 2 * 3_600_000, start, end);
        assert_eq!(out[0].p95_latency_ms, Some(500.0));
        assert_eq!(out[0].source_tier, SourceTier::Hourly);
    }

    #[test]
    fn test_reaggregate_merges_aggregated_results() {
        let start = t0();
        let end = start + ChronoDuration::hours(2);
        let mut a = hour(SourceTier::Hourly, 0, 2, 2);
        let mut result = AggregatedResult::new();
        result.insert("avgResponseTimeMs", SummaryState::Average(AverageState::new(100.0, 2)));
        a.aggregated_result = Some(result);
        let mut b = hour(SourceTier::Hourly, 1, 2, 2);
        let mut result = AggregatedResult::new();
        result.insert("avgResponseTimeMs", SummaryState::Average(AverageState::new(200.0, 2)));
        b.aggregated_result = Some(result);

        let out = reaggregate_buckets(&[a, b], 2 * 3_600_000, start, end);
        let merged = out[0].aggregated_result.as_ref().unwrap();
        assert_eq!(
            merged.get("avgResponseTimeMs"),
            Some(&SummaryState::Average(AverageState::new(300.0, 4)))
        );
    }

    #[test]
    fn test_reaggregate_ignores_out_of_range() {
        let start = t0() + ChronoDuration::hours(5);
        let end = start + ChronoDuration::hours(1);
        let sources = vec![hour(SourceTier::Hourly, 0, 10, 10)];
        assert!(reaggregate_buckets(&sources, 60_000, start, end).is_empty());
        assert!(reaggregate_buckets(&sources, 60_000, end, start).is_empty());
    }

    #[test]
    fn test_availability() {
        let day = ChronoDuration::days(1);
        let full = vec![
            bucket(SourceTier::Daily, t0(), day, 100, 100),
            bucket(SourceTier::Daily, t0() + day, day, 100, 100),
        ];
        assert_eq!(compute_availability(&full, &[], &[]).percent, Some(100.0));

        let mixed = vec![
            bucket(SourceTier::Daily, t0(), day, 100, 90),
            bucket(SourceTier::Daily, t0() + day, day, 100, 80),
        ];
        let a = compute_availability(&mixed, &[], &[]);
        assert_eq!(a.percent, Some(85.0));
        assert_eq!(a.total_runs, 200);

        assert_eq!(compute_availability(&[], &[], &[]).percent, None);
    }

    #[test]
    fn test_availability_does_not_double_count() {
        let day = ChronoDuration::days(1);
        let daily = vec![bucket(SourceTier::Daily, t0(), day, 100, 100)];
        let hourly = vec![
            // Covered by the daily row.
            hour(SourceTier::Hourly, 5, 60, 0),
            hour(SourceTier::Hourly, 24 + 1, 10, 5),
        ];
        let raw = vec![
            // Covered by the hourly row.
            hour(SourceTier::Raw, 24 + 1, 10, 0),
            hour(SourceTier::Raw, 24 + 2, 10, 10),
        ];
        let a = compute_availability(&daily, &hourly, &raw);
        assert_eq!(a.total_runs, 120);
        assert_eq!(a.percent, Some(95.83));
    }
}
