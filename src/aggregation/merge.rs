//! Summary states and their merge functions.
//!
//! Every state is fully determined by its counting fields (`sum`/`count`,
//! `success_count`/`total`, `count`, `min`/`max`). The display fields `avg`
//! and `rate_pct` are recomputed from those after every merge and never feed
//! back into later merges, so rounding cannot compound.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Aggregation error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("cannot merge a {left} state with a {right} state")]
    KindMismatch {
        left: SummaryKind,
        right: SummaryKind,
    },
}

/// The statistical kind of a summary state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SummaryKind {
    Average,
    Rate,
    Counter,
    MinMax,
}

impl std::fmt::Display for SummaryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SummaryKind::Average => "average",
            SummaryKind::Rate => "rate",
            SummaryKind::Counter => "counter",
            SummaryKind::MinMax => "minMax",
        };
        f.write_str(name)
    }
}

/// Running mean. `avg` is display-only and rounded to one decimal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AverageState {
    pub sum: f64,
    pub count: u64,
    pub avg: f64,
}

impl AverageState {
    pub fn new(sum: f64, count: u64) -> Self {
        let avg = if count > 0 {
            round_one_decimal(sum / count as f64)
        } else {
            0.0
        };
        Self { sum, count, avg }
    }
}

/// Success ratio. `rate_pct` is display-only and rounded to a whole percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateState {
    pub success_count: u64,
    pub total: u64,
    pub rate_pct: u64,
}

impl RateState {
    pub fn new(success_count: u64, total: u64) -> Self {
        let rate_pct = if total > 0 {
            // Integer arithmetic keeps the rounding exact: round(100 * s / t).
            (200 * success_count + total) / (2 * total)
        } else {
            0
        };
        Self {
            success_count,
            total,
            rate_pct,
        }
    }
}

/// Occurrence count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterState {
    pub count: u64,
}

/// Observed range.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinMaxState {
    pub min: f64,
    pub max: f64,
}

/// A tagged summary state. Merging dispatches on the tag, never on the shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SummaryState {
    Average(AverageState),
    Rate(RateState),
    Counter(CounterState),
    MinMax(MinMaxState),
}

impl SummaryState {
    pub fn kind(&self) -> SummaryKind {
        match self {
            SummaryState::Average(_) => SummaryKind::Average,
            SummaryState::Rate(_) => SummaryKind::Rate,
            SummaryState::Counter(_) => SummaryKind::Counter,
            SummaryState::MinMax(_) => SummaryKind::MinMax,
        }
    }

    /// The state produced by merging nothing with nothing.
    pub fn zero(kind: SummaryKind) -> Self {
        match kind {
            SummaryKind::Average => SummaryState::Average(merge_average_states(None, None)),
            SummaryKind::Rate => SummaryState::Rate(merge_rate_states(None, None)),
            SummaryKind::Counter => SummaryState::Counter(merge_counter_states(None, None)),
            SummaryKind::MinMax => SummaryState::MinMax(merge_min_max_states(None, None)),
        }
    }

    /// Merge two states of the same kind.
    pub fn merge(&self, other: &SummaryState) -> Result<SummaryState, AggregationError> {
        match (self, other) {
            (SummaryState::Average(a), SummaryState::Average(b)) => {
                Ok(SummaryState::Average(merge_average_states(Some(a), Some(b))))
            }
            (SummaryState::Rate(a), SummaryState::Rate(b)) => {
                Ok(SummaryState::Rate(merge_rate_states(Some(a), Some(b))))
            }
            (SummaryState::Counter(a), SummaryState::Counter(b)) => {
                Ok(SummaryState::Counter(merge_counter_states(Some(a), Some(b))))
            }
            (SummaryState::MinMax(a), SummaryState::MinMax(b)) => {
                Ok(SummaryState::MinMax(merge_min_max_states(Some(a), Some(b))))
            }
            _ => Err(AggregationError::KindMismatch {
                left: self.kind(),
                right: other.kind(),
            }),
        }
    }
}

/// Merge two optional states of `kind`. `None` on one side is the identity;
/// `None` on both sides yields the zero state of `kind`.
pub fn merge_states(
    kind: SummaryKind,
    a: Option<&SummaryState>,
    b: Option<&SummaryState>,
) -> Result<SummaryState, AggregationError> {
    let state = match (a, b) {
        (Some(a), Some(b)) => return a.merge(b),
        (Some(s), None) | (None, Some(s)) => *s,
        (None, None) => return Ok(SummaryState::zero(kind)),
    };
    if state.kind() != kind {
        return Err(AggregationError::KindMismatch {
            left: kind,
            right: state.kind(),
        });
    }
    Ok(state)
}

// --- Average ---

pub fn merge_average_states(a: Option<&AverageState>, b: Option<&AverageState>) -> AverageState {
    match (a, b) {
        (Some(a), Some(b)) => AverageState::new(a.sum + b.sum, a.count + b.count),
        (Some(s), None) | (None, Some(s)) => AverageState::new(s.sum, s.count),
        (None, None) => AverageState::new(0.0, 0),
    }
}

/// Fold one observation into an average. A missing value leaves the state unchanged.
pub fn merge_average(existing: Option<&AverageState>, value: Option<f64>) -> AverageState {
    let observed = value.map(|v| AverageState::new(v, 1));
    merge_average_states(existing, observed.as_ref())
}

// --- Rate ---

pub fn merge_rate_states(a: Option<&RateState>, b: Option<&RateState>) -> RateState {
    match (a, b) {
        (Some(a), Some(b)) => RateState::new(a.success_count + b.success_count, a.total + b.total),
        (Some(s), None) | (None, Some(s)) => RateState::new(s.success_count, s.total),
        (None, None) => RateState::new(0, 0),
    }
}

/// Fold one success/failure into a rate. A missing value leaves the state unchanged.
pub fn merge_rate(existing: Option<&RateState>, success: Option<bool>) -> RateState {
    let observed = success.map(|ok| RateState::new(u64::from(ok), 1));
    merge_rate_states(existing, observed.as_ref())
}

// --- Counter ---

pub fn merge_counter_states(a: Option<&CounterState>, b: Option<&CounterState>) -> CounterState {
    CounterState {
        count: a.map_or(0, |s| s.count) + b.map_or(0, |s| s.count),
    }
}

/// Add a delta to a counter. A missing delta leaves the state unchanged.
pub fn merge_counter(existing: Option<&CounterState>, delta: Option<u64>) -> CounterState {
    let observed = delta.map(|count| CounterState { count });
    merge_counter_states(existing, observed.as_ref())
}

/// Count a flag: `true` adds one, `false` adds nothing.
pub fn merge_counter_flag(existing: Option<&CounterState>, flag: Option<bool>) -> CounterState {
    merge_counter(existing, flag.map(u64::from))
}

// --- MinMax ---

pub fn merge_min_max_states(a: Option<&MinMaxState>, b: Option<&MinMaxState>) -> MinMaxState {
    match (a, b) {
        (Some(a), Some(b)) => MinMaxState {
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        },
        (Some(s), None) | (None, Some(s)) => *s,
        (None, None) => MinMaxState { min: 0.0, max: 0.0 },
    }
}

/// Widen a range with one value. A missing value leaves the state unchanged.
pub fn merge_min_max(existing: Option<&MinMaxState>, value: Option<f64>) -> MinMaxState {
    let observed = value.map(|v| MinMaxState { min: v, max: v });
    merge_min_max_states(existing, observed.as_ref())
}

fn round_one_decimal(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avg(sum: f64, count: u64) -> AverageState {
        AverageState::new(sum, count)
    }

    #[test]
    fn test_merge_average_states() {
        let merged = merge_average_states(
            Some(&AverageState { sum: 100.0, count: 2, avg: 50.0 }),
            Some(&AverageState { sum: 200.0, count: 2, avg: 100.0 }),
        );
        assert_eq!(merged, AverageState { sum: 300.0, count: 4, avg: 75.0 });
    }

    #[test]
    fn test_merge_rate_states_rounds_to_whole_percent() {
        let merged = merge_rate_states(
            Some(&RateState { success_count: 3, total: 4, rate_pct: 75 }),
            Some(&RateState { success_count: 7, total: 10, rate_pct: 70 }),
        );
        assert_eq!(merged, RateState { success_count: 10, total: 14, rate_pct: 71 });
    }

    #[test]
    fn test_rate_rounds_half_up() {
        assert_eq!(RateState::new(1, 8).rate_pct, 13); // 12.5
        assert_eq!(RateState::new(1, 3).rate_pct, 33);
        assert_eq!(RateState::new(2, 3).rate_pct, 67);
    }

    #[test]
    fn test_merge_min_max_states() {
        let merged = merge_min_max_states(
            Some(&MinMaxState { min: 10.0, max: 50.0 }),
            Some(&MinMaxState { min: 5.0, max: 100.0 }),
        );
        assert_eq!(merged, MinMaxState { min: 5.0, max: 100.0 });
    }

    #[test]
    fn test_identity_and_zero_states() {
        let a = avg(30.0, 3);
        assert_eq!(merge_average_states(Some(&a), None), a);
        assert_eq!(merge_average_states(None, None), AverageState { sum: 0.0, count: 0, avg: 0.0 });
        assert_eq!(merge_rate_states(None, None), RateState { success_count: 0, total: 0, rate_pct: 0 });
        assert_eq!(merge_counter_states(None, None), CounterState { count: 0 });
        assert_eq!(merge_min_max_states(None, None), MinMaxState { min: 0.0, max: 0.0 });
        assert_eq!(SummaryState::zero(SummaryKind::Rate), SummaryState::Rate(RateState::new(0, 0)));
    }

    #[test]
    fn test_missing_observation_leaves_state_unchanged() {
        let a = avg(30.0, 3);
        assert_eq!(merge_average(Some(&a), None), a);

        let r = RateState::new(2, 4);
        assert_eq!(merge_rate(Some(&r), None), r);

        let c = CounterState { count: 5 };
        assert_eq!(merge_counter(Some(&c), None), c);
        assert_eq!(merge_counter_flag(Some(&c), None), c);

        let m = MinMaxState { min: 1.0, max: 9.0 };
        assert_eq!(merge_min_max(Some(&m), None), m);
    }

    #[test]
    fn test_first_observation_wraps_value() {
        assert_eq!(merge_average(None, Some(42.0)), AverageState { sum: 42.0, count: 1, avg: 42.0 });
        assert_eq!(merge_rate(None, Some(true)), RateState { success_count: 1, total: 1, rate_pct: 100 });
        assert_eq!(merge_rate(None, Some(false)), RateState { success_count: 0, total: 1, rate_pct: 0 });
        assert_eq!(merge_counter_flag(None, Some(true)), CounterState { count: 1 });
        assert_eq!(merge_counter(None, Some(7)), CounterState { count: 7 });
        assert_eq!(merge_min_max(None, Some(3.5)), MinMaxState { min: 3.5, max: 3.5 });
    }

    #[test]
    fn test_rounding_does_not_compound() {
        // 1/3 repeatedly: the displayed avg is rounded, the sum is not.
        let mut state: Option<AverageState> = None;
        for v in [1.0, 0.0, 0.0, 1.0, 0.0, 0.0] {
            state = Some(merge_average(state.as_ref(), Some(v)));
        }
        let state = state.unwrap();
        assert_eq!(state.sum, 2.0);
        assert_eq!(state.count, 6);
        assert_eq!(state.avg, 0.3);
    }

    #[test]
    fn test_associative_and_commutative() {
        let states = [
            SummaryState::Average(avg(10.0, 1)),
            SummaryState::Average(avg(25.0, 4)),
            SummaryState::Average(avg(7.0, 2)),
        ];
        let [a, b, c] = states;
        let left = a.merge(&b).unwrap().merge(&c).unwrap();
        let right = a.merge(&b.merge(&c).unwrap()).unwrap();
        assert_eq!(left, right);
        assert_eq!(a.merge(&b).unwrap(), b.merge(&a).unwrap());

        let [a, b, c] = [
            SummaryState::Rate(RateState::new(1, 3)),
            SummaryState::Rate(RateState::new(5, 5)),
            SummaryState::Rate(RateState::new(0, 2)),
        ];
        assert_eq!(
            a.merge(&b).unwrap().merge(&c).unwrap(),
            a.merge(&b.merge(&c).unwrap()).unwrap()
        );
        assert_eq!(a.merge(&c).unwrap(), c.merge(&a).unwrap());

        let [a, b, c] = [
            SummaryState::MinMax(MinMaxState { min: 3.0, max: 8.0 }),
            SummaryState::MinMax(MinMaxState { min: 1.0, max: 4.0 }),
            SummaryState::MinMax(MinMaxState { min: 6.0, max: 12.0 }),
        ];
        assert_eq!(
            a.merge(&b).unwrap().merge(&c).unwrap(),
            a.merge(&b.merge(&c).unwrap()).unwrap()
        );
        assert_eq!(b.merge(&c).unwrap(), c.merge(&b).unwrap());

        let [a, b, c] = [
            SummaryState::Counter(CounterState { count: 2 }),
            SummaryState::Counter(CounterState { count: 0 }),
            SummaryState::Counter(CounterState { count: 9 }),
        ];
        assert_eq!(
            a.merge(&b).unwrap().merge(&c).unwrap(),
            a.merge(&b.merge(&c).unwrap()).unwrap()
        );
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let a = SummaryState::Counter(CounterState { count: 1 });
        let b = SummaryState::Rate(RateState::new(1, 1));
        assert_eq!(
            a.merge(&b),
            Err(AggregationError::KindMismatch {
                left: SummaryKind::Counter,
                right: SummaryKind::Rate,
            })
        );
    }

    #[test]
    fn test_merge_states_with_missing_side() {
        let a = SummaryState::Counter(CounterState { count: 4 });
        assert_eq!(merge_states(SummaryKind::Counter, Some(&a), None).unwrap(), a);
        assert_eq!(merge_states(SummaryKind::Counter, None, Some(&a)).unwrap(), a);
        assert!(merge_states(SummaryKind::Rate, Some(&a), None).is_err());
    }

    #[test]
    fn test_merge_states_of_nothing_is_zero() {
        assert_eq!(
            merge_states(SummaryKind::Average, None, None).unwrap(),
            SummaryState::Average(AverageState::new(0.0, 0))
        );
        assert_eq!(
            merge_states(SummaryKind::Counter, None, None).unwrap(),
            SummaryState::Counter(CounterState { count: 0 })
        );
    }

    #[test]
    fn test_tagged_serialization() {
        let state = SummaryState::Rate(RateState::new(3, 4));
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["kind"], "rate");
        assert_eq!(json["successCount"], 3);
        assert_eq!(json["ratePct"], 75);

        let back: SummaryState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
