//! Per-field aggregated results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::merge::*;

/// Field name to summary state, one entry per statistic a probe reports.
///
/// Backed by a `BTreeMap` so serialization order is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregatedResult(BTreeMap<String, SummaryState>);

impl AggregatedResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&SummaryState> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, state: SummaryState) {
        self.0.insert(field.into(), state);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SummaryState)> {
        self.0.iter()
    }

    pub fn observe_average(&mut self, field: &str, value: Option<f64>) {
        let Some(value) = value else { return };
        match self.0.get(field) {
            None => self.insert(field, SummaryState::Average(merge_average(None, Some(value)))),
            Some(SummaryState::Average(s)) => {
                let next = merge_average(Some(s), Some(value));
                self.insert(field, SummaryState::Average(next));
            }
            Some(other) => warn_kind(field, other.kind(), SummaryKind::Average),
        }
    }

    pub fn observe_rate(&mut self, field: &str, success: Option<bool>) {
        let Some(success) = success else { return };
        match self.0.get(field) {
            None => self.insert(field, SummaryState::Rate(merge_rate(None, Some(success)))),
            Some(SummaryState::Rate(s)) => {
                let next = merge_rate(Some(s), Some(success));
                self.insert(field, SummaryState::Rate(next));
            }
            Some(other) => warn_kind(field, other.kind(), SummaryKind::Rate),
        }
    }

    pub fn observe_count(&mut self, field: &str, delta: Option<u64>) {
        let Some(delta) = delta else { return };
        match self.0.get(field) {
            None => self.insert(field, SummaryState::Counter(merge_counter(None, Some(delta)))),
            Some(SummaryState::Counter(s)) => {
                let next = merge_counter(Some(s), Some(delta));
                self.insert(field, SummaryState::Counter(next));
            }
            Some(other) => warn_kind(field, other.kind(), SummaryKind::Counter),
        }
    }

    pub fn observe_flag(&mut self, field: &str, flag: Option<bool>) {
        self.observe_count(field, flag.map(u64::from));
    }

    pub fn observe_min_max(&mut self, field: &str, value: Option<f64>) {
        let Some(value) = value else { return };
        match self.0.get(field) {
            None => self.insert(field, SummaryState::MinMax(merge_min_max(None, Some(value)))),
            Some(SummaryState::MinMax(s)) => {
                let next = merge_min_max(Some(s), Some(value));
                self.insert(field, SummaryState::MinMax(next));
            }
            Some(other) => warn_kind(field, other.kind(), SummaryKind::MinMax),
        }
    }
}

/// Merge two aggregated results field by field.
///
/// Fields present on one side only are carried over. A field whose kinds
/// disagree keeps the left-hand state.
pub fn merge_aggregated_results(
    a: Option<&AggregatedResult>,
    b: Option<&AggregatedResult>,
) -> Option<AggregatedResult> {
    match (a, b) {
        (None, None) => None,
        (Some(r), None) | (None, Some(r)) => Some(r.clone()),
        (Some(a), Some(b)) => {
            let mut merged = a.clone();
            for (field, incoming) in b.iter() {
                match merge_states(incoming.kind(), a.get(field), Some(incoming)) {
                    Ok(state) => merged.insert(field.clone(), state),
                    Err(e) => tracing::warn!("Aggregation: skipping field {}: {}", field, e),
                }
            }
            Some(merged)
        }
    }
}

fn warn_kind(field: &str, have: SummaryKind, want: SummaryKind) {
    tracing::warn!(
        "Aggregation: field {} holds a {} state, ignoring {} observation",
        field,
        have,
        want
    );
}
