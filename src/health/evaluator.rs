//! Debounced health state evaluation.

use super::status::HealthStatus;
use super::thresholds::StateThresholds;

/// Evaluate the current state from run outcomes ordered newest first.
///
/// With no history the answer is `Healthy`.
pub fn evaluate_health_status(runs: &[HealthStatus], thresholds: &StateThresholds) -> HealthStatus {
    let Some(&latest) = runs.first() else {
        return HealthStatus::Healthy;
    };

    match thresholds {
        StateThresholds::Consecutive {
            healthy,
            degraded,
            unhealthy,
        } => {
            let streak = runs
                .iter()
                .take_while(|s| s.is_failure() == latest.is_failure())
                .count() as u32;

            if latest.is_failure() {
                if streak >= unhealthy.min_failure_count {
                    return HealthStatus::Unhealthy;
                }
                if streak >= degraded.min_failure_count {
                    return HealthStatus::Degraded;
                }
            } else if streak >= healthy.min_success_count {
                return HealthStatus::Healthy;
            }

            // Not enough history to satisfy any threshold.
            latest
        }
        StateThresholds::Window {
            window_size,
            degraded,
            unhealthy,
        } => {
            let failures = runs
                .iter()
                .take(*window_size as usize)
                .filter(|s| s.is_failure())
                .count() as u32;

            if failures >= unhealthy.min_failure_count {
                HealthStatus::Unhealthy
            } else if failures >= degraded.min_failure_count {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
    }
}
