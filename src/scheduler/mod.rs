//! Scheduling of health checks and background compaction.
//!
//! One recurring job exists per enabled (system, configuration) pair. Job ids
//! are derived from the pair, so scheduling the same pair twice replaces the
//! job instead of duplicating it. The queue is the only record of what is
//! scheduled.

mod executor;
mod retention;
mod rollup;

pub use executor::*;
pub use retention::*;
pub use rollup::*;

use crate::db::{DbError, Store, SystemCheck};
use crate::queue::{ConsumeOptions, JobHandler, QueueError, RecurringOptions, WorkQueue};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every health-check job id.
pub const JOB_PREFIX: &str = "health-check:";

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("configuration not found: {0}")]
    ConfigurationNotFound(String),
    #[error("configuration {0} has a zero interval")]
    InvalidInterval(String),
}

/// Payload of one health-check firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckPayload {
    pub system_id: String,
    pub configuration_id: String,
}

/// Deterministic job id for a pair.
pub fn job_id(configuration_id: &str, system_id: &str) -> String {
    format!("{}{}:{}", JOB_PREFIX, configuration_id, system_id)
}

/// Delay before the first firing after (re)scheduling.
///
/// Keeps the original cadence when the last run is recent; fires
/// immediately when the pair is overdue or has never run.
pub fn compute_start_delay(last_run: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> Duration {
    let Some(last_run) = last_run else {
        return Duration::ZERO;
    };
    // A last run in the future (clock skew) counts as just now.
    let elapsed = (now - last_run).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}

/// Outcome of a bootstrap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub scheduled: usize,
    pub failed: usize,
    pub orphans_removed: usize,
}

pub struct HealthCheckScheduler {
    store: Arc<Store>,
    queue: Arc<dyn WorkQueue<HealthCheckPayload>>,
}

impl HealthCheckScheduler {
    pub fn new(store: Arc<Store>, queue: Arc<dyn WorkQueue<HealthCheckPayload>>) -> Self {
        Self { store, queue }
    }

    /// Attach the executor to the queue, then schedule every enabled pair.
    pub async fn start(
        &self,
        handler: Arc<dyn JobHandler<HealthCheckPayload>>,
        consumer_group: &str,
        concurrency: usize,
    ) -> Result<BootstrapReport, SchedulerError> {
        self.queue
            .consume(
                handler,
                ConsumeOptions {
                    consumer_group: consumer_group.to_string(),
                    // A failed check is a result, not a transient fault.
                    max_retries: 0,
                    concurrency,
                },
            )
            .await?;
        self.bootstrap().await
    }

    /// Schedule (or replace) the job for a pair. Disabled pairs are
    /// unscheduled instead. Returns the job id when a job was scheduled.
    pub async fn schedule_pair(&self, pair: &SystemCheck) -> Result<Option<String>, SchedulerError> {
        if !pair.enabled {
            self.unschedule_pair(&pair.system_id, &pair.configuration_id)
                .await?;
            return Ok(None);
        }

        let configuration = self
            .store
            .get_configuration(&pair.configuration_id)?
            .ok_or_else(|| SchedulerError::ConfigurationNotFound(pair.configuration_id.clone()))?;
        if configuration.interval_seconds == 0 {
            return Err(SchedulerError::InvalidInterval(configuration.id));
        }
        let interval = Duration::from_secs(configuration.interval_seconds);

        let last_run = self
            .store
            .get_last_run_time(&pair.system_id, &pair.configuration_id)?;
        let start_delay = compute_start_delay(last_run, interval, Utc::now());

        let id = self
            .queue
            .schedule_recurring(
                HealthCheckPayload {
                    system_id: pair.system_id.clone(),
                    configuration_id: pair.configuration_id.clone(),
                },
                RecurringOptions {
                    job_id: job_id(&pair.configuration_id, &pair.system_id),
                    interval,
                    start_delay,
                },
            )
            .await?;

        tracing::info!(
            "Scheduler: Scheduled {} every {}s (first in {}s)",
            id,
            interval.as_secs(),
            start_delay.as_secs()
        );
        Ok(Some(id))
    }

    pub async fn unschedule_pair(&self, system_id: &str, configuration_id: &str) -> Result<bool, SchedulerError> {
        let id = job_id(configuration_id, system_id);
        let removed = self.queue.cancel_recurring(&id).await?;
        if removed {
            tracing::info!("Scheduler: Unscheduled {}", id);
        }
        Ok(removed)
    }

    /// Re-schedule every pair using a configuration, e.g. after its interval changed.
    pub async fn reschedule_configuration(&self, configuration_id: &str) -> Result<usize, SchedulerError> {
        let mut scheduled = 0;
        for pair in self.store.get_system_checks()? {
            if pair.configuration_id == configuration_id && self.schedule_pair(&pair).await?.is_some() {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Cancel every job of a configuration before it is deleted.
    pub async fn unschedule_configuration(&self, configuration_id: &str) -> Result<usize, SchedulerError> {
        let mut removed = 0;
        for pair in self.store.get_system_checks()? {
            if pair.configuration_id == configuration_id
                && self
                    .unschedule_pair(&pair.system_id, &pair.configuration_id)
                    .await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Schedule every enabled pair, then cancel health-check jobs whose
    /// pair is gone or disabled.
    pub async fn bootstrap(&self) -> Result<BootstrapReport, SchedulerError> {
        let pairs = self.store.get_enabled_system_checks()?;
        let mut report = BootstrapReport::default();
        let mut expected = HashSet::new();

        tracing::info!("Scheduler: Bootstrapping {} enabled checks", pairs.len());

        for pair in &pairs {
            expected.insert(job_id(&pair.configuration_id, &pair.system_id));
            match self.schedule_pair(pair).await {
                Ok(_) => report.scheduled += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        "Scheduler: Failed to schedule {}/{}: {}",
                        pair.system_id,
                        pair.configuration_id,
                        e
                    );
                }
            }
        }

        for job in self.queue.list_recurring_jobs().await? {
            if job.job_id.starts_with(JOB_PREFIX) && !expected.contains(&job.job_id) {
                self.queue.cancel_recurring(&job.job_id).await?;
                report.orphans_removed += 1;
                tracing::info!("Scheduler: Removed orphaned job {}", job.job_id);
            }
        }

        Ok(report)
    }
}
