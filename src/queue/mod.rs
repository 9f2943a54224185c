//! Work queue abstraction for recurring jobs.
//!
//! A queue fires each recurring job on its interval and delivers every
//! firing once to each consumer group. [`LocalQueue`] is the in-process
//! implementation.

mod local;

pub use local::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Queue error types.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid job options: {0}")]
    InvalidOptions(String),
}

/// Error returned by a job handler.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Options for one recurring job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringOptions {
    /// Scheduling under an existing id replaces that job.
    pub job_id: String,
    pub interval: Duration,
    /// Delay before the first firing.
    pub start_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_group: String,
    /// Extra attempts after a failed handler call.
    pub max_retries: u32,
    /// Firings processed at once by this consumer.
    pub concurrency: usize,
}

/// A currently registered recurring job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringJobInfo {
    pub job_id: String,
    pub interval: Duration,
}

/// Processes one firing of a job.
#[async_trait]
pub trait JobHandler<P>: Send + Sync {
    async fn handle(&self, payload: P) -> Result<(), JobError>;
}

#[async_trait]
pub trait WorkQueue<P>: Send + Sync
where
    P: Send + 'static,
{
    /// Register (or replace) a recurring job and return its id.
    async fn schedule_recurring(&self, payload: P, options: RecurringOptions) -> Result<String, QueueError>;

    /// Attach a handler to a consumer group.
    async fn consume(&self, handler: Arc<dyn JobHandler<P>>, options: ConsumeOptions) -> Result<(), QueueError>;

    async fn list_recurring_jobs(&self) -> Result<Vec<RecurringJobInfo>, QueueError>;

    /// Cancel a recurring job. Returns whether a job was registered under the id.
    async fn cancel_recurring(&self, job_id: &str) -> Result<bool, QueueError>;
}
