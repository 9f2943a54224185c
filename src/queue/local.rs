//! In-process work queue backed by tokio tasks.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock, Semaphore};

use super::{ConsumeOptions, JobHandler, QueueError, RecurringJobInfo, RecurringOptions, WorkQueue};

struct RecurringEntry {
    interval: Duration,
    stop: broadcast::Sender<()>,
}

struct ConsumerGroup<P> {
    tx: mpsc::UnboundedSender<P>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<P>>>,
}

type Groups<P> = Arc<RwLock<HashMap<String, ConsumerGroup<P>>>>;

/// Recurring jobs run as tokio tasks keyed by job id. Each firing is
/// pushed to one channel per consumer group; consumers in the same group
/// share that channel, so a firing is handled once per group.
pub struct LocalQueue<P> {
    jobs: Arc<RwLock<HashMap<String, RecurringEntry>>>,
    groups: Groups<P>,
}

impl<P> Default for LocalQueue<P> {
    fn default() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<P> LocalQueue<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every recurring job.
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.write().await;
        for (_, entry) in jobs.drain() {
            let _ = entry.stop.send(());
        }
    }
}

#[async_trait]
impl<P> WorkQueue<P> for LocalQueue<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn schedule_recurring(&self, payload: P, options: RecurringOptions) -> Result<String, QueueError> {
        if options.interval.is_zero() {
            return Err(QueueError::InvalidOptions(format!(
                "job {} has a zero interval",
                options.job_id
            )));
        }

        let (stop_tx, _) = broadcast::channel(1);
        let stop_rx = stop_tx.subscribe();

        let mut jobs = self.jobs.write().await;
        if let Some(previous) = jobs.insert(
            options.job_id.clone(),
            RecurringEntry {
                interval: options.interval,
                stop: stop_tx,
            },
        ) {
            let _ = previous.stop.send(());
            tracing::debug!("LocalQueue: Replaced recurring job {}", options.job_id);
        } else {
            tracing::debug!("LocalQueue: Added recurring job {}", options.job_id);
        }
        drop(jobs);

        tokio::spawn(run_recurring(
            payload,
            options.clone(),
            self.groups.clone(),
            stop_rx,
        ));

        Ok(options.job_id)
    }

    async fn consume(&self, handler: Arc<dyn JobHandler<P>>, options: ConsumeOptions) -> Result<(), QueueError> {
        if options.concurrency == 0 {
            return Err(QueueError::InvalidOptions(
                "consumer concurrency must be at least 1".to_string(),
            ));
        }

        let rx = {
            let mut groups = self.groups.write().await;
            let group = groups
                .entry(options.consumer_group.clone())
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    ConsumerGroup {
                        tx,
                        rx: Arc::new(Mutex::new(rx)),
                    }
                });
            group.rx.clone()
        };

        tracing::info!(
            "LocalQueue: Consumer attached to group {} (concurrency {}, retries {})",
            options.consumer_group,
            options.concurrency,
            options.max_retries
        );

        tokio::spawn(run_consumer(rx, handler, options));
        Ok(())
    }

    async fn list_recurring_jobs(&self) -> Result<Vec<RecurringJobInfo>, QueueError> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<RecurringJobInfo> = jobs
            .iter()
            .map(|(job_id, entry)| RecurringJobInfo {
                job_id: job_id.clone(),
                interval: entry.interval,
            })
            .collect();
        list.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(list)
    }

    async fn cancel_recurring(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.write().await;
        match jobs.remove(job_id) {
            Some(entry) => {
                let _ = entry.stop.send(());
                tracing::debug!("LocalQueue: Cancelled recurring job {}", job_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Wait out the start delay, then fire on every interval tick until stopped.
async fn run_recurring<P>(
    payload: P,
    options: RecurringOptions,
    groups: Groups<P>,
    mut stop_rx: broadcast::Receiver<()>,
) where
    P: Clone + Send + Sync + 'static,
{
    tokio::select! {
        biased;
        _ = stop_rx.recv() => return,
        _ = tokio::time::sleep(options.start_delay) => {}
    }

    let mut interval = tokio::time::interval(options.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let groups = groups.read().await;
                if groups.is_empty() {
                    tracing::debug!("LocalQueue: No consumers for job {}, firing dropped", options.job_id);
                }
                for (name, group) in groups.iter() {
                    if group.tx.send(payload.clone()).is_err() {
                        tracing::warn!("LocalQueue: Consumer group {} is closed", name);
                    }
                }
            }
        }
    }
}

async fn run_consumer<P>(
    rx: Arc<Mutex<mpsc::UnboundedReceiver<P>>>,
    handler: Arc<dyn JobHandler<P>>,
    options: ConsumeOptions,
) where
    P: Clone + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(options.concurrency));

    loop {
        // Take the permit first so a busy consumer leaves firings for its peers.
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        let payload = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(payload) = payload else {
            break;
        };

        let handler = handler.clone();
        let group = options.consumer_group.clone();
        let max_retries = options.max_retries;

        tokio::spawn(async move {
            let _permit = permit;
            handle_with_retries(handler.as_ref(), payload, max_retries, &group).await;
        });
    }
}

async fn handle_with_retries<P>(handler: &dyn JobHandler<P>, payload: P, max_retries: u32, group: &str)
where
    P: Clone + Send + Sync + 'static,
{
    let mut attempt = 0;
    loop {
        match handler.handle(payload.clone()).await {
            Ok(()) => return,
            Err(e) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "LocalQueue: Job in group {} failed (attempt {}/{}): {}",
                    group,
                    attempt,
                    max_retries + 1,
                    e
                );
            }
            Err(e) => {
                tracing::error!("LocalQueue: Job in group {} failed: {}", group, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    struct Recorder {
        started: Instant,
        tx: mpsc::UnboundedSender<(u32, u64)>,
    }

    #[async_trait]
    impl JobHandler<u32> for Recorder {
        async fn handle(&self, payload: u32) -> Result<(), JobError> {
            let _ = self.tx.send((payload, self.started.elapsed().as_secs()));
            Ok(())
        }
    }

    struct Flaky {
        calls: Arc<AtomicU32>,
        failures: u32,
    }

    #[async_trait]
    impl JobHandler<u32> for Flaky {
        async fn handle(&self, _payload: u32) -> Result<(), JobError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err("transient".into())
            } else {
                Ok(())
            }
        }
    }

    fn options(job_id: &str, interval: u64, delay: u64) -> RecurringOptions {
        RecurringOptions {
            job_id: job_id.to_string(),
            interval: Duration::from_secs(interval),
            start_delay: Duration::from_secs(delay),
        }
    }

    fn group(name: &str, max_retries: u32) -> ConsumeOptions {
        ConsumeOptions {
            consumer_group: name.to_string(),
            max_retries,
            concurrency: 4,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay_then_on_interval() {
        let queue: LocalQueue<u32> = LocalQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        queue
            .consume(Arc::new(Recorder { started, tx }), group("g", 0))
            .await
            .unwrap();
        queue.schedule_recurring(7, options("job", 60, 20)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![(7, 20), (7, 80), (7, 140)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_upsert() {
        let queue: LocalQueue<u32> = LocalQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue
            .consume(
                Arc::new(Recorder {
                    started: Instant::now(),
                    tx,
                }),
                group("g", 0),
            )
            .await
            .unwrap();

        queue.schedule_recurring(1, options("job", 60, 0)).await.unwrap();
        queue.schedule_recurring(2, options("job", 30, 10)).await.unwrap();

        let jobs = queue.list_recurring_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].interval, Duration::from_secs(30));

        assert_eq!(rx.recv().await.unwrap(), (2, 10));
        assert_eq!(rx.recv().await.unwrap(), (2, 40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_firing() {
        let queue: LocalQueue<u32> = LocalQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue
            .consume(
                Arc::new(Recorder {
                    started: Instant::now(),
                    tx,
                }),
                group("g", 0),
            )
            .await
            .unwrap();
        queue.schedule_recurring(1, options("job", 60, 0)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), (1, 0));

        assert!(queue.cancel_recurring("job").await.unwrap());
        assert!(!queue.cancel_recurring("job").await.unwrap());
        assert!(queue.list_recurring_jobs().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_group_gets_each_firing_once() {
        let queue: LocalQueue<u32> = LocalQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();

        // Two consumers in group "a", one in group "b".
        for name in ["a", "a", "b"] {
            queue
                .consume(
                    Arc::new(Recorder {
                        started,
                        tx: tx.clone(),
                    }),
                    group(name, 0),
                )
                .await
                .unwrap();
        }
        queue.schedule_recurring(5, options("job", 60, 0)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        for (max_retries, expected_calls) in [(0, 1), (2, 3)] {
            let queue: LocalQueue<u32> = LocalQueue::new();
            let calls = Arc::new(AtomicU32::new(0));
            queue
                .consume(
                    Arc::new(Flaky {
                        calls: calls.clone(),
                        failures: 10,
                    }),
                    group("g", max_retries),
                )
                .await
                .unwrap();
            queue.schedule_recurring(1, options("job", 60, 0)).await.unwrap();

            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
            queue.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let queue: LocalQueue<u32> = LocalQueue::new();
        let err = tokio_test::assert_err!(queue.schedule_recurring(1, options("job", 0, 0)).await);
        assert!(matches!(err, QueueError::InvalidOptions(_)));
    }
}
