//! Execution of one health-check firing.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;

use super::HealthCheckPayload;
use crate::db::{CollectorEntry, DbError, Run, Store};
use crate::health::HealthStatus;
use crate::history::RetentionReader;
use crate::notify::{HealthEvent, NotificationSink, StateChange};
use crate::probe::{evaluate_assertions, ProbeConnection, ProbeError, ProbeRegistry, ProbeStrategy};
use crate::queue::{JobError, JobHandler};

const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Executor error types. Probe failures are not errors; they become runs.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("invalid stored configuration: {0}")]
    Probe(#[from] ProbeError),
}

/// Status and stored result of one probe attempt.
#[derive(Debug, Clone, PartialEq)]
struct ProbeOutcome {
    status: HealthStatus,
    result: Value,
}

impl ProbeOutcome {
    fn failed(phase: &str, message: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            result: json!({ "phase": phase, "error": message }),
        }
    }
}

pub struct HealthCheckExecutor {
    store: Arc<Store>,
    registry: Arc<ProbeRegistry>,
    reader: Arc<RetentionReader>,
    sink: Arc<dyn NotificationSink>,
    timeout: Duration,
    jitter: Duration,
}

impl HealthCheckExecutor {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ProbeRegistry>,
        reader: Arc<RetentionReader>,
        sink: Arc<dyn NotificationSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            reader,
            sink,
            timeout,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Upper bound of the random delay before probing.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Run one firing. Returns the stored run, or `None` when the pair is
    /// no longer enabled or its configuration cannot be resolved.
    ///
    /// State transitions are detected best-effort. Two pairs of the same
    /// system firing concurrently can capture the same previous state, so a
    /// single transition may be reported twice. If the system state cannot
    /// be evaluated, the run is still stored and no transition is reported.
    pub async fn execute(&self, payload: &HealthCheckPayload) -> Result<Option<Run>, ExecutorError> {
        let system_id = payload.system_id.as_str();
        let configuration_id = payload.configuration_id.as_str();

        match self.store.get_system_check(system_id, configuration_id)? {
            Some(pair) if pair.enabled => {}
            _ => {
                tracing::debug!(
                    "Executor: Skipping {}/{}: pair missing or disabled",
                    system_id,
                    configuration_id
                );
                return Ok(None);
            }
        }

        let Some(configuration) = self.store.get_configuration(configuration_id)? else {
            tracing::warn!("Executor: Configuration {} not found", configuration_id);
            return Ok(None);
        };
        let Some(strategy) = self.registry.strategy(&configuration.strategy_id) else {
            tracing::warn!(
                "Executor: Unknown strategy {} for configuration {}",
                configuration.strategy_id,
                configuration_id
            );
            return Ok(None);
        };
        let config = self
            .registry
            .parse_config(&configuration.strategy_id, &configuration.config)?;

        let previous = match self.reader.get_system_health_status(system_id) {
            Ok(health) => Some(health.status),
            Err(e) => {
                tracing::warn!("Executor: Failed to capture state of {}: {}", system_id, e);
                None
            }
        };

        if !self.jitter.is_zero() {
            let ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let timestamp = Utc::now();
        let started = Instant::now();
        let outcome = self
            .probe(strategy.as_ref(), &config, &configuration.collectors)
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut run = Run {
            id: 0,
            system_id: system_id.to_string(),
            configuration_id: configuration_id.to_string(),
            status: outcome.status,
            latency_ms: Some(latency_ms),
            result: outcome.result,
            timestamp,
        };
        self.store.add_run(&mut run)?;

        tracing::debug!(
            "Executor: {}/{} -> {} in {:.1}ms",
            system_id,
            configuration_id,
            run.status,
            latency_ms
        );

        self.emit(HealthEvent::RunCompleted {
            system_id: run.system_id.clone(),
            configuration_id: run.configuration_id.clone(),
            status: run.status,
            latency_ms: run.latency_ms,
            at: run.timestamp,
        })
        .await;

        let Some(previous) = previous else {
            return Ok(Some(run));
        };
        match self.reader.get_system_health_status(system_id) {
            Ok(current) if current.status != previous => {
                self.handle_state_change(StateChange {
                    system_id: system_id.to_string(),
                    configuration_id: configuration_id.to_string(),
                    previous,
                    current: current.status,
                    changed_at: Utc::now(),
                })
                .await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Executor: Failed to re-evaluate {}: {}", system_id, e),
        }

        Ok(Some(run))
    }

    /// Connect, run every collector, release. The whole span shares one deadline.
    async fn probe(&self, strategy: &dyn ProbeStrategy, config: &Value, collectors: &[CollectorEntry]) -> ProbeOutcome {
        let deadline = tokio::time::Instant::now() + self.timeout;

        let connection = match tokio::time::timeout_at(deadline, strategy.create_connection(config)).await {
            Err(_) => {
                return ProbeOutcome::failed(
                    "connect",
                    format!("timed out after {}ms", self.timeout.as_millis()),
                )
            }
            Ok(Err(e)) => return ProbeOutcome::failed("connect", e.to_string()),
            Ok(Ok(connection)) => connection,
        };

        let collected = tokio::time::timeout_at(
            deadline,
            run_collectors(&self.registry, connection.clone(), collectors),
        )
        .await;
        connection.close().await;

        match collected {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::failed(
                "collect",
                format!("timed out after {}ms", self.timeout.as_millis()),
            ),
        }
    }

    async fn handle_state_change(&self, change: StateChange) {
        let suppressed = match self.sink.is_suppressed(&change.system_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    "Executor: Suppression check failed for {}, notifying anyway: {}",
                    change.system_id,
                    e
                );
                false
            }
        };

        if suppressed {
            tracing::info!(
                "Executor: Notification for {} suppressed by maintenance",
                change.system_id
            );
        } else if let Err(e) = self.sink.notify_state_change(&change).await {
            tracing::warn!("Executor: Notification for {} failed: {}", change.system_id, e);
        }

        if let Some(event) = change.event() {
            self.emit(event).await;
        }
    }

    async fn emit(&self, event: HealthEvent) {
        if let Err(e) = self.sink.emit(event).await {
            tracing::warn!("Executor: Failed to emit event: {}", e);
        }
    }
}

#[async_trait]
impl JobHandler<HealthCheckPayload> for HealthCheckExecutor {
    async fn handle(&self, payload: HealthCheckPayload) -> Result<(), JobError> {
        self.execute(&payload).await?;
        Ok(())
    }
}

/// Run all collectors concurrently and fold their outputs into one outcome.
/// A failing collector never stops its siblings.
async fn run_collectors(
    registry: &ProbeRegistry,
    connection: Arc<dyn ProbeConnection>,
    entries: &[CollectorEntry],
) -> ProbeOutcome {
    let mut results = Map::new();
    let mut failed = false;
    let mut pending: HashSet<String> = HashSet::new();
    let mut tasks = JoinSet::new();

    for entry in entries {
        let Some(collector) = registry.collector(&entry.collector_id) else {
            failed = true;
            results.insert(
                entry.id.clone(),
                json!({ "error": format!("unknown collector: {}", entry.collector_id) }),
            );
            continue;
        };

        pending.insert(entry.id.clone());
        let entry = entry.clone();
        let connection = connection.clone();
        tasks.spawn(async move {
            let output = collector.execute(&entry.config, connection.as_ref()).await;
            let assertion = match output.error {
                None => evaluate_assertions(&entry.assertions, &output.result),
                Some(_) => None,
            };
            (entry.id, output, assertion)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let Ok((id, output, assertion)) = joined else {
            continue;
        };
        pending.remove(&id);

        let mut record = Map::new();
        record.insert("result".to_string(), output.result);
        if let Some(error) = output.error {
            failed = true;
            record.insert("error".to_string(), Value::String(error));
        }
        if let Some(assertion) = assertion {
            failed = true;
            record.insert("error".to_string(), Value::String(assertion.message.clone()));
            record.insert(
                "assertionFailed".to_string(),
                serde_json::to_value(&assertion).unwrap_or(Value::Bool(true)),
            );
        }
        results.insert(id, Value::Object(record));
    }

    // Collectors whose task panicked.
    for id in pending {
        failed = true;
        results.insert(id, json!({ "error": "collector task failed" }));
    }

    ProbeOutcome {
        status: if failed {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        },
        result: Value::Object(results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckConfiguration, Maintenance, RetentionConfig, SystemCheck};
    use crate::notify::{Notifier, NotifyError};
    use crate::probe::{Assertion, AssertionOperator, Collector, CollectorOutput};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeConnection {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProbeConnection for FakeConnection {
        async fn invoke(&self, request: &Value) -> Result<Value, ProbeError> {
            Ok(request.clone())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeStrategy {
        reachable: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProbeStrategy for FakeStrategy {
        fn id(&self) -> &str {
            "fake"
        }

        async fn create_connection(&self, _config: &Value) -> Result<Arc<dyn ProbeConnection>, ProbeError> {
            if !self.reachable {
                return Err(ProbeError::Network("connection refused".to_string()));
            }
            Ok(Arc::new(FakeConnection {
                closes: self.closes.clone(),
            }))
        }
    }

    /// Echoes its config through the connection.
    struct EchoCollector;

    #[async_trait]
    impl Collector for EchoCollector {
        fn id(&self) -> &str {
            "echo"
        }

        async fn execute(&self, config: &Value, connection: &dyn ProbeConnection) -> CollectorOutput {
            match connection.invoke(config).await {
                Ok(v) => CollectorOutput::ok(v),
                Err(e) => CollectorOutput::failed(e.to_string()),
            }
        }
    }

    struct FailingCollector;

    #[async_trait]
    impl Collector for FailingCollector {
        fn id(&self) -> &str {
            "failing"
        }

        async fn execute(&self, _config: &Value, _connection: &dyn ProbeConnection) -> CollectorOutput {
            CollectorOutput::failed("boom")
        }
    }

    struct HangingCollector;

    #[async_trait]
    impl Collector for HangingCollector {
        fn id(&self) -> &str {
            "hanging"
        }

        async fn execute(&self, _config: &Value, _connection: &dyn ProbeConnection) -> CollectorOutput {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            CollectorOutput::ok(Value::Null)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        suppress: Option<bool>,
        changes: Mutex<Vec<StateChange>>,
        events: Mutex<Vec<HealthEvent>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn is_suppressed(&self, _system_id: &str) -> Result<bool, NotifyError> {
            match self.suppress {
                Some(s) => Ok(s),
                None => Err(NotifyError::Db(DbError::Poisoned)),
            }
        }

        async fn notify_state_change(&self, change: &StateChange) -> Result<(), NotifyError> {
            self.changes.lock().unwrap().push(change.clone());
            Ok(())
        }

        async fn emit(&self, event: HealthEvent) -> Result<(), NotifyError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Harness {
        store: Arc<Store>,
        closes: Arc<AtomicUsize>,
        sink: Arc<RecordingSink>,
        executor: HealthCheckExecutor,
    }

    fn harness(reachable: bool, collectors: Vec<CollectorEntry>, suppress: Option<bool>) -> Harness {
        let store = Arc::new(Store::in_memory().unwrap());
        let closes = Arc::new(AtomicUsize::new(0));

        let mut registry = ProbeRegistry::new();
        registry
            .register_strategy(Arc::new(FakeStrategy {
                reachable,
                closes: closes.clone(),
            }))
            .unwrap();
        registry.register_collector(Arc::new(EchoCollector));
        registry.register_collector(Arc::new(FailingCollector));
        registry.register_collector(Arc::new(HangingCollector));
        let registry = Arc::new(registry);

        store
            .upsert_configuration(&CheckConfiguration {
                id: "cfg".to_string(),
                name: "fake".to_string(),
                strategy_id: "fake".to_string(),
                config: crate::versioning::VersionedRecord::new(1, json!({})),
                collectors,
                interval_seconds: 60,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();
        store
            .upsert_system_check(&SystemCheck {
                system_id: "sys".to_string(),
                configuration_id: "cfg".to_string(),
                enabled: true,
                thresholds: None,
                retention: RetentionConfig::default(),
                updated_at: Utc::now(),
            })
            .unwrap();

        let sink = Arc::new(RecordingSink {
            suppress,
            ..Default::default()
        });
        let reader = Arc::new(RetentionReader::new(store.clone(), registry.clone()));
        let executor = HealthCheckExecutor::new(
            store.clone(),
            registry,
            reader,
            sink.clone(),
            Duration::from_secs(5),
        )
        .with_jitter(Duration::ZERO);

        Harness {
            store,
            closes,
            sink,
            executor,
        }
    }

    fn entry(id: &str, collector_id: &str, config: Value, assertions: Vec<Assertion>) -> CollectorEntry {
        CollectorEntry {
            id: id.to_string(),
            collector_id: collector_id.to_string(),
            config,
            assertions,
        }
    }

    fn payload() -> HealthCheckPayload {
        HealthCheckPayload {
            system_id: "sys".to_string(),
            configuration_id: "cfg".to_string(),
        }
    }

    #[tokio::test]
    async fn test_healthy_run() {
        let h = harness(
            true,
            vec![entry("main", "echo", json!({"statusCode": 200}), Vec::new())],
            Some(false),
        );
        let run = h.executor.execute(&payload()).await.unwrap().unwrap();

        assert_eq!(run.status, HealthStatus::Healthy);
        assert_eq!(run.result["main"]["result"]["statusCode"], 200);
        assert!(run.latency_ms.is_some());
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get_recent_runs("sys", "cfg", 10).unwrap().len(), 1);

        let events = h.sink.events.lock().unwrap();
        assert!(matches!(events[0], HealthEvent::RunCompleted { .. }));
        assert!(h.sink.changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_sibling_thresholds_still_store_run() {
        let h = harness(
            true,
            vec![entry("main", "echo", json!({"statusCode": 200}), Vec::new())],
            Some(false),
        );
        h.store
            .upsert_configuration(&CheckConfiguration {
                id: "cfg2".to_string(),
                name: "other".to_string(),
                strategy_id: "fake".to_string(),
                config: crate::versioning::VersionedRecord::new(1, json!({})),
                collectors: Vec::new(),
                interval_seconds: 60,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();
        h.store
            .upsert_system_check(&SystemCheck {
                system_id: "sys".to_string(),
                configuration_id: "cfg2".to_string(),
                enabled: true,
                thresholds: Some(crate::versioning::VersionedRecord::new(99, json!({}))),
                retention: RetentionConfig::default(),
                updated_at: Utc::now(),
            })
            .unwrap();

        let run = h.executor.execute(&payload()).await.unwrap().unwrap();

        assert_eq!(run.status, HealthStatus::Healthy);
        assert_eq!(h.store.get_recent_runs("sys", "cfg", 10).unwrap().len(), 1);
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
        assert!(h.sink.changes.lock().unwrap().is_empty());
        assert!(matches!(
            h.sink.events.lock().unwrap()[0],
            HealthEvent::RunCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_failing_collector_does_not_stop_siblings() {
        let h = harness(
            true,
            vec![
                entry("bad", "failing", Value::Null, Vec::new()),
                entry("good", "echo", json!({"ok": true}), Vec::new()),
                entry("ghost", "missing", Value::Null, Vec::new()),
            ],
            Some(false),
        );
        let run = h.executor.execute(&payload()).await.unwrap().unwrap();

        assert_eq!(run.status, HealthStatus::Unhealthy);
        assert_eq!(run.result["bad"]["error"], "boom");
        assert_eq!(run.result["good"]["result"]["ok"], true);
        assert!(run.result["good"].get("error").is_none());
        assert!(run.result["ghost"]["error"].as_str().unwrap().contains("unknown collector"));
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_assertion_failure_is_marked() {
        let h = harness(
            true,
            vec![entry(
                "main",
                "echo",
                json!({"statusCode": 503}),
                vec![Assertion {
                    field: "statusCode".to_string(),
                    operator: AssertionOperator::Equals,
                    value: json!(200),
                }],
            )],
            Some(false),
        );
        let run = h.executor.execute(&payload()).await.unwrap().unwrap();

        assert_eq!(run.status, HealthStatus::Unhealthy);
        assert_eq!(run.result["main"]["assertionFailed"]["field"], "statusCode");
        assert_eq!(run.result["main"]["result"]["statusCode"], 503);
    }

    #[tokio::test]
    async fn test_connection_failure_records_unhealthy_run() {
        let h = harness(false, vec![entry("main", "echo", json!({}), Vec::new())], Some(false));
        let run = h.executor.execute(&payload()).await.unwrap().unwrap();

        assert_eq!(run.status, HealthStatus::Unhealthy);
        assert_eq!(run.result["phase"], "connect");
        assert!(run.result["error"].as_str().unwrap().contains("refused"));
        assert_eq!(h.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_still_closes_connection() {
        let h = harness(
            true,
            vec![
                entry("slow", "hanging", Value::Null, Vec::new()),
                entry("fast", "echo", json!({}), Vec::new()),
            ],
            Some(false),
        );
        let run = h.executor.execute(&payload()).await.unwrap().unwrap();

        assert_eq!(run.status, HealthStatus::Unhealthy);
        assert_eq!(run.result["phase"], "collect");
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_pair_is_skipped() {
        let h = harness(true, Vec::new(), Some(false));
        let mut pair = h.store.get_system_check("sys", "cfg").unwrap().unwrap();
        pair.enabled = false;
        h.store.upsert_system_check(&pair).unwrap();

        assert_eq!(h.executor.execute(&payload()).await.unwrap(), None);
        assert!(h.store.get_recent_runs("sys", "cfg", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_changes_are_notified() {
        let h = harness(false, Vec::new(), Some(false));
        h.executor.execute(&payload()).await.unwrap();

        let changes = h.sink.changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, HealthStatus::Healthy);
        assert_eq!(changes[0].current, HealthStatus::Unhealthy);
        let events = h.sink.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, HealthEvent::SystemDegraded { .. })));
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_notified() {
        let h = harness(true, Vec::new(), Some(false));
        h.executor.execute(&payload()).await.unwrap();
        h.executor.execute(&payload()).await.unwrap();
        assert!(h.sink.changes.lock().unwrap().is_empty());
        assert_eq!(h.sink.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_emits_event() {
        let h = harness(true, Vec::new(), Some(false));
        let mut failed = Run {
            id: 0,
            system_id: "sys".to_string(),
            configuration_id: "cfg".to_string(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            result: json!({}),
            timestamp: Utc::now() - ChronoDuration::seconds(60),
        };
        h.store.add_run(&mut failed).unwrap();

        h.executor.execute(&payload()).await.unwrap();
        let events = h.sink.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, HealthEvent::SystemRecovered { .. })));
    }

    #[tokio::test]
    async fn test_suppressed_change_still_emits_events() {
        let h = harness(false, Vec::new(), Some(true));
        h.executor.execute(&payload()).await.unwrap();
        assert!(h.sink.changes.lock().unwrap().is_empty());
        assert!(h
            .sink
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, HealthEvent::SystemDegraded { .. })));
    }

    #[tokio::test]
    async fn test_suppression_check_failure_fails_open() {
        let h = harness(false, Vec::new(), None);
        h.executor.execute(&payload()).await.unwrap();
        assert_eq!(h.sink.changes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_window_suppresses_with_notifier() {
        let h = harness(false, Vec::new(), Some(false));
        let notifier = Arc::new(Notifier::new(h.store.clone(), None));
        let mut events = notifier.subscribe();

        let now = Utc::now();
        h.store
            .add_maintenance(&mut Maintenance {
                id: 0,
                system_id: "sys".to_string(),
                starts_at: now - ChronoDuration::minutes(1),
                ends_at: now + ChronoDuration::minutes(10),
                suppress_notifications: true,
                description: String::new(),
            })
            .unwrap();

        let registry = Arc::new({
            let mut r = ProbeRegistry::new();
            r.register_strategy(Arc::new(FakeStrategy {
                reachable: false,
                closes: h.closes.clone(),
            }))
            .unwrap();
            r
        });
        let executor = HealthCheckExecutor::new(
            h.store.clone(),
            registry.clone(),
            Arc::new(RetentionReader::new(h.store.clone(), registry)),
            notifier.clone(),
            Duration::from_secs(5),
        )
        .with_jitter(Duration::ZERO);

        executor.execute(&payload()).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), HealthEvent::RunCompleted { .. }));
        assert!(matches!(events.recv().await.unwrap(), HealthEvent::SystemDegraded { .. }));
    }
}
