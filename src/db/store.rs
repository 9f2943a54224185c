//! SQLite database store implementation.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::aggregation::AggregatedResult;
use crate::versioning::VersionedRecord;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid retention configuration: {0}")]
    InvalidRetention(String),
    #[error("Database lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        for m in report.applied_migrations() {
            tracing::info!("Store: applied migration V{}__{}", m.version(), m.name());
        }
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Check configurations ---

    /// Insert or replace a check configuration.
    pub fn upsert_configuration(&self, cfg: &CheckConfiguration) -> Result<(), DbError> {
        let config = serde_json::to_string(&cfg.config)?;
        let collectors = serde_json::to_string(&cfg.collectors)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO check_configurations (id, name, strategy_id, config, collectors, interval_seconds, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
             name=excluded.name, strategy_id=excluded.strategy_id, config=excluded.config,
             collectors=excluded.collectors, interval_seconds=excluded.interval_seconds,
             updated_at=excluded.updated_at",
            params![
                cfg.id,
                cfg.name,
                cfg.strategy_id,
                config,
                collectors,
                cfg.interval_seconds as i64,
                to_millis(cfg.created_at),
                to_millis(cfg.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Get a configuration by ID.
    pub fn get_configuration(&self, id: &str) -> Result<Option<CheckConfiguration>, DbError> {
        let conn = self.conn()?;
        let cfg = conn
            .query_row(
                "SELECT id, name, strategy_id, config, collectors, interval_seconds, created_at, updated_at
                 FROM check_configurations WHERE id = ?1",
                params![id],
                configuration_from_row,
            )
            .optional()?;
        Ok(cfg)
    }

    /// Get all configurations.
    pub fn get_configurations(&self) -> Result<Vec<CheckConfiguration>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, strategy_id, config, collectors, interval_seconds, created_at, updated_at
             FROM check_configurations ORDER BY id",
        )?;
        let cfgs = stmt
            .query_map([], configuration_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(cfgs)
    }

    /// Delete a configuration together with its pairs, runs and aggregates.
    pub fn delete_configuration(&self, id: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM health_check_runs WHERE configuration_id = ?1", params![id])?;
        tx.execute("DELETE FROM health_check_aggregates WHERE configuration_id = ?1", params![id])?;
        tx.execute("DELETE FROM system_checks WHERE configuration_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM check_configurations WHERE id = ?1", params![id])?;
        tx.commit()?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- System/check pairs ---

    /// Insert or update a pair. The retention hierarchy is validated before writing.
    pub fn upsert_system_check(&self, pair: &SystemCheck) -> Result<(), DbError> {
        pair.retention.validate().map_err(DbError::InvalidRetention)?;
        let thresholds = pair
            .thresholds
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO system_checks (system_id, configuration_id, enabled, thresholds,
                 raw_retention_days, hourly_retention_days, daily_retention_days, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(system_id, configuration_id) DO UPDATE SET
             enabled=excluded.enabled, thresholds=excluded.thresholds,
             raw_retention_days=excluded.raw_retention_days,
             hourly_retention_days=excluded.hourly_retention_days,
             daily_retention_days=excluded.daily_retention_days,
             updated_at=excluded.updated_at",
            params![
                pair.system_id,
                pair.configuration_id,
                pair.enabled,
                thresholds,
                pair.retention.raw_retention_days,
                pair.retention.hourly_retention_days,
                pair.retention.daily_retention_days,
                to_millis(pair.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Get one pair.
    pub fn get_system_check(
        &self,
        system_id: &str,
        configuration_id: &str,
    ) -> Result<Option<SystemCheck>, DbError> {
        let conn = self.conn()?;
        let pair = conn
            .query_row(
                &format!("{} WHERE system_id = ?1 AND configuration_id = ?2", SYSTEM_CHECK_SELECT),
                params![system_id, configuration_id],
                system_check_from_row,
            )
            .optional()?;
        Ok(pair)
    }

    /// Get every pair that is currently enabled.
    pub fn get_enabled_system_checks(&self) -> Result<Vec<SystemCheck>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE enabled = 1 ORDER BY system_id, configuration_id",
            SYSTEM_CHECK_SELECT
        ))?;
        let pairs = stmt
            .query_map([], system_check_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(pairs)
    }

    /// Get all pairs of a system, enabled or not.
    pub fn get_system_checks_for_system(&self, system_id: &str) -> Result<Vec<SystemCheck>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE system_id = ?1 ORDER BY configuration_id",
            SYSTEM_CHECK_SELECT
        ))?;
        let pairs = stmt
            .query_map(params![system_id], system_check_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(pairs)
    }

    /// Get all pairs.
    pub fn get_system_checks(&self) -> Result<Vec<SystemCheck>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY system_id, configuration_id",
            SYSTEM_CHECK_SELECT
        ))?;
        let pairs = stmt
            .query_map([], system_check_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(pairs)
    }

    /// Replace a pair's retention configuration. Rejected before any write if
    /// the hierarchy is violated.
    pub fn update_retention_config(
        &self,
        system_id: &str,
        configuration_id: &str,
        retention: &RetentionConfig,
    ) -> Result<(), DbError> {
        retention.validate().map_err(DbError::InvalidRetention)?;
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE system_checks SET raw_retention_days=?1, hourly_retention_days=?2,
                 daily_retention_days=?3, updated_at=?4
             WHERE system_id=?5 AND configuration_id=?6",
            params![
                retention.raw_retention_days,
                retention.hourly_retention_days,
                retention.daily_retention_days,
                to_millis(Utc::now()),
                system_id,
                configuration_id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Remove a pair and its history.
    pub fn delete_system_check(&self, system_id: &str, configuration_id: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM health_check_runs WHERE system_id = ?1 AND configuration_id = ?2",
            params![system_id, configuration_id],
        )?;
        tx.execute(
            "DELETE FROM health_check_aggregates WHERE system_id = ?1 AND configuration_id = ?2",
            params![system_id, configuration_id],
        )?;
        tx.execute(
            "DELETE FROM system_checks WHERE system_id = ?1 AND configuration_id = ?2",
            params![system_id, configuration_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- Runs ---

    /// Store a run and return its ID.
    pub fn add_run(&self, run: &mut Run) -> Result<i64, DbError> {
        let result = serde_json::to_string(&run.result)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO health_check_runs (system_id, configuration_id, status, latency_ms, result, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.system_id,
                run.configuration_id,
                run.status.as_str(),
                run.latency_ms,
                result,
                to_millis(run.timestamp),
            ],
        )?;
        let id = conn.last_insert_rowid();
        run.id = id;
        Ok(id)
    }

    /// Get the newest runs of a pair, newest first.
    pub fn get_recent_runs(
        &self,
        system_id: &str,
        configuration_id: &str,
        limit: usize,
    ) -> Result<Vec<Run>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, system_id, configuration_id, status, latency_ms, result, timestamp_ms
             FROM health_check_runs WHERE system_id = ?1 AND configuration_id = ?2
             ORDER BY timestamp_ms DESC, id DESC LIMIT ?3",
        )?;
        let runs = stmt
            .query_map(
                params![system_id, configuration_id, limit as i64],
                run_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(runs)
    }

    /// Get runs of a pair within `[start, end)`, oldest first.
    pub fn get_runs(
        &self,
        system_id: &str,
        configuration_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Run>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, system_id, configuration_id, status, latency_ms, result, timestamp_ms
             FROM health_check_runs
             WHERE system_id = ?1 AND configuration_id = ?2 AND timestamp_ms >= ?3 AND timestamp_ms < ?4
             ORDER BY timestamp_ms ASC, id ASC",
        )?;
        let runs = stmt
            .query_map(
                params![system_id, configuration_id, to_millis(start), to_millis(end)],
                run_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(runs)
    }

    /// Get the time of the newest run of a pair.
    pub fn get_last_run_time(
        &self,
        system_id: &str,
        configuration_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let ms: Option<i64> = conn.query_row(
            "SELECT MAX(timestamp_ms) FROM health_check_runs WHERE system_id = ?1 AND configuration_id = ?2",
            params![system_id, configuration_id],
            |row| row.get(0),
        )?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Get the time of the oldest stored run of a pair.
    pub fn get_earliest_run_time(
        &self,
        system_id: &str,
        configuration_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let ms: Option<i64> = conn.query_row(
            "SELECT MIN(timestamp_ms) FROM health_check_runs WHERE system_id = ?1 AND configuration_id = ?2",
            params![system_id, configuration_id],
            |row| row.get(0),
        )?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Delete runs of a pair before a cutoff. Returns the number deleted.
    pub fn delete_runs_before(
        &self,
        system_id: &str,
        configuration_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM health_check_runs WHERE system_id = ?1 AND configuration_id = ?2 AND timestamp_ms < ?3",
            params![system_id, configuration_id, to_millis(cutoff)],
        )?;
        Ok(n)
    }

    // --- Aggregates ---

    /// Upsert aggregate rows in one transaction.
    pub fn add_aggregates(&self, rows: &[AggregateRow]) -> Result<(), DbError> {
        if rows.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO health_check_aggregates (system_id, configuration_id, tier, bucket_start_ms,
                     run_count, healthy_count, degraded_count, unhealthy_count,
                     latency_sum_ms, min_latency_ms, max_latency_ms, p95_latency_ms,
                     latency_digest, aggregated_result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(system_id, configuration_id, tier, bucket_start_ms) DO UPDATE SET
                 run_count=excluded.run_count, healthy_count=excluded.healthy_count,
                 degraded_count=excluded.degraded_count, unhealthy_count=excluded.unhealthy_count,
                 latency_sum_ms=excluded.latency_sum_ms, min_latency_ms=excluded.min_latency_ms,
                 max_latency_ms=excluded.max_latency_ms, p95_latency_ms=excluded.p95_latency_ms,
                 latency_digest=excluded.latency_digest, aggregated_result=excluded.aggregated_result",
            )?;

            for r in rows {
                let aggregated = r
                    .aggregated_result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    r.system_id,
                    r.configuration_id,
                    r.tier.as_str(),
                    to_millis(r.bucket_start),
                    r.run_count as i64,
                    r.healthy_count as i64,
                    r.degraded_count as i64,
                    r.unhealthy_count as i64,
                    r.latency_sum_ms,
                    r.min_latency_ms,
                    r.max_latency_ms,
                    r.p95_latency_ms,
                    r.latency_digest,
                    aggregated,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get aggregate rows of one tier whose bucket starts within `[start, end)`.
    pub fn get_aggregates(
        &self,
        system_id: &str,
        configuration_id: &str,
        tier: AggregateTier,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRow>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT system_id, configuration_id, tier, bucket_start_ms,
                 run_count, healthy_count, degraded_count, unhealthy_count,
                 latency_sum_ms, min_latency_ms, max_latency_ms, p95_latency_ms,
                 latency_digest, aggregated_result
             FROM health_check_aggregates
             WHERE system_id = ?1 AND configuration_id = ?2 AND tier = ?3
               AND bucket_start_ms >= ?4 AND bucket_start_ms < ?5
             ORDER BY bucket_start_ms ASC",
        )?;
        let rows = stmt
            .query_map(
                params![
                    system_id,
                    configuration_id,
                    tier.as_str(),
                    to_millis(start),
                    to_millis(end),
                ],
                aggregate_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get the start of the newest bucket of a tier.
    pub fn get_last_aggregate_start(
        &self,
        system_id: &str,
        configuration_id: &str,
        tier: AggregateTier,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let ms: Option<i64> = conn.query_row(
            "SELECT MAX(bucket_start_ms) FROM health_check_aggregates
             WHERE system_id = ?1 AND configuration_id = ?2 AND tier = ?3",
            params![system_id, configuration_id, tier.as_str()],
            |row| row.get(0),
        )?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Get the start of the oldest bucket of a tier.
    pub fn get_earliest_aggregate_start(
        &self,
        system_id: &str,
        configuration_id: &str,
        tier: AggregateTier,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let ms: Option<i64> = conn.query_row(
            "SELECT MIN(bucket_start_ms) FROM health_check_aggregates
             WHERE system_id = ?1 AND configuration_id = ?2 AND tier = ?3",
            params![system_id, configuration_id, tier.as_str()],
            |row| row.get(0),
        )?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Delete aggregate rows of a tier before a cutoff. Returns the number deleted.
    pub fn delete_aggregates_before(
        &self,
        system_id: &str,
        configuration_id: &str,
        tier: AggregateTier,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM health_check_aggregates
             WHERE system_id = ?1 AND configuration_id = ?2 AND tier = ?3 AND bucket_start_ms < ?4",
            params![system_id, configuration_id, tier.as_str(), to_millis(cutoff)],
        )?;
        Ok(n)
    }

    // --- Maintenance windows ---

    /// Add a maintenance window and return its ID.
    pub fn add_maintenance(&self, m: &mut Maintenance) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO maintenances (system_id, starts_at_ms, ends_at_ms, suppress_notifications, description)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                m.system_id,
                to_millis(m.starts_at),
                to_millis(m.ends_at),
                m.suppress_notifications,
                m.description,
            ],
        )?;
        let id = conn.last_insert_rowid();
        m.id = id;
        Ok(id)
    }

    /// Whether a system is inside an active maintenance that silences notifications.
    pub fn is_notification_suppressed(&self, system_id: &str, at: DateTime<Utc>) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM maintenances
             WHERE system_id = ?1 AND suppress_notifications = 1
               AND starts_at_ms <= ?2 AND ends_at_ms > ?2",
            params![system_id, to_millis(at)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> SqlResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

const SYSTEM_CHECK_SELECT: &str = "SELECT system_id, configuration_id, enabled, thresholds,
     raw_retention_days, hourly_retention_days, daily_retention_days, updated_at
     FROM system_checks";

fn configuration_from_row(row: &Row<'_>) -> SqlResult<CheckConfiguration> {
    Ok(CheckConfiguration {
        id: row.get(0)?,
        name: row.get(1)?,
        strategy_id: row.get(2)?,
        config: json_column::<VersionedRecord>(row, 3)?,
        collectors: json_column(row, 4)?,
        interval_seconds: row.get::<_, i64>(5)?.max(0) as u64,
        created_at: from_millis(row.get(6)?),
        updated_at: from_millis(row.get(7)?),
    })
}

fn system_check_from_row(row: &Row<'_>) -> SqlResult<SystemCheck> {
    let thresholds: Option<String> = row.get(3)?;
    let thresholds = thresholds
        .map(|t| serde_json::from_str::<VersionedRecord>(&t))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(SystemCheck {
        system_id: row.get(0)?,
        configuration_id: row.get(1)?,
        enabled: row.get(2)?,
        thresholds,
        retention: RetentionConfig {
            raw_retention_days: row.get(4)?,
            hourly_retention_days: row.get(5)?,
            daily_retention_days: row.get(6)?,
        },
        updated_at: from_millis(row.get(7)?),
    })
}

fn run_from_row(row: &Row<'_>) -> SqlResult<Run> {
    Ok(Run {
        id: row.get(0)?,
        system_id: row.get(1)?,
        configuration_id: row.get(2)?,
        status: parsed_column(row, 3)?,
        latency_ms: row.get(4)?,
        result: json_column(row, 5)?,
        timestamp: from_millis(row.get(6)?),
    })
}

fn aggregate_from_row(row: &Row<'_>) -> SqlResult<AggregateRow> {
    let aggregated: Option<String> = row.get(13)?;
    let aggregated_result = aggregated
        .map(|a| serde_json::from_str::<AggregatedResult>(&a))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(13, Type::Text, Box::new(e)))?;
    Ok(AggregateRow {
        system_id: row.get(0)?,
        configuration_id: row.get(1)?,
        tier: parsed_column(row, 2)?,
        bucket_start: from_millis(row.get(3)?),
        run_count: row.get::<_, i64>(4)?.max(0) as u64,
        healthy_count: row.get::<_, i64>(5)?.max(0) as u64,
        degraded_count: row.get::<_, i64>(6)?.max(0) as u64,
        unhealthy_count: row.get::<_, i64>(7)?.max(0) as u64,
        latency_sum_ms: row.get(8)?,
        min_latency_ms: row.get(9)?,
        max_latency_ms: row.get(10)?,
        p95_latency_ms: row.get(11)?,
        latency_digest: row.get(12)?,
        aggregated_result,
    })
}
