//! HTTP request handlers.

use super::AppState;
use crate::db::{CheckConfiguration, CollectorEntry, DbError, Maintenance, RetentionConfig, SystemCheck};
use crate::health::StateThresholds;
use crate::history::{HistoryError, HistoryOptions, HistoryQuery};
use crate::versioning::VersionedRecord;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::fmt::Display;

const DEFAULT_RUN_LIMIT: usize = 50;
const MAX_RUN_LIMIT: usize = 1000;

fn internal(e: impl Display) -> Response {
    tracing::error!("API: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, message.into()).into_response()
}

fn history_error(e: HistoryError) -> Response {
    match e {
        HistoryError::InvalidRange(_) => bad_request(e.to_string()),
        other => internal(other),
    }
}

// ============================================================================
// API: Configurations
// ============================================================================

pub async fn handle_get_configurations(State(state): State<AppState>) -> Response {
    match state.store.get_configurations() {
        Ok(configurations) => Json(configurations).into_response(),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub strategy_id: String,
    pub config: VersionedRecord,
    #[serde(default)]
    pub collectors: Vec<CollectorEntry>,
    pub interval_seconds: u64,
}

impl ConfigurationRequest {
    /// Check the request against the registered strategies and collectors.
    fn validate(&self, state: &AppState) -> Result<(), String> {
        if self.interval_seconds == 0 {
            return Err("intervalSeconds must be positive".to_string());
        }
        state
            .registry
            .parse_config(&self.strategy_id, &self.config)
            .map_err(|e| e.to_string())?;
        if let Some(entry) = self
            .collectors
            .iter()
            .find(|c| state.registry.collector(&c.collector_id).is_none())
        {
            return Err(format!("unknown collector: {}", entry.collector_id));
        }
        Ok(())
    }
}

pub async fn handle_create_configuration(
    State(state): State<AppState>,
    Json(req): Json<ConfigurationRequest>,
) -> Response {
    if let Err(e) = req.validate(&state) {
        return bad_request(e);
    }

    let now = Utc::now();
    let configuration = CheckConfiguration {
        id: req.id.unwrap_or_else(|| format!("cfg-{}", now.timestamp_millis())),
        name: req.name,
        strategy_id: req.strategy_id,
        config: req.config,
        collectors: req.collectors,
        interval_seconds: req.interval_seconds,
        created_at: now,
        updated_at: now,
    };

    match state.store.get_configuration(&configuration.id) {
        Ok(Some(_)) => return (StatusCode::CONFLICT, "Configuration already exists").into_response(),
        Ok(None) => {}
        Err(e) => return internal(e),
    }

    match state.store.upsert_configuration(&configuration) {
        Ok(()) => (StatusCode::CREATED, Json(configuration)).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn handle_update_configuration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfigurationRequest>,
) -> Response {
    if let Err(e) = req.validate(&state) {
        return bad_request(e);
    }

    let existing = match state.store.get_configuration(&id) {
        Ok(Some(c)) => c,
        Ok(None) => return (StatusCode::NOT_FOUND, "Configuration not found").into_response(),
        Err(e) => return internal(e),
    };

    let updated = CheckConfiguration {
        id: id.clone(),
        name: req.name,
        strategy_id: req.strategy_id,
        config: req.config,
        collectors: req.collectors,
        interval_seconds: req.interval_seconds,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };

    if let Err(e) = state.store.upsert_configuration(&updated) {
        return internal(e);
    }

    // The interval may have changed.
    if let Err(e) = state.scheduler.reschedule_configuration(&id).await {
        return internal(e);
    }
    Json(updated).into_response()
}

pub async fn handle_delete_configuration(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if let Err(e) = state.scheduler.unschedule_configuration(&id).await {
        return internal(e);
    }

    match state.store.delete_configuration(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(DbError::NotFound) => (StatusCode::NOT_FOUND, "Configuration not found").into_response(),
        Err(e) => internal(e),
    }
}

// ============================================================================
// API: System checks
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCheckRequest {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub thresholds: Option<StateThresholds>,
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
}

fn default_enabled() -> bool {
    true
}

pub async fn handle_put_system_check(
    State(state): State<AppState>,
    Path((system_id, configuration_id)): Path<(String, String)>,
    Json(req): Json<SystemCheckRequest>,
) -> Response {
    match state.store.get_configuration(&configuration_id) {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "Configuration not found").into_response(),
        Err(e) => return internal(e),
    }

    let existing = match state.store.get_system_check(&system_id, &configuration_id) {
        Ok(p) => p,
        Err(e) => return internal(e),
    };

    // Omitted fields keep their stored values.
    let thresholds = match &req.thresholds {
        Some(t) => {
            if let Err(e) = t.validate() {
                return bad_request(e);
            }
            match t.to_record() {
                Ok(record) => Some(record),
                Err(e) => return internal(e),
            }
        }
        None => existing.as_ref().and_then(|p| p.thresholds.clone()),
    };
    let retention = match req.retention {
        Some(r) => {
            if let Err(e) = r.validate() {
                return bad_request(e);
            }
            r
        }
        None => existing.as_ref().map(|p| p.retention).unwrap_or_default(),
    };

    let pair = SystemCheck {
        system_id,
        configuration_id,
        enabled: req.enabled,
        thresholds,
        retention,
        updated_at: Utc::now(),
    };

    if let Err(e) = state.store.upsert_system_check(&pair) {
        return internal(e);
    }
    if let Err(e) = state.scheduler.schedule_pair(&pair).await {
        return internal(e);
    }
    Json(pair).into_response()
}

pub async fn handle_delete_system_check(
    State(state): State<AppState>,
    Path((system_id, configuration_id)): Path<(String, String)>,
) -> Response {
    if let Err(e) = state.scheduler.unschedule_pair(&system_id, &configuration_id).await {
        return internal(e);
    }

    match state.store.delete_system_check(&system_id, &configuration_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal(e),
    }
}

pub async fn handle_put_retention(
    State(state): State<AppState>,
    Path((system_id, configuration_id)): Path<(String, String)>,
    Json(retention): Json<RetentionConfig>,
) -> Response {
    match state
        .store
        .update_retention_config(&system_id, &configuration_id, &retention)
    {
        Ok(()) => Json(retention).into_response(),
        Err(DbError::InvalidRetention(e)) => bad_request(e),
        Err(DbError::NotFound) => (StatusCode::NOT_FOUND, "System check not found").into_response(),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_get_runs(
    State(state): State<AppState>,
    Path((system_id, configuration_id)): Path<(String, String)>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    match state.store.get_recent_runs(&system_id, &configuration_id, limit) {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => internal(e),
    }
}

// ============================================================================
// API: Health and history
// ============================================================================

pub async fn handle_get_system_health(State(state): State<AppState>, Path(system_id): Path<String>) -> Response {
    match state.reader.get_system_health_status(&system_id) {
        Ok(health) => Json(health).into_response(),
        Err(e) => history_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub system_id: String,
    pub configuration_id: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub target_points: Option<usize>,
    #[serde(default)]
    pub include_aggregated_result: Option<bool>,
}

pub async fn handle_get_history(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> Response {
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or_else(|| end - ChronoDuration::hours(24));

    let query = HistoryQuery {
        system_id: params.system_id,
        configuration_id: params.configuration_id,
        start_date: start,
        end_date: end,
        target_points: params.target_points,
    };
    let options = HistoryOptions {
        include_aggregated_result: params.include_aggregated_result.unwrap_or(false),
    };

    match state.reader.get_aggregated_history(&query, options) {
        Ok(history) => Json(history).into_response(),
        Err(e) => history_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityParams {
    pub system_id: String,
    pub configuration_id: String,
}

pub async fn handle_get_availability(
    State(state): State<AppState>,
    Query(params): Query<AvailabilityParams>,
) -> Response {
    match state
        .reader
        .get_availability_stats(&params.system_id, &params.configuration_id)
    {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => history_error(e),
    }
}

// ============================================================================
// API: Maintenance windows
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRequest {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default = "default_enabled")]
    pub suppress_notifications: bool,
    #[serde(default)]
    pub description: String,
}

pub async fn handle_create_maintenance(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
    Json(req): Json<MaintenanceRequest>,
) -> Response {
    if req.ends_at <= req.starts_at {
        return bad_request("endsAt must be after startsAt");
    }

    let mut maintenance = Maintenance {
        id: 0,
        system_id,
        starts_at: req.starts_at,
        ends_at: req.ends_at,
        suppress_notifications: req.suppress_notifications,
        description: req.description,
    };
    match state.store.add_maintenance(&mut maintenance) {
        Ok(_) => (StatusCode::CREATED, Json(maintenance)).into_response(),
        Err(e) => internal(e),
    }
}
