//! State-change notifications and health events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::db::{DbError, Store};
use crate::health::HealthStatus;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification error types.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("webhook error: {0}")]
    Webhook(#[from] reqwest::Error),
}

/// A change of a system's aggregate health.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub system_id: String,
    /// Configuration whose run caused the change.
    pub configuration_id: String,
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub changed_at: DateTime<Utc>,
}

impl StateChange {
    /// The typed event for this change, if it is a degradation or recovery.
    pub fn event(&self) -> Option<HealthEvent> {
        if self.current == HealthStatus::Healthy && self.previous != HealthStatus::Healthy {
            Some(HealthEvent::SystemRecovered {
                system_id: self.system_id.clone(),
                previous: self.previous,
                at: self.changed_at,
            })
        } else if self.current > self.previous {
            Some(HealthEvent::SystemDegraded {
                system_id: self.system_id.clone(),
                previous: self.previous,
                current: self.current,
                at: self.changed_at,
            })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HealthEvent {
    RunCompleted {
        system_id: String,
        configuration_id: String,
        status: HealthStatus,
        latency_ms: Option<f64>,
        at: DateTime<Utc>,
    },
    SystemDegraded {
        system_id: String,
        previous: HealthStatus,
        current: HealthStatus,
        at: DateTime<Utc>,
    },
    SystemRecovered {
        system_id: String,
        previous: HealthStatus,
        at: DateTime<Utc>,
    },
}

/// Where the executor sends state changes and events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Whether an active maintenance silences notifications for the system.
    async fn is_suppressed(&self, system_id: &str) -> Result<bool, NotifyError>;

    async fn notify_state_change(&self, change: &StateChange) -> Result<(), NotifyError>;

    /// Fire-and-forget broadcast to integrations.
    async fn emit(&self, event: HealthEvent) -> Result<(), NotifyError>;
}

/// Store-backed suppression, in-process event fan-out and an optional webhook.
pub struct Notifier {
    store: Arc<Store>,
    events: broadcast::Sender<HealthEvent>,
    webhook: Option<Webhook>,
}

struct Webhook {
    client: reqwest::Client,
    url: String,
}

impl Notifier {
    pub fn new(store: Arc<Store>, webhook_url: Option<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let webhook = webhook_url.map(|url| Webhook {
            client: reqwest::Client::new(),
            url,
        });
        Self {
            store,
            events,
            webhook,
        }
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn is_suppressed(&self, system_id: &str) -> Result<bool, NotifyError> {
        Ok(self.store.is_notification_suppressed(system_id, Utc::now())?)
    }

    async fn notify_state_change(&self, change: &StateChange) -> Result<(), NotifyError> {
        tracing::info!(
            "Notifier: System {} changed {} -> {} (check {})",
            change.system_id,
            change.previous,
            change.current,
            change.configuration_id
        );

        if let Some(webhook) = &self.webhook {
            webhook
                .client
                .post(webhook.url.as_str())
                .json(change)
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }

    async fn emit(&self, event: HealthEvent) -> Result<(), NotifyError> {
        // No subscribers is not an error.
        let _ = self.events.send(event);
        Ok(())
    }
}
