//! Escalation for events that will never be processed successfully.

use crate::error::{Result, WebhookError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The handler reported a failure that redelivery cannot fix.
    PermanentFailure,
    /// Recoverable failures exhausted the attempt ceiling.
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub event_id: String,
    pub event_type: String,
    pub reason: String,
    pub kind: AlertKind,
}

/// Receives one alert per dead-lettered event. Delivery problems are the
/// sink's own concern; the pipeline never waits on a retry.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: Alert);
}

/// Logs alerts at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, alert: Alert) {
        tracing::error!(
            event_id = %alert.event_id,
            event_type = %alert.event_type,
            kind = ?alert.kind,
            reason = %alert.reason,
            "Webhook event dead-lettered"
        );
    }
}

/// Posts alerts as JSON to an internal endpoint.
pub struct HttpAlertSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpAlertSink {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WebhookError::config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl AlertSink for HttpAlertSink {
    async fn alert(&self, alert: Alert) {
        let mut request = self.client.post(&self.url).json(&alert);
        if let Some(token) = &self.token {
            request = request.header("X-Internal-Token", token);
        }

        match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(_) => tracing::info!(event_id = %alert.event_id, "Alert delivered"),
            Err(e) => tracing::error!(
                event_id = %alert.event_id,
                event_type = %alert.event_type,
                kind = ?alert.kind,
                error = %e,
                "Failed to deliver alert"
            ),
        }
    }
}
