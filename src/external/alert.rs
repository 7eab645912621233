//! Alert delivery.
//!
//! The pipeline hands alerts to a sink and moves on; delivery to people
//! (email, SMS) is the notifier's job behind the webhook.

use crate::core::inference::{PredictionRecord, RiskLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("alert endpoint returned status {0}")]
    Status(u16),
}

/// Alert payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub sensor_id: String,
    pub city: String,
    pub probability: f64,
    pub risk_level: RiskLevel,
    pub model_version: String,
    pub timestamp: DateTime<Utc>,
    pub explanation: String,
}

impl Alert {
    pub fn from_record(record: &PredictionRecord, explanation: String) -> Self {
        Self {
            sensor_id: record.sensor_id.clone(),
            city: record.city.clone(),
            probability: record.probability,
            risk_level: record.risk_level,
            model_version: record.model_version.clone(),
            timestamp: record.timestamp,
            explanation,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        tracing::warn!(
            sensor_id = %alert.sensor_id,
            city = %alert.city,
            probability = alert.probability,
            "FLOOD ALERT: {}",
            alert.explanation
        );
        Ok(())
    }
}

/// POSTs alerts as JSON to the notifier.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookAlertSink {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let mut request = self.client.post(&self.url).json(alert);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> Alert {
        Alert {
            sensor_id: "CAS_1".to_string(),
            city: "Casablanca".to_string(),
            probability: 0.85,
            risk_level: RiskLevel::High,
            model_version: "v1".to_string(),
            timestamp: Utc::now(),
            explanation: "High flood risk detected (85%).".to_string(),
        }
    }

    #[tokio::test]
    async fn test_webhook_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alerts"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_partial_json(serde_json::json!({
                "sensor_id": "CAS_1",
                "risk_level": "High"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookAlertSink::new(
            format!("{}/alerts", server.uri()),
            Some("token-1".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();
        sink.send(&alert()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = WebhookAlertSink::new(server.uri(), None, Duration::from_secs(2)).unwrap();
        assert!(matches!(sink.send(&alert()).await, Err(AlertError::Status(503))));
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        assert!(LogAlertSink.send(&alert()).await.is_ok());
    }
}
