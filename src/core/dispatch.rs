//! Side effects of predictions.
//!
//! The dispatcher consumes records from the scheduler's queue on its own
//! worker so slow explanation or alert calls never delay a tick. Alerts fire
//! on entry into High only; pump commands are explicit and never automatic.

use crate::core::inference::{PredictionRecord, RiskLevel};
use crate::external::alert::{Alert, AlertSink};
use crate::external::explain::{template_explanation, ExplainError, Explainer, Language};
use crate::external::registry::{RegistryError, SensorRegistry};
use crate::telemetry::SharedStats;
use crate::transport::types::{ActuatorCommand, ActuatorMessage, Topics};
use crate::transport::{Transport, TransportError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Attempts per alert: the first send plus one retry.
const ALERT_ATTEMPTS: usize = 2;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown sensor '{0}'")]
    UnknownSensor(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode actuator command: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
struct SensorState {
    level: RiskLevel,
    last_alert: Option<DateTime<Utc>>,
}

/// Per-sensor risk state deciding when an alert is due.
#[derive(Debug, Default)]
pub struct EscalationTracker {
    states: HashMap<String, SensorState>,
    cooldown: Option<chrono::Duration>,
}

impl EscalationTracker {
    /// `cooldown` re-arms alerts for sensors that stay High that long.
    pub fn new(cooldown: Option<Duration>) -> Self {
        Self {
            states: HashMap::new(),
            cooldown: cooldown.and_then(|c| chrono::Duration::from_std(c).ok()),
        }
    }

    /// Update state with a record and report whether it should alert.
    pub fn observe(&mut self, record: &PredictionRecord) -> bool {
        let previous = self.states.get(&record.sensor_id).copied();
        let is_high = record.risk_level == RiskLevel::High;

        let alert = match previous {
            _ if !is_high => false,
            None => true,
            Some(state) if state.level != RiskLevel::High => true,
            Some(state) => match (self.cooldown, state.last_alert) {
                (Some(cooldown), Some(last)) => record.timestamp - last >= cooldown,
                _ => false,
            },
        };

        let last_alert = if alert {
            Some(record.timestamp)
        } else {
            previous.and_then(|s| s.last_alert)
        };
        self.states.insert(
            record.sensor_id.clone(),
            SensorState {
                level: record.risk_level,
                last_alert,
            },
        );
        alert
    }

    pub fn level(&self, sensor_id: &str) -> Option<RiskLevel> {
        self.states.get(sensor_id).map(|s| s.level)
    }
}

/// Alerting, explanations and actuation.
pub struct Dispatcher {
    tracker: Mutex<EscalationTracker>,
    explainer: Arc<dyn Explainer>,
    language: Language,
    explanation_timeout: Duration,
    alerts: Arc<dyn AlertSink>,
    transport: Arc<dyn Transport>,
    topics: Topics,
    registry: Arc<dyn SensorRegistry>,
    stats: SharedStats,
}

/// Collaborators and settings for a [`Dispatcher`].
pub struct DispatcherConfig {
    pub explainer: Arc<dyn Explainer>,
    pub language: Language,
    pub explanation_timeout: Duration,
    pub alerts: Arc<dyn AlertSink>,
    pub cooldown: Option<Duration>,
    pub transport: Arc<dyn Transport>,
    pub topics: Topics,
    pub registry: Arc<dyn SensorRegistry>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, stats: SharedStats) -> Self {
        Self {
            tracker: Mutex::new(EscalationTracker::new(config.cooldown)),
            explainer: config.explainer,
            language: config.language,
            explanation_timeout: config.explanation_timeout,
            alerts: config.alerts,
            transport: config.transport,
            topics: config.topics,
            registry: config.registry,
            stats,
        }
    }

    /// Process one record. Returns true if an alert was delivered.
    pub async fn handle(&self, record: &PredictionRecord) -> bool {
        let due = self
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(record);
        if !due {
            return false;
        }

        tracing::info!(
            "{} ({}) escalated to High at {:.1}%",
            record.sensor_id,
            record.city,
            record.probability_percent()
        );

        let explanation = self.explain(record).await;
        let alert = Alert::from_record(record, explanation);

        for attempt in 1..=ALERT_ATTEMPTS {
            match self.alerts.send(&alert).await {
                Ok(()) => {
                    self.stats.record_alert_sent();
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "Alert for {} failed (attempt {attempt}/{ALERT_ATTEMPTS}): {e}",
                        record.sensor_id
                    );
                }
            }
        }

        self.stats.record_alert_failure();
        tracing::error!("Dropping alert for {} after {ALERT_ATTEMPTS} attempts", record.sensor_id);
        false
    }

    /// Explanation text, falling back to the template on error or timeout.
    pub async fn explain(&self, record: &PredictionRecord) -> String {
        let result = match tokio::time::timeout(
            self.explanation_timeout,
            self.explainer.explain(record, self.language),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExplainError::Timeout(self.explanation_timeout)),
        };

        match result {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Using templated explanation for {}: {e}", record.sensor_id);
                self.stats.record_explanation_fallback();
                template_explanation(record, self.language)
            }
        }
    }

    /// Publish a pump command for a registered sensor.
    pub async fn control_actuator(
        &self,
        sensor_id: &str,
        command: ActuatorCommand,
    ) -> Result<ActuatorMessage, DispatchError> {
        let sensor = self
            .registry
            .find_sensor(sensor_id)
            .await?
            .ok_or_else(|| DispatchError::UnknownSensor(sensor_id.to_string()))?;

        let message = ActuatorMessage::new(command);
        let topic = self.topics.actuator(&sensor.city, &sensor.sensor_id);
        self.transport
            .publish(&topic, serde_json::to_vec(&message)?)
            .await?;

        self.stats.record_actuator_command();
        tracing::info!("Published {command} to {topic}");
        Ok(message)
    }

    pub fn risk_level(&self, sensor_id: &str) -> Option<RiskLevel> {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .level(sensor_id)
    }

    /// Worker loop: handle records until the queue closes or shutdown is signalled,
    /// then drain what is left within `deadline`.
    pub async fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<PredictionRecord>,
        mut shutdown: watch::Receiver<bool>,
        deadline: Duration,
    ) {
        while !*shutdown.borrow() {
            tokio::select! {
                record = queue.recv() => match record {
                    Some(record) => {
                        self.handle(&record).await;
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        // Keep draining until the scheduler releases the queue or the deadline passes.
        let deadline = Instant::now() + deadline;
        let mut drained = 0u64;
        let mut dropped = 0u64;

        loop {
            match tokio::time::timeout_at(deadline, queue.recv()).await {
                Ok(Some(record)) => {
                    match tokio::time::timeout_at(deadline, self.handle(&record)).await {
                        Ok(_) => drained += 1,
                        Err(_) => dropped += 1,
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        queue.close();
        while queue.try_recv().is_ok() {
            dropped += 1;
        }

        if dropped > 0 {
            self.stats.record_dispatch_dropped(dropped);
            tracing::warn!("Dispatcher stopped: {drained} record(s) drained, {dropped} dropped at deadline");
        } else {
            tracing::info!("Dispatcher stopped: {drained} record(s) drained");
        }
    }
}
