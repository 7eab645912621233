//! Pub/sub transport for sensor readings and actuator commands.
//!
//! The receive side only validates payloads and appends to the rolling
//! buffer; everything heavier happens on the scheduler tick.

pub mod memory;
pub mod mqtt;
pub mod types;

pub use memory::{InMemorySource, InMemoryTransport};
pub use mqtt::{MqttSource, MqttTransport};
pub use types::{ActuatorCommand, ActuatorMessage, Channel, SensorReading, Topics};

use crate::core::buffer::{IngestError, RollingBuffer};
use crate::telemetry::SharedStats;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    #[error("malformed reading on '{topic}': {reason}")]
    Malformed { topic: String, reason: String },
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Outbound side of the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Inbound side of the transport: a receive loop that runs until shutdown.
#[async_trait]
pub trait MessageSource: Send {
    async fn run(self: Box<Self>, ingestor: Ingestor, shutdown: watch::Receiver<bool>);
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Accepted,
    Malformed,
    LateOrDuplicate,
}

/// Receive callback: validates a message and hands it to the buffer.
#[derive(Clone)]
pub struct Ingestor {
    topics: Topics,
    buffer: Arc<RollingBuffer>,
    stats: SharedStats,
}

impl Ingestor {
    pub fn new(topics: Topics, buffer: Arc<RollingBuffer>, stats: SharedStats) -> Self {
        Self {
            topics,
            buffer,
            stats,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Handle a message received now.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> MessageOutcome {
        self.handle_message_at(topic, payload, Utc::now())
    }

    /// Handle a message, using `received_at` when the payload has no timestamp.
    pub fn handle_message_at(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> MessageOutcome {
        let reading = match parse_reading(&self.topics, topic, payload, received_at) {
            Ok(reading) => reading,
            Err(e) => {
                tracing::debug!("{e}");
                self.stats.record_malformed_reading();
                return MessageOutcome::Malformed;
            }
        };

        match self.buffer.ingest(reading) {
            Ok(()) => {
                self.stats.record_reading_ingested();
                MessageOutcome::Accepted
            }
            Err(e @ IngestError::LateOrDuplicate { .. }) => {
                tracing::debug!("{e}");
                self.stats.record_late_or_duplicate();
                MessageOutcome::LateOrDuplicate
            }
        }
    }
}

/// How far ahead of receipt a payload timestamp may be, in seconds.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Object form of a reading payload. Bare numbers are accepted too.
#[derive(Debug, Deserialize)]
struct ReadingPayload {
    value: f64,
    sensor_id: Option<String>,
    channel: Option<String>,
    timestamp: Option<PayloadTimestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PayloadTimestamp {
    Rfc3339(DateTime<Utc>),
    /// ISO 8601 without an offset, read as UTC
    Naive(NaiveDateTime),
    EpochSeconds(f64),
}

/// Validate a raw message into a [`SensorReading`].
pub fn parse_reading(
    topics: &Topics,
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<SensorReading, TransportError> {
    let malformed = |reason: String| TransportError::Malformed {
        topic: topic.to_string(),
        reason,
    };

    let (city, sensor_id, channel_name) = topics
        .parse_reading_topic(topic)
        .ok_or_else(|| malformed("topic does not match the reading layout".to_string()))?;
    let channel: types::Channel = channel_name.parse().map_err(malformed)?;

    let json: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let (value, timestamp) = match json {
        serde_json::Value::Number(n) => (n.as_f64(), None),
        serde_json::Value::Object(_) => {
            let body: ReadingPayload = serde_json::from_value(json)
                .map_err(|e| malformed(format!("invalid reading: {e}")))?;

            if body.sensor_id.as_deref().is_some_and(|id| id != sensor_id) {
                return Err(malformed("sensor_id does not match topic".to_string()));
            }
            if body.channel.as_deref().is_some_and(|c| c != channel_name) {
                return Err(malformed("channel does not match topic".to_string()));
            }
            (Some(body.value), body.timestamp)
        }
        _ => return Err(malformed("payload is neither a number nor an object".to_string())),
    };

    let value = value
        .filter(|v| v.is_finite())
        .ok_or_else(|| malformed("value is not a finite number".to_string()))?;

    let timestamp = match timestamp {
        None => received_at,
        Some(PayloadTimestamp::Rfc3339(ts)) => ts,
        Some(PayloadTimestamp::Naive(ts)) => Utc.from_utc_datetime(&ts),
        Some(PayloadTimestamp::EpochSeconds(secs)) => {
            if !secs.is_finite() {
                return Err(malformed("timestamp is not finite".to_string()));
            }
            DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
                .ok_or_else(|| malformed("timestamp out of range".to_string()))?
        }
    };

    if timestamp > received_at + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(malformed(format!(
            "timestamp {timestamp} is ahead of receipt time {received_at}"
        )));
    }

    Ok(SensorReading::new(sensor_id, city, channel, value, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::create_shared_stats;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn parse(topic: &str, payload: &str) -> Result<SensorReading, TransportError> {
        parse_reading(&Topics::default(), topic, payload.as_bytes(), received())
    }

    #[test]
    fn test_parse_object_payload() {
        let reading = parse(
            "sensors/Casablanca/CAS_1/water_level",
            r#"{"sensor_id": "CAS_1", "channel": "water_level", "value": 75.5, "timestamp": "2024-03-01T11:59:00Z"}"#,
        )
        .unwrap();
        assert_eq!(reading.sensor_id, "CAS_1");
        assert_eq!(reading.city, "Casablanca");
        assert_eq!(reading.channel, Channel::WaterLevel);
        assert_eq!(reading.value, 75.5);
        assert_eq!(reading.timestamp, Utc.with_ymd_and_hms(2024, 3, 1, 11, 59, 0).unwrap());
    }

    #[test]
    fn test_parse_defaults_to_receipt_time() {
        let reading = parse("sensors/Rabat/RAB_1/humidity", "64.2").unwrap();
        assert_eq!(reading.value, 64.2);
        assert_eq!(reading.timestamp, received());

        let reading = parse("sensors/Rabat/RAB_1/humidity", r#"{"value": 64}"#).unwrap();
        assert_eq!(reading.timestamp, received());
    }

    #[test]
    fn test_parse_epoch_timestamp() {
        let reading = parse(
            "sensors/Rabat/RAB_1/humidity",
            r#"{"value": 1.0, "timestamp": 1709294400}"#,
        )
        .unwrap();
        assert_eq!(reading.timestamp, received());
    }

    #[test]
    fn test_parse_naive_iso_timestamp() {
        let reading = parse(
            "sensors/Casablanca/CAS_1/water_level",
            r#"{"value": 45.5, "unit": "cm", "timestamp": "2024-03-01T11:58:30.123456"}"#,
        )
        .unwrap();
        assert_eq!(reading.value, 45.5);
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 58, 30).unwrap() + Duration::microseconds(123_456)
        );
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let topic = "sensors/Casablanca/CAS_1/water_level";
        assert!(matches!(
            parse(topic, r#"{"value": 1.0, "timestamp": "2099-01-01T00:00:00Z"}"#),
            Err(TransportError::Malformed { .. })
        ));
        // Small clock drift is tolerated.
        assert!(parse(topic, r#"{"value": 1.0, "timestamp": "2024-03-01T12:04:00Z"}"#).is_ok());
    }

    #[test]
    fn test_future_reading_does_not_block_live_ones() {
        let stats = create_shared_stats();
        let buffer = Arc::new(RollingBuffer::new(600, 100));
        let ingestor = Ingestor::new(Topics::default(), Arc::clone(&buffer), Arc::clone(&stats));
        let topic = "sensors/Casablanca/CAS_1/water_level";

        assert_eq!(
            ingestor.handle_message_at(
                topic,
                br#"{"value": 99.0, "timestamp": "2099-01-01T00:00:00Z"}"#,
                received()
            ),
            MessageOutcome::Malformed
        );
        assert_eq!(
            ingestor.handle_message_at(topic, br#"{"value": 70.0}"#, received()),
            MessageOutcome::Accepted
        );
        assert_eq!(stats.snapshot().malformed_readings, 1);
        assert_eq!(buffer.reading_count(), 1);
    }

    #[test]
    fn test_malformed_payloads() {
        let topic = "sensors/Rabat/RAB_1/humidity";
        assert!(parse(topic, r#"{"value": "high"}"#).is_err());
        assert!(parse(topic, r#"{"reading": 3.0}"#).is_err());
        assert!(parse(topic, "not json").is_err());
        assert!(parse(topic, r#"[1, 2]"#).is_err());
        assert!(parse(topic, r#"{"value": 3.0, "sensor_id": "OTHER"}"#).is_err());
        assert!(parse(topic, r#"{"value": 3.0, "channel": "water_level"}"#).is_err());
        assert!(parse(topic, r#"{"value": 3.0, "timestamp": "yesterday"}"#).is_err());
        assert!(parse("sensors/Rabat/RAB_1/pressure", "3.0").is_err());
        assert!(parse("sensors/Rabat/humidity", "3.0").is_err());
    }

    #[test]
    fn test_ingestor_counts_outcomes() {
        let stats = create_shared_stats();
        let buffer = Arc::new(RollingBuffer::new(600, 100));
        let ingestor = Ingestor::new(Topics::default(), Arc::clone(&buffer), Arc::clone(&stats));
        let topic = "sensors/Casablanca/CAS_1/water_level";

        assert_eq!(
            ingestor.handle_message_at(topic, br#"{"value": 70.0}"#, received()),
            MessageOutcome::Accepted
        );
        assert_eq!(
            ingestor.handle_message_at(topic, br#"{"value": 71.0}"#, received()),
            MessageOutcome::LateOrDuplicate
        );
        assert_eq!(
            ingestor.handle_message_at(topic, br#"{"value": null}"#, received()),
            MessageOutcome::Malformed
        );

        let s = stats.snapshot();
        assert_eq!(s.readings_ingested, 1);
        assert_eq!(s.late_or_duplicate_readings, 1);
        assert_eq!(s.malformed_readings, 1);
        assert_eq!(buffer.reading_count(), 1);
    }
}
