//! Rolling per-(sensor, channel) windows of recent readings.
//!
//! Each key keeps a time-ordered, bounded-duration run of readings. Ingestion
//! takes the shard lock for one key only long enough to append and trim;
//! snapshots copy under a read lock. Nothing else ever runs under these locks.

use crate::transport::types::{Channel, SensorReading};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;

/// Why a reading was not stored.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("late or duplicate reading for {sensor_id}/{channel}: {timestamp} <= newest {newest}")]
    LateOrDuplicate {
        sensor_id: String,
        channel: Channel,
        timestamp: DateTime<Utc>,
        newest: DateTime<Utc>,
    },
}

type BufferKey = (String, Channel);

/// The retained readings for one key.
#[derive(Debug, Default)]
struct RollingWindow {
    readings: VecDeque<SensorReading>,
    /// Newest accepted timestamp; survives eviction so replays stay rejected
    newest: Option<DateTime<Utc>>,
}

impl RollingWindow {
    /// Drop readings strictly older than `cutoff`. Returns how many were removed.
    fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while self
            .readings
            .front()
            .is_some_and(|r| r.timestamp < cutoff)
        {
            self.readings.pop_front();
            removed += 1;
        }
        removed
    }
}

/// Per-key buffer status, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub sensor_id: String,
    pub channel: Channel,
    pub count: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Shared rolling buffer for every sensor channel.
pub struct RollingBuffer {
    windows: DashMap<BufferKey, RollingWindow>,
    retention: Duration,
    max_per_key: usize,
}

impl RollingBuffer {
    /// Create a buffer keeping `retention_secs` of history, at most `max_per_key` readings per key.
    pub fn new(retention_secs: u64, max_per_key: usize) -> Self {
        Self {
            windows: DashMap::new(),
            retention: Duration::seconds(retention_secs as i64),
            max_per_key: max_per_key.max(1),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Append a reading.
    ///
    /// A reading whose timestamp is not strictly newer than the newest one
    /// already accepted for its key is rejected and leaves the window untouched.
    pub fn ingest(&self, reading: SensorReading) -> Result<(), IngestError> {
        let key = (reading.sensor_id.clone(), reading.channel);
        let mut window = self.windows.entry(key).or_default();

        if let Some(newest) = window.newest {
            if reading.timestamp <= newest {
                return Err(IngestError::LateOrDuplicate {
                    sensor_id: reading.sensor_id,
                    channel: reading.channel,
                    timestamp: reading.timestamp,
                    newest,
                });
            }
        }

        let timestamp = reading.timestamp;
        window.readings.push_back(reading);
        window.newest = Some(timestamp);

        window.evict_before(timestamp - self.retention);
        while window.readings.len() > self.max_per_key {
            window.readings.pop_front();
        }

        Ok(())
    }

    /// Copy of the readings currently retained for a key.
    pub fn snapshot(&self, sensor_id: &str, channel: Channel) -> Vec<SensorReading> {
        self.snapshot_at(sensor_id, channel, Utc::now())
    }

    /// Copy of the readings for a key that are within the retention horizon at `now`.
    ///
    /// Readings stamped after `now` are left out.
    pub fn snapshot_at(
        &self,
        sensor_id: &str,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Vec<SensorReading> {
        let cutoff = now - self.retention;
        match self.windows.get(&(sensor_id.to_string(), channel)) {
            Some(window) => window
                .readings
                .iter()
                .filter(|r| r.timestamp >= cutoff && r.timestamp <= now)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop readings older than the retention horizon at `now` across all keys.
    ///
    /// Returns the number of readings removed.
    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        self.windows
            .iter_mut()
            .map(|mut entry| entry.value_mut().evict_before(cutoff))
            .sum()
    }

    /// Number of (sensor, channel) keys seen.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Total readings currently retained.
    pub fn reading_count(&self) -> usize {
        self.windows.iter().map(|w| w.readings.len()).sum()
    }

    /// Per-key status, sorted by sensor then channel.
    pub fn status(&self) -> Vec<KeyStatus> {
        let mut status: Vec<KeyStatus> = self
            .windows
            .iter()
            .map(|entry| {
                let (sensor_id, channel) = entry.key();
                KeyStatus {
                    sensor_id: sensor_id.clone(),
                    channel: *channel,
                    count: entry.readings.len(),
                    oldest: entry.readings.front().map(|r| r.timestamp),
                    newest: entry.newest,
                }
            })
            .collect();
        status.sort_by(|a, b| (&a.sensor_id, a.channel).cmp(&(&b.sensor_id, b.channel)));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn reading(offset_secs: i64, value: f64) -> SensorReading {
        SensorReading::new(
            "CAS_1",
            "Casablanca",
            Channel::WaterLevel,
            value,
            base() + Duration::seconds(offset_secs),
        )
    }

    #[test]
    fn test_ingest_and_snapshot() {
        let buffer = RollingBuffer::new(600, 1000);
        buffer.ingest(reading(0, 75.0)).unwrap();
        buffer.ingest(reading(180, 78.0)).unwrap();

        let snapshot = buffer.snapshot_at("CAS_1", Channel::WaterLevel, base() + Duration::seconds(300));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].value, 75.0);
        assert_eq!(snapshot[1].value, 78.0);

        assert!(buffer
            .snapshot_at("CAS_1", Channel::Humidity, base())
            .is_empty());
    }

    #[test]
    fn test_duplicate_and_late_rejected() {
        let buffer = RollingBuffer::new(600, 1000);
        buffer.ingest(reading(10, 1.0)).unwrap();
        buffer.ingest(reading(20, 2.0)).unwrap();

        let now = base() + Duration::seconds(60);
        let before = buffer.snapshot_at("CAS_1", Channel::WaterLevel, now);
        assert_eq!(before.len(), 2);

        let dup = buffer.ingest(reading(20, 99.0));
        assert!(matches!(dup, Err(IngestError::LateOrDuplicate { .. })));
        let late = buffer.ingest(reading(5, 99.0));
        assert!(matches!(late, Err(IngestError::LateOrDuplicate { .. })));

        let after = buffer.snapshot_at("CAS_1", Channel::WaterLevel, now);
        assert_eq!(before, after);
    }

    #[test]
    fn test_snapshot_sorted_and_within_horizon() {
        let buffer = RollingBuffer::new(600, 1000);
        // Shuffled arrival order: out-of-order readings are rejected.
        let offsets = [0, 30, 15, 90, 60, 700, 650, 1200, 1199, 1300];
        for (i, offset) in offsets.iter().enumerate() {
            let _ = buffer.ingest(reading(*offset, i as f64));
        }

        let now = base() + Duration::seconds(1400);
        let snapshot = buffer.snapshot_at("CAS_1", Channel::WaterLevel, now);
        assert!(!snapshot.is_empty());
        for pair in snapshot.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        let cutoff = now - buffer.retention();
        assert!(snapshot.iter().all(|r| r.timestamp >= cutoff));
    }

    #[test]
    fn test_snapshot_excludes_future_readings() {
        let buffer = RollingBuffer::new(600, 1000);
        buffer.ingest(reading(0, 70.0)).unwrap();
        buffer.ingest(reading(120, 72.0)).unwrap();

        let snapshot = buffer.snapshot_at("CAS_1", Channel::WaterLevel, base() + Duration::seconds(60));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].value, 70.0);
    }

    #[test]
    fn test_evict_keeps_watermark() {
        let buffer = RollingBuffer::new(60, 1000);
        buffer.ingest(reading(0, 1.0)).unwrap();
        buffer.ingest(reading(30, 2.0)).unwrap();

        let removed = buffer.evict(base() + Duration::seconds(1000));
        assert_eq!(removed, 2);
        assert_eq!(buffer.reading_count(), 0);

        // Replay of an evicted reading is still a duplicate.
        assert!(buffer.ingest(reading(30, 2.0)).is_err());
        assert!(buffer.ingest(reading(31, 3.0)).is_ok());
    }

    #[test]
    fn test_ingest_trims_by_age_and_count() {
        let buffer = RollingBuffer::new(100, 3);
        for i in 0..10 {
            buffer.ingest(reading(i * 10, i as f64)).unwrap();
        }
        let snapshot = buffer.snapshot_at("CAS_1", Channel::WaterLevel, base() + Duration::seconds(90));
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].value, 7.0);

        let buffer = RollingBuffer::new(25, 1000);
        for i in 0..10 {
            buffer.ingest(reading(i * 10, i as f64)).unwrap();
        }
        // Readings older than newest - 25s are dropped on ingest.
        assert_eq!(buffer.reading_count(), 3);
    }

    #[test]
    fn test_status() {
        let buffer = RollingBuffer::new(600, 1000);
        buffer.ingest(reading(0, 1.0)).unwrap();
        buffer
            .ingest(SensorReading::new("CAS_1", "Casablanca", Channel::Humidity, 80.0, base()))
            .unwrap();

        let status = buffer.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].channel, Channel::WaterLevel);
        assert_eq!(status[1].count, 1);
        assert_eq!(buffer.key_count(), 2);
    }

    #[test]
    fn test_concurrent_ingestion_unrelated_keys() {
        let buffer = Arc::new(RollingBuffer::new(3600, 10_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let r = SensorReading::new(
                            format!("S_{t}"),
                            "City",
                            Channel::Humidity,
                            i as f64,
                            base() + Duration::seconds(i),
                        );
                        buffer.ingest(r).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..4 {
            let snapshot =
                buffer.snapshot_at(&format!("S_{t}"), Channel::Humidity, base() + Duration::seconds(500));
            assert_eq!(snapshot.len(), 500);
        }
    }
}
