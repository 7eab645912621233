//! Prediction store.
//!
//! Every record goes to the in-memory cache first, then to the durable sink.
//! A failed durable write parks the record in a bounded retry queue that is
//! flushed, in order, ahead of the next write and again at shutdown.

use crate::core::inference::{PredictionRecord, RiskLevel};
use crate::telemetry::SharedStats;
use chrono::Datelike;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Consecutive durable failures between escalated log lines.
const FAILURE_ESCALATION_EVERY: u64 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("prediction store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("prediction serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only durable storage for predictions.
pub trait DurableSink: Send + Sync {
    fn append(&self, record: &PredictionRecord) -> Result<(), StoreError>;

    /// Up to `limit` records for a sensor, newest first.
    fn read_recent(&self, sensor_id: &str, limit: usize) -> Result<Vec<PredictionRecord>, StoreError>;
}

/// JSON Lines files, one per sensor per month.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    dir: PathBuf,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_stem(sensor_id: &str) -> String {
        sensor_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    fn file_for(&self, record: &PredictionRecord) -> PathBuf {
        self.dir.join(format!(
            "{}_{:04}{:02}.jsonl",
            Self::file_stem(&record.sensor_id),
            record.timestamp.year(),
            record.timestamp.month()
        ))
    }

    /// Monthly files for a sensor, newest month first.
    fn files_for(&self, sensor_id: &str) -> Result<Vec<PathBuf>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", Self::file_stem(sensor_id));

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix(&prefix))
                    .and_then(|rest| rest.strip_suffix(".jsonl"))
                    .is_some_and(|month| month.len() == 6 && month.chars().all(|c| c.is_ascii_digit()))
            })
            .collect();
        files.sort();
        files.reverse();
        Ok(files)
    }
}

impl DurableSink for JsonlSink {
    fn append(&self, record: &PredictionRecord) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(record))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn read_recent(&self, sensor_id: &str, limit: usize) -> Result<Vec<PredictionRecord>, StoreError> {
        let mut records = Vec::new();

        for path in self.files_for(sensor_id)? {
            let file = std::fs::File::open(&path)?;
            let mut month: Vec<PredictionRecord> = Vec::new();
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PredictionRecord>(&line) {
                    // Distinct ids can share a file once sanitised.
                    Ok(record) if record.sensor_id == sensor_id => month.push(record),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Skipping bad line in {}: {e}", path.display()),
                }
            }

            month.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            records.extend(month);
            if records.len() >= limit {
                break;
            }
        }

        records.truncate(limit);
        Ok(records)
    }
}

/// Per-city rollup of each sensor's latest prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CityRiskSummary {
    pub city: String,
    pub total_sensors: usize,
    pub high_risk: usize,
    pub medium_risk: usize,
    pub low_risk: usize,
    pub avg_probability: f64,
    pub max_probability: f64,
}

/// What happened to an appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Written to durable storage.
    Durable,
    /// Cached and waiting in the retry queue.
    Queued,
}

/// Cache plus durable sink with retry.
pub struct PredictionStore {
    cache: DashMap<String, VecDeque<PredictionRecord>>,
    cache_per_sensor: usize,
    sink: Box<dyn DurableSink>,
    pending: Mutex<VecDeque<PredictionRecord>>,
    retry_capacity: usize,
    consecutive_failures: AtomicU64,
    stats: SharedStats,
}

impl PredictionStore {
    pub fn new(
        sink: Box<dyn DurableSink>,
        cache_per_sensor: usize,
        retry_capacity: usize,
        stats: SharedStats,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            cache_per_sensor: cache_per_sensor.max(1),
            sink,
            pending: Mutex::new(VecDeque::new()),
            retry_capacity: retry_capacity.max(1),
            consecutive_failures: AtomicU64::new(0),
            stats,
        }
    }

    /// Record one prediction.
    pub fn append(&self, record: PredictionRecord) -> AppendOutcome {
        {
            let mut cached = self.cache.entry(record.sensor_id.clone()).or_default();
            cached.push_back(record.clone());
            while cached.len() > self.cache_per_sensor {
                cached.pop_front();
            }
        }

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.drain_pending(&mut pending);

        if pending.is_empty() {
            match self.sink.append(&record) {
                Ok(()) => {
                    self.note_success();
                    return AppendOutcome::Durable;
                }
                Err(e) => self.note_failure(&e),
            }
        }

        self.enqueue(&mut pending, record);
        AppendOutcome::Queued
    }

    /// Retry parked records. Returns how many are still pending.
    pub fn flush(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.drain_pending(&mut pending);
        if !pending.is_empty() {
            tracing::error!(
                "{} prediction(s) could not be written to durable storage",
                pending.len()
            );
        }
        pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn drain_pending(&self, pending: &mut VecDeque<PredictionRecord>) {
        while let Some(record) = pending.front() {
            match self.sink.append(record) {
                Ok(()) => {
                    self.note_success();
                    pending.pop_front();
                }
                Err(e) => {
                    self.note_failure(&e);
                    break;
                }
            }
        }
    }

    fn enqueue(&self, pending: &mut VecDeque<PredictionRecord>, record: PredictionRecord) {
        if pending.len() >= self.retry_capacity {
            if let Some(dropped) = pending.pop_front() {
                self.stats.record_store_records_dropped(1);
                tracing::error!(
                    "Retry queue full, dropped prediction for {} at {}",
                    dropped.sensor_id,
                    dropped.timestamp
                );
            }
        }
        pending.push_back(record);
    }

    fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn note_failure(&self, error: &StoreError) {
        self.stats.record_store_write_failure();
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures % FAILURE_ESCALATION_EVERY == 0 {
            tracing::error!("Durable prediction write failed {failures} times in a row: {error}");
        } else {
            tracing::warn!("Durable prediction write failed: {error}");
        }
    }

    /// Most recent prediction for a sensor.
    pub fn latest(&self, sensor_id: &str) -> Option<PredictionRecord> {
        if let Some(cached) = self.cache.get(sensor_id) {
            if let Some(record) = cached.back() {
                return Some(record.clone());
            }
        }
        self.history(sensor_id, 1).into_iter().next()
    }

    /// Up to `limit` predictions for a sensor, newest first.
    pub fn history(&self, sensor_id: &str, limit: usize) -> Vec<PredictionRecord> {
        let cached: Vec<PredictionRecord> = self
            .cache
            .get(sensor_id)
            .map(|c| c.iter().rev().cloned().collect())
            .unwrap_or_default();

        if cached.len() >= limit {
            return cached.into_iter().take(limit).collect();
        }

        let durable = match self.sink.read_recent(sensor_id, limit) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Could not read prediction history for {sensor_id}: {e}");
                return cached;
            }
        };

        let seen: HashSet<_> = durable.iter().map(|r| r.timestamp).collect();
        let mut merged: Vec<PredictionRecord> = durable;
        merged.extend(cached.into_iter().filter(|r| !seen.contains(&r.timestamp)));
        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        merged.truncate(limit);
        merged
    }

    /// Rollup of the latest cached prediction per sensor, grouped by city.
    pub fn risk_summary(&self) -> Vec<CityRiskSummary> {
        let mut by_city: BTreeMap<String, Vec<PredictionRecord>> = BTreeMap::new();
        for entry in self.cache.iter() {
            if let Some(latest) = entry.value().back() {
                by_city
                    .entry(latest.city.clone())
                    .or_default()
                    .push(latest.clone());
            }
        }

        by_city
            .into_iter()
            .map(|(city, records)| {
                let count = |level: RiskLevel| records.iter().filter(|r| r.risk_level == level).count();
                let total: f64 = records.iter().map(|r| r.probability).sum();
                CityRiskSummary {
                    total_sensors: records.len(),
                    high_risk: count(RiskLevel::High),
                    medium_risk: count(RiskLevel::Medium),
                    low_risk: count(RiskLevel::Low),
                    avg_probability: total / records.len() as f64,
                    max_probability: records.iter().map(|r| r.probability).fold(0.0, f64::max),
                    city,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::{compute_features, SensorWindows};
    use crate::external::weather::WeatherConditions;
    use crate::telemetry::create_shared_stats;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn record(sensor_id: &str, city: &str, minutes: i64, probability: f64) -> PredictionRecord {
        PredictionRecord {
            sensor_id: sensor_id.to_string(),
            city: city.to_string(),
            timestamp: at(minutes),
            probability,
            risk_level: RiskLevel::from_probability(probability),
            model_version: "v1".to_string(),
            features: compute_features(
                sensor_id,
                city,
                at(minutes),
                &SensorWindows::default(),
                &WeatherConditions::neutral(),
            ),
        }
    }

    /// Sink that fails while the switch is on.
    struct FlakySink {
        failing: Arc<AtomicBool>,
        written: Arc<Mutex<Vec<PredictionRecord>>>,
    }

    impl DurableSink for FlakySink {
        fn append(&self, record: &PredictionRecord) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk unavailable")));
            }
            self.written.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn read_recent(&self, sensor_id: &str, limit: usize) -> Result<Vec<PredictionRecord>, StoreError> {
            let mut records: Vec<_> = self
                .written
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.sensor_id == sensor_id)
                .cloned()
                .collect();
            records.reverse();
            records.truncate(limit);
            Ok(records)
        }
    }

    #[test]
    fn test_jsonl_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("predictions"));

        sink.append(&record("CAS_1", "Casablanca", 0, 0.2)).unwrap();
        sink.append(&record("CAS_1", "Casablanca", 5, 0.5)).unwrap();
        sink.append(&record("RAB_1", "Rabat", 5, 0.9)).unwrap();
        // Next month lands in its own file.
        sink.append(&record("CAS_1", "Casablanca", 60 * 24 * 31, 0.8)).unwrap();

        assert!(dir.path().join("predictions/CAS_1_202403.jsonl").exists());
        assert!(dir.path().join("predictions/CAS_1_202404.jsonl").exists());

        let recent = sink.read_recent("CAS_1", 10).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].probability, 0.8);
        assert_eq!(recent[2].probability, 0.2);

        assert_eq!(sink.read_recent("CAS_1", 2).unwrap().len(), 2);
        assert!(sink.read_recent("NOPE", 10).unwrap().is_empty());
    }

    #[test]
    fn test_read_recent_keeps_ids_sharing_a_file_apart() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path());

        sink.append(&record("A_1", "Casablanca", 0, 0.2)).unwrap();
        sink.append(&record("A.1", "Casablanca", 5, 0.6)).unwrap();
        assert!(dir.path().join("A_1_202403.jsonl").exists());

        let dotted = sink.read_recent("A.1", 10).unwrap();
        assert_eq!(dotted.len(), 1);
        assert_eq!(dotted[0].sensor_id, "A.1");

        let underscored = sink.read_recent("A_1", 10).unwrap();
        assert_eq!(underscored.len(), 1);
        assert_eq!(underscored[0].sensor_id, "A_1");
    }

    #[test]
    fn test_cache_is_bounded_and_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = PredictionStore::new(Box::new(JsonlSink::new(dir.path())), 3, 10, create_shared_stats());

        for i in 0..5 {
            assert_eq!(
                store.append(record("CAS_1", "Casablanca", i * 5, i as f64 / 10.0)),
                AppendOutcome::Durable
            );
        }

        assert_eq!(store.latest("CAS_1").unwrap().timestamp, at(20));
        let cached = store.history("CAS_1", 3);
        assert_eq!(cached.len(), 3);
        assert_eq!(cached[0].timestamp, at(20));

        // Beyond the cache, history comes from the files.
        let all = store.history("CAS_1", 100);
        assert_eq!(all.len(), 5);
        assert_eq!(all[4].timestamp, at(0));
    }

    #[test]
    fn test_failed_writes_are_retried_in_order() {
        let failing = Arc::new(AtomicBool::new(true));
        let written = Arc::new(Mutex::new(Vec::new()));
        let stats = create_shared_stats();
        let store = PredictionStore::new(
            Box::new(FlakySink {
                failing: Arc::clone(&failing),
                written: Arc::clone(&written),
            }),
            100,
            100,
            Arc::clone(&stats),
        );

        assert_eq!(store.append(record("CAS_1", "Casablanca", 0, 0.1)), AppendOutcome::Queued);
        assert_eq!(store.append(record("CAS_1", "Casablanca", 5, 0.2)), AppendOutcome::Queued);
        assert_eq!(store.pending_count(), 2);
        // Cache still serves reads while the sink is down.
        assert_eq!(store.latest("CAS_1").unwrap().timestamp, at(5));
        assert!(stats.snapshot().store_write_failures >= 2);

        failing.store(false, Ordering::SeqCst);
        assert_eq!(store.append(record("CAS_1", "Casablanca", 10, 0.3)), AppendOutcome::Durable);
        assert_eq!(store.pending_count(), 0);

        let order: Vec<_> = written.lock().unwrap().iter().map(|r| r.timestamp).collect();
        assert_eq!(order, vec![at(0), at(5), at(10)]);
    }

    #[test]
    fn test_retry_queue_drops_oldest_when_full() {
        let failing = Arc::new(AtomicBool::new(true));
        let written = Arc::new(Mutex::new(Vec::new()));
        let stats = create_shared_stats();
        let store = PredictionStore::new(
            Box::new(FlakySink {
                failing: Arc::clone(&failing),
                written: Arc::clone(&written),
            }),
            100,
            2,
            Arc::clone(&stats),
        );

        for i in 0..4 {
            store.append(record("CAS_1", "Casablanca", i, 0.1));
        }
        assert_eq!(store.pending_count(), 2);
        assert_eq!(stats.snapshot().store_records_dropped, 2);

        failing.store(false, Ordering::SeqCst);
        assert_eq!(store.flush(), 0);
        let order: Vec<_> = written.lock().unwrap().iter().map(|r| r.timestamp).collect();
        assert_eq!(order, vec![at(2), at(3)]);
    }

    #[test]
    fn test_risk_summary() {
        let dir = tempfile::tempdir().unwrap();
        let store = PredictionStore::new(Box::new(JsonlSink::new(dir.path())), 10, 10, create_shared_stats());

        store.append(record("CAS_1", "Casablanca", 0, 0.1));
        store.append(record("CAS_1", "Casablanca", 5, 0.9));
        store.append(record("CAS_2", "Casablanca", 5, 0.5));
        store.append(record("RAB_1", "Rabat", 5, 0.2));

        let summary = store.risk_summary();
        assert_eq!(summary.len(), 2);

        let casa = &summary[0];
        assert_eq!(casa.city, "Casablanca");
        assert_eq!(casa.total_sensors, 2);
        assert_eq!(casa.high_risk, 1);
        assert_eq!(casa.medium_risk, 1);
        assert_eq!(casa.low_risk, 0);
        assert!((casa.avg_probability - 0.7).abs() < 1e-9);
        assert_eq!(casa.max_probability, 0.9);

        assert_eq!(summary[1].city, "Rabat");
    }
}
