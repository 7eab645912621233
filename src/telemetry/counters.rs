//! Process-wide pipeline counters.
//!
//! Counters are plain atomics so the receive path can bump them without
//! taking a lock. They can be persisted to disk between runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the current process.
#[derive(Debug)]
pub struct PipelineStats {
    readings_ingested: AtomicU64,
    malformed_readings: AtomicU64,
    late_or_duplicate_readings: AtomicU64,
    transport_disconnects: AtomicU64,
    ticks_completed: AtomicU64,
    ticks_skipped: AtomicU64,
    predictions_made: AtomicU64,
    model_unavailable: AtomicU64,
    weather_fallbacks: AtomicU64,
    registry_fallbacks: AtomicU64,
    store_write_failures: AtomicU64,
    store_records_dropped: AtomicU64,
    alerts_sent: AtomicU64,
    alert_failures: AtomicU64,
    explanation_fallbacks: AtomicU64,
    dispatch_dropped: AtomicU64,
    actuator_commands: AtomicU64,
    /// Process start time
    started_at: DateTime<Utc>,
    /// Path for persisting counters
    persist_path: Option<PathBuf>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            readings_ingested: AtomicU64::new(0),
            malformed_readings: AtomicU64::new(0),
            late_or_duplicate_readings: AtomicU64::new(0),
            transport_disconnects: AtomicU64::new(0),
            ticks_completed: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            predictions_made: AtomicU64::new(0),
            model_unavailable: AtomicU64::new(0),
            weather_fallbacks: AtomicU64::new(0),
            registry_fallbacks: AtomicU64::new(0),
            store_write_failures: AtomicU64::new(0),
            store_records_dropped: AtomicU64::new(0),
            alerts_sent: AtomicU64::new(0),
            alert_failures: AtomicU64::new(0),
            explanation_fallbacks: AtomicU64::new(0),
            dispatch_dropped: AtomicU64::new(0),
            actuator_commands: AtomicU64::new(0),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create counters that continue from (and save back to) `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!("Could not load previous pipeline counters: {e}");
        }

        stats
    }

    pub fn record_reading_ingested(&self) {
        self.readings_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_reading(&self) {
        self.malformed_readings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_or_duplicate(&self) {
        self.late_or_duplicate_readings
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_disconnect(&self) {
        self.transport_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick_completed(&self) {
        self.ticks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ticks_skipped(&self, count: u64) {
        self.ticks_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_prediction(&self) {
        self.predictions_made.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_unavailable(&self) {
        self.model_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_weather_fallback(&self) {
        self.weather_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registry_fallback(&self) {
        self.registry_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_write_failure(&self) {
        self.store_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_records_dropped(&self, count: u64) {
        self.store_records_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_alert_sent(&self) {
        self.alerts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_failure(&self) {
        self.alert_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_explanation_fallback(&self) {
        self.explanation_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_dropped(&self, count: u64) {
        self.dispatch_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_actuator_command(&self) {
        self.actuator_commands.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            readings_ingested: self.readings_ingested.load(Ordering::Relaxed),
            malformed_readings: self.malformed_readings.load(Ordering::Relaxed),
            late_or_duplicate_readings: self.late_or_duplicate_readings.load(Ordering::Relaxed),
            transport_disconnects: self.transport_disconnects.load(Ordering::Relaxed),
            ticks_completed: self.ticks_completed.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            predictions_made: self.predictions_made.load(Ordering::Relaxed),
            model_unavailable: self.model_unavailable.load(Ordering::Relaxed),
            weather_fallbacks: self.weather_fallbacks.load(Ordering::Relaxed),
            registry_fallbacks: self.registry_fallbacks.load(Ordering::Relaxed),
            store_write_failures: self.store_write_failures.load(Ordering::Relaxed),
            store_records_dropped: self.store_records_dropped.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alert_failures: self.alert_failures.load(Ordering::Relaxed),
            explanation_fallbacks: self.explanation_fallbacks.load(Ordering::Relaxed),
            dispatch_dropped: self.dispatch_dropped.load(Ordering::Relaxed),
            actuator_commands: self.actuator_commands.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Pipeline Statistics:\n\
             - Readings ingested: {}\n\
             - Malformed readings dropped: {}\n\
             - Late/duplicate readings dropped: {}\n\
             - Transport disconnects: {}\n\
             - Ticks completed: {} (skipped: {})\n\
             - Predictions made: {}\n\
             - Model unavailable: {}\n\
             - Weather fallbacks: {}\n\
             - Registry fallbacks: {}\n\
             - Store write failures: {} (records dropped: {})\n\
             - Alerts sent: {} (failed: {}, explanation fallbacks: {})\n\
             - Dispatch records dropped: {}\n\
             - Actuator commands: {}\n\
             - Uptime: {} seconds",
            s.readings_ingested,
            s.malformed_readings,
            s.late_or_duplicate_readings,
            s.transport_disconnects,
            s.ticks_completed,
            s.ticks_skipped,
            s.predictions_made,
            s.model_unavailable,
            s.weather_fallbacks,
            s.registry_fallbacks,
            s.store_write_failures,
            s.store_records_dropped,
            s.alerts_sent,
            s.alert_failures,
            s.explanation_fallbacks,
            s.dispatch_dropped,
            s.actuator_commands,
            s.uptime_secs
        )
    }

    /// Save counters to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedStats {
                counters: self.snapshot(),
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load counters from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;
                let c = persisted.counters;

                self.readings_ingested
                    .store(c.readings_ingested, Ordering::Relaxed);
                self.malformed_readings
                    .store(c.malformed_readings, Ordering::Relaxed);
                self.late_or_duplicate_readings
                    .store(c.late_or_duplicate_readings, Ordering::Relaxed);
                self.transport_disconnects
                    .store(c.transport_disconnects, Ordering::Relaxed);
                self.ticks_completed
                    .store(c.ticks_completed, Ordering::Relaxed);
                self.ticks_skipped.store(c.ticks_skipped, Ordering::Relaxed);
                self.predictions_made
                    .store(c.predictions_made, Ordering::Relaxed);
                self.model_unavailable
                    .store(c.model_unavailable, Ordering::Relaxed);
                self.weather_fallbacks
                    .store(c.weather_fallbacks, Ordering::Relaxed);
                self.registry_fallbacks
                    .store(c.registry_fallbacks, Ordering::Relaxed);
                self.store_write_failures
                    .store(c.store_write_failures, Ordering::Relaxed);
                self.store_records_dropped
                    .store(c.store_records_dropped, Ordering::Relaxed);
                self.alerts_sent.store(c.alerts_sent, Ordering::Relaxed);
                self.alert_failures
                    .store(c.alert_failures, Ordering::Relaxed);
                self.explanation_fallbacks
                    .store(c.explanation_fallbacks, Ordering::Relaxed);
                self.dispatch_dropped
                    .store(c.dispatch_dropped, Ordering::Relaxed);
                self.actuator_commands
                    .store(c.actuator_commands, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Read persisted counters without creating a live instance.
    pub fn read_persisted(path: &std::path::Path) -> Result<StatsSnapshot, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedStats =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;
        Ok(persisted.counters)
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub readings_ingested: u64,
    pub malformed_readings: u64,
    pub late_or_duplicate_readings: u64,
    pub transport_disconnects: u64,
    pub ticks_completed: u64,
    pub ticks_skipped: u64,
    pub predictions_made: u64,
    pub model_unavailable: u64,
    pub weather_fallbacks: u64,
    pub registry_fallbacks: u64,
    pub store_write_failures: u64,
    pub store_records_dropped: u64,
    pub alerts_sent: u64,
    pub alert_failures: u64,
    pub explanation_fallbacks: u64,
    pub dispatch_dropped: u64,
    pub actuator_commands: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Counters format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    counters: StatsSnapshot,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared counters.
pub type SharedStats = Arc<PipelineStats>;

pub fn create_shared_stats() -> SharedStats {
    Arc::new(PipelineStats::new())
}
