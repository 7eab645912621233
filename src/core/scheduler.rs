//! Fixed-interval aggregation.
//!
//! Each tick walks the registry, builds one feature vector per sensor, scores
//! it, stores the record and queues it for the dispatcher. Ticks never
//! overlap: a tick that is still running when the next one is due causes that
//! one to be skipped rather than queued.

use crate::core::buffer::RollingBuffer;
use crate::core::features::{compute_features, SensorWindows};
use crate::core::inference::{InferenceEngine, InferenceError, PredictionRecord};
use crate::core::store::PredictionStore;
use crate::external::registry::{SensorMetadata, SensorRegistry};
use crate::external::weather::{WeatherConditions, WeatherError, WeatherProvider};
use crate::telemetry::SharedStats;
use crate::transport::types::Channel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub sensors: usize,
    pub predictions: usize,
    pub model_unavailable: usize,
    pub queued: usize,
    pub evicted: usize,
}

/// Collaborators for an [`Aggregator`].
pub struct AggregatorParts {
    pub buffer: Arc<RollingBuffer>,
    pub registry: Arc<dyn SensorRegistry>,
    pub weather: Arc<dyn WeatherProvider>,
    pub engine: Arc<InferenceEngine>,
    pub store: Arc<PredictionStore>,
    pub dispatch: mpsc::Sender<PredictionRecord>,
    pub weather_timeout: Duration,
}

/// The tick body plus the state it carries between ticks.
pub struct Aggregator {
    buffer: Arc<RollingBuffer>,
    registry: Arc<dyn SensorRegistry>,
    weather: Arc<dyn WeatherProvider>,
    engine: Arc<InferenceEngine>,
    store: Arc<PredictionStore>,
    dispatch: mpsc::Sender<PredictionRecord>,
    weather_timeout: Duration,
    stats: SharedStats,
    last_sensors: Mutex<Vec<SensorMetadata>>,
    last_weather: Mutex<HashMap<String, WeatherConditions>>,
    running: AtomicBool,
}

/// Clears the running flag when a tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Aggregator {
    pub fn new(parts: AggregatorParts, stats: SharedStats) -> Self {
        Self {
            buffer: parts.buffer,
            registry: parts.registry,
            weather: parts.weather,
            engine: parts.engine,
            store: parts.store,
            dispatch: parts.dispatch,
            weather_timeout: parts.weather_timeout,
            stats,
            last_sensors: Mutex::new(Vec::new()),
            last_weather: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub async fn run_tick(&self) -> Option<TickReport> {
        self.run_tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`. Returns `None` if another tick is in progress.
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> Option<TickReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("Previous tick still running, skipping");
            self.stats.record_ticks_skipped(1);
            return None;
        }
        let _guard = TickGuard(&self.running);

        let mut report = TickReport {
            evicted: self.buffer.evict(now),
            ..TickReport::default()
        };

        let sensors = self.sensors().await;
        report.sensors = sensors.len();

        if !self.engine.is_loaded() {
            for sensor in &sensors {
                self.record_model_unavailable(&mut report, &sensor.sensor_id);
            }
            return Some(self.complete(report));
        }

        let mut weather_this_tick: HashMap<String, WeatherConditions> = HashMap::new();

        for sensor in &sensors {
            let weather = match weather_this_tick.get(&sensor.city) {
                Some(w) => *w,
                None => {
                    let w = self.weather_for(&sensor.city).await;
                    weather_this_tick.insert(sensor.city.clone(), w);
                    w
                }
            };

            let windows = SensorWindows {
                water_level: self.buffer.snapshot_at(&sensor.sensor_id, Channel::WaterLevel, now),
                humidity: self.buffer.snapshot_at(&sensor.sensor_id, Channel::Humidity, now),
                river_level: self.buffer.snapshot_at(&sensor.sensor_id, Channel::RiverLevel, now),
                soil_moisture: self
                    .buffer
                    .snapshot_at(&sensor.sensor_id, Channel::SoilMoisture, now),
            };
            let features = compute_features(&sensor.sensor_id, &sensor.city, now, &windows, &weather);

            let record = match self.engine.predict(&features) {
                Ok(record) => record,
                Err(InferenceError::ModelUnavailable) => {
                    self.record_model_unavailable(&mut report, &sensor.sensor_id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Prediction failed: {e}");
                    continue;
                }
            };

            tracing::debug!(
                "{}: p={:.3} {} (model {})",
                record.sensor_id,
                record.probability,
                record.risk_level,
                record.model_version
            );
            self.stats.record_prediction();
            report.predictions += 1;

            let store = Arc::clone(&self.store);
            let stored = record.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || store.append(stored)).await {
                tracing::error!("Prediction store write for {} panicked: {e}", record.sensor_id);
            }

            match self.dispatch.try_send(record) {
                Ok(()) => report.queued += 1,
                Err(TrySendError::Full(record)) => {
                    self.stats.record_dispatch_dropped(1);
                    tracing::warn!("Dispatch queue full, dropped record for {}", record.sensor_id);
                }
                Err(TrySendError::Closed(record)) => {
                    self.stats.record_dispatch_dropped(1);
                    tracing::warn!("Dispatcher stopped, dropped record for {}", record.sensor_id);
                }
            }
        }

        Some(self.complete(report))
    }

    fn record_model_unavailable(&self, report: &mut TickReport, sensor_id: &str) {
        self.stats.record_model_unavailable();
        report.model_unavailable += 1;
        tracing::warn!("Model unavailable, no prediction for {sensor_id}");
    }

    fn complete(&self, report: TickReport) -> TickReport {
        self.stats.record_tick_completed();
        tracing::info!(
            "Tick complete: {} sensors, {} predictions, {} without model",
            report.sensors,
            report.predictions,
            report.model_unavailable
        );
        report
    }

    /// Current registry snapshot, or the last good one if the registry fails.
    async fn sensors(&self) -> Vec<SensorMetadata> {
        match self.registry.list_active_sensors().await {
            Ok(sensors) => {
                let mut last = self.last_sensors.lock().unwrap_or_else(PoisonError::into_inner);
                *last = sensors.clone();
                sensors
            }
            Err(e) => {
                self.stats.record_registry_fallback();
                let last = self.last_sensors.lock().unwrap_or_else(PoisonError::into_inner);
                tracing::warn!(
                    "Registry unavailable ({e}), reusing last snapshot of {} sensors",
                    last.len()
                );
                last.clone()
            }
        }
    }

    /// Weather for a city: fresh, else last known good, else neutral.
    async fn weather_for(&self, city: &str) -> WeatherConditions {
        let fetched = match tokio::time::timeout(self.weather_timeout, self.weather.current(city)).await {
            Ok(result) => result,
            Err(_) => Err(WeatherError::Timeout(self.weather_timeout)),
        };

        let mut last = self.last_weather.lock().unwrap_or_else(PoisonError::into_inner);
        match fetched {
            Ok(weather) => {
                last.insert(city.to_string(), weather);
                weather
            }
            Err(e) => {
                self.stats.record_weather_fallback();
                let fallback = last.get(city).copied();
                tracing::warn!(
                    "Weather for {city} unavailable ({e}), using {}",
                    if fallback.is_some() { "last known values" } else { "neutral defaults" }
                );
                fallback.unwrap_or_else(WeatherConditions::neutral)
            }
        }
    }

    /// Tick every `interval` until shutdown.
    ///
    /// On shutdown an in-flight tick gets `deadline` to finish before it is abandoned.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        deadline: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("Aggregation every {}s", interval.as_secs_f64());

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let started = Instant::now();
            let tick = self.run_tick();
            tokio::pin!(tick);

            tokio::select! {
                _ = &mut tick => {}
                _ = shutdown.changed() => {
                    match tokio::time::timeout(deadline, &mut tick).await {
                        Ok(_) => tracing::info!("In-flight tick finished before shutdown"),
                        Err(_) => tracing::warn!("In-flight tick abandoned at shutdown deadline"),
                    }
                    break;
                }
            }

            let elapsed = started.elapsed();
            if elapsed > interval {
                let missed = (elapsed.as_nanos() / interval.as_nanos()) as u64;
                self.stats.record_ticks_skipped(missed);
                tracing::warn!(
                    "Tick took {:.1}s, skipping {missed} scheduled tick(s)",
                    elapsed.as_secs_f64()
                );
            }
        }

        tracing::info!("Scheduler stopped");
    }
}

/// Convenience for wiring: scheduler and dispatcher share the record queue.
pub fn dispatch_queue(
    capacity: usize,
) -> (mpsc::Sender<PredictionRecord>, mpsc::Receiver<PredictionRecord>) {
    mpsc::channel(capacity.max(1))
}
