//! Read-only view of the known sensors.
//!
//! The registry is owned by whoever manages cities and sensors; the pipeline
//! only reads it, once per tick.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read sensor registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse sensor registry: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("sensor registry unavailable: {0}")]
    Unavailable(String),
}

fn default_active() -> bool {
    true
}

/// One registered sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMetadata {
    pub sensor_id: String,
    pub city: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

impl SensorMetadata {
    pub fn new(sensor_id: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            city: city.into(),
            active: true,
            lat: None,
            lon: None,
        }
    }
}

#[async_trait]
pub trait SensorRegistry: Send + Sync {
    /// Every sensor, active or not.
    async fn list_sensors(&self) -> Result<Vec<SensorMetadata>, RegistryError>;

    async fn list_active_sensors(&self) -> Result<Vec<SensorMetadata>, RegistryError> {
        Ok(self
            .list_sensors()
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect())
    }

    async fn find_sensor(&self, sensor_id: &str) -> Result<Option<SensorMetadata>, RegistryError> {
        Ok(self
            .list_sensors()
            .await?
            .into_iter()
            .find(|s| s.sensor_id == sensor_id))
    }
}

/// Flat JSON list of sensors on disk, re-read on every call so edits apply without restart.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SensorRegistry for FileRegistry {
    async fn list_sensors(&self) -> Result<Vec<SensorMetadata>, RegistryError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// In-memory registry.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    sensors: RwLock<Vec<SensorMetadata>>,
}

impl StaticRegistry {
    pub fn new(sensors: Vec<SensorMetadata>) -> Self {
        Self {
            sensors: RwLock::new(sensors),
        }
    }

    pub async fn set_sensors(&self, sensors: Vec<SensorMetadata>) {
        *self.sensors.write().await = sensors;
    }
}

#[async_trait]
impl SensorRegistry for StaticRegistry {
    async fn list_sensors(&self) -> Result<Vec<SensorMetadata>, RegistryError> {
        Ok(self.sensors.read().await.clone())
    }
}
