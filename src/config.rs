//! Configuration for the flood-risk pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pub/sub broker connection
    pub broker: BrokerConfig,

    /// Interval between aggregation ticks
    #[serde(with = "duration_serde")]
    pub aggregation_interval: Duration,

    /// How long readings stay in the rolling buffer
    #[serde(with = "duration_serde")]
    pub retention: Duration,

    /// Hard cap on readings kept per (sensor, channel)
    pub max_readings_per_key: usize,

    /// Path of the flat JSON sensor list
    pub registry_path: PathBuf,

    /// Path of the model artifact
    pub model_path: PathBuf,

    /// Path for durable predictions and persisted counters
    pub data_path: PathBuf,

    /// Latest predictions kept in memory per sensor
    pub cache_per_sensor: usize,

    /// Records kept for durable-write retry
    pub retry_queue_capacity: usize,

    /// Capacity of the scheduler -> dispatcher queue
    pub dispatch_queue_capacity: usize,

    /// How long shutdown waits for an in-flight tick and the dispatch queue
    #[serde(with = "duration_serde")]
    pub shutdown_deadline: Duration,

    pub weather: WeatherConfig,

    pub explanation: ExplanationConfig,

    pub alerts: AlertConfig,

    /// Port for the HTTP read API (0 for random)
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("floodwatch");

        Self {
            broker: BrokerConfig::default(),
            aggregation_interval: Duration::from_secs(300), // 5 minutes
            retention: Duration::from_secs(600),
            max_readings_per_key: 1000,
            registry_path: data_dir.join("sensors.json"),
            model_path: data_dir.join("flood_model.json"),
            data_path: data_dir,
            cache_per_sensor: 100,
            retry_queue_capacity: 10_000,
            dispatch_queue_capacity: 256,
            shutdown_deadline: Duration::from_secs(10),
            weather: WeatherConfig::default(),
            explanation: ExplanationConfig::default(),
            alerts: AlertConfig::default(),
            server_port: 8080,
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("floodwatch")
            .join("config.json")
    }

    /// Directory holding the append-only prediction files.
    pub fn predictions_dir(&self) -> PathBuf {
        self.data_path.join("predictions")
    }

    /// File the counters persist to.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        std::fs::create_dir_all(self.predictions_dir())?;
        Ok(())
    }

    /// Reject configurations the pipeline cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker host is empty".to_string()));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker port is 0".to_string()));
        }
        if self.aggregation_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "aggregation interval must be positive".to_string(),
            ));
        }
        if self.retention < self.aggregation_interval {
            return Err(ConfigError::Invalid(format!(
                "retention ({}s) is shorter than the aggregation interval ({}s)",
                self.retention.as_secs(),
                self.aggregation_interval.as_secs()
            )));
        }
        if self.dispatch_queue_capacity == 0 || self.cache_per_sensor == 0 {
            return Err(ConfigError::Invalid(
                "queue and cache capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Broker connection and topic layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client id; generated from the hostname when unset
    pub client_id: Option<String>,
    #[serde(with = "duration_serde")]
    pub keep_alive: Duration,
    /// First reconnect delay, doubled on each failure
    #[serde(with = "duration_serde")]
    pub reconnect_initial: Duration,
    #[serde(with = "duration_serde")]
    pub reconnect_max: Duration,
    /// Readings arrive on `{sensor_prefix}/{city}/{sensor_id}/{channel}`
    pub sensor_prefix: String,
    /// Commands go to `{actuator_prefix}/{city}/{sensor_id}/pump`
    pub actuator_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            keep_alive: Duration::from_secs(60),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            sensor_prefix: "sensors".to_string(),
            actuator_prefix: "actuators".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Credentials, if both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// Weather collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// OpenWeatherMap key; without it the neutral default is used
    pub api_key: Option<String>,
    pub base_url: String,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openweathermap.org".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Explanation collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplanationConfig {
    /// Chat-completions key; without it only templated explanations are produced
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub language: String,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for ExplanationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4.1-mini".to_string(),
            language: "fr".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Alert collaborator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Notifier webhook; alerts are only logged when unset
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    /// Re-alert on sustained High after this many seconds
    pub cooldown_secs: Option<u64>,
}

impl AlertConfig {
    pub fn cooldown(&self) -> Option<Duration> {
        self.cooldown_secs.map(Duration::from_secs)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.aggregation_interval, Duration::from_secs(300));
        assert_eq!(config.retention, Duration::from_secs(600));
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.explanation.timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_short_retention() {
        let config = Config {
            retention: Duration::from_secs(60),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_missing_host() {
        let mut config = Config::default();
        config.broker.host = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"aggregation_interval": 60, "retention": 120, "broker": {"host": "mqtt.local"}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.aggregation_interval, Duration::from_secs(60));
        assert_eq!(config.broker.host, "mqtt.local");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.cache_per_sensor, 100);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.alerts.cooldown_secs = Some(1800);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.alerts.cooldown(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_credentials_need_both_halves() {
        let mut broker = BrokerConfig::default();
        assert!(broker.credentials().is_none());
        broker.username = Some("user".to_string());
        assert!(broker.credentials().is_none());
        broker.password = Some("secret".to_string());
        assert_eq!(broker.credentials(), Some(("user", "secret")));
    }
}
