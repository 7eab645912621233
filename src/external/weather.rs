//! Current weather per city.

use crate::config::WeatherConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Weather inputs to the feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherConditions {
    /// Rainfall over the last hour, mm
    pub rainfall: f64,
    /// Air temperature, °C
    pub temperature: f64,
    /// Wind speed, km/h
    pub wind_speed: f64,
}

impl WeatherConditions {
    /// Values used when a city has never had a successful fetch.
    pub fn neutral() -> Self {
        Self {
            rainfall: 0.0,
            temperature: 15.0,
            wind_speed: 0.0,
        }
    }
}

impl Default for WeatherConditions {
    fn default() -> Self {
        Self::neutral()
    }
}

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("weather request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("weather service returned status {0}")]
    Status(u16),
    #[error("weather request timed out after {0:?}")]
    Timeout(Duration),
    #[error("weather for '{0}' unavailable")]
    Unavailable(String),
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self, city: &str) -> Result<WeatherConditions, WeatherError>;
}

/// OpenWeatherMap current-weather client (metric units).
pub struct OpenWeatherProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct OwmResponse {
    main: OwmMain,
    #[serde(default)]
    wind: Option<OwmWind>,
    #[serde(default)]
    rain: Option<OwmRain>,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct OwmRain {
    #[serde(rename = "1h", default)]
    one_hour: Option<f64>,
}

impl OpenWeatherProvider {
    pub fn new(config: &WeatherConfig, api_key: impl Into<String>) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    async fn current(&self, city: &str) -> Result<WeatherConditions, WeatherError> {
        let url = format!("{}/data/2.5/weather", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("q", city), ("appid", self.api_key.as_str()), ("units", "metric")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(WeatherError::Status(response.status().as_u16()));
        }

        let body: OwmResponse = response.json().await?;
        Ok(WeatherConditions {
            rainfall: body.rain.and_then(|r| r.one_hour).unwrap_or(0.0),
            temperature: body.main.temp,
            // m/s to km/h
            wind_speed: body.wind.map(|w| w.speed * 3.6).unwrap_or(0.0),
        })
    }
}

/// Same conditions for every city.
#[derive(Debug, Clone, Copy)]
pub struct FixedWeather(pub WeatherConditions);

impl FixedWeather {
    pub fn neutral() -> Self {
        Self(WeatherConditions::neutral())
    }
}

#[async_trait]
impl WeatherProvider for FixedWeather {
    async fn current(&self, _city: &str) -> Result<WeatherConditions, WeatherError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> WeatherConfig {
        WeatherConfig {
            api_key: Some("secret".to_string()),
            base_url,
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_open_weather_parsing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .and(query_param("q", "Casablanca"))
            .and(query_param("units", "metric"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "main": {"temp": 17.5, "humidity": 80},
                "wind": {"speed": 5.0},
                "rain": {"1h": 12.3}
            })))
            .mount(&server)
            .await;

        let provider = OpenWeatherProvider::new(&config(server.uri()), "secret").unwrap();
        let weather = provider.current("Casablanca").await.unwrap();
        assert_eq!(weather.rainfall, 12.3);
        assert_eq!(weather.temperature, 17.5);
        assert!((weather.wind_speed - 18.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_open_weather_dry_day_and_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("q", "Rabat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "main": {"temp": 22.0}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("q", "Atlantis"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = OpenWeatherProvider::new(&config(server.uri()), "secret").unwrap();
        let weather = provider.current("Rabat").await.unwrap();
        assert_eq!(weather.rainfall, 0.0);
        assert_eq!(weather.wind_speed, 0.0);

        assert!(matches!(
            provider.current("Atlantis").await,
            Err(WeatherError::Status(404))
        ));
    }
}
