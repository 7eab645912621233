//! Feature computation from rolling windows.
//!
//! This module turns a sensor's buffered readings plus the current weather
//! into the fixed-order vector the classifier expects. Channels a sensor does
//! not report are synthesized with fixed formulas, so the same input state
//! always yields the same vector.

use crate::external::weather::WeatherConditions;
use crate::transport::types::SensorReading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Number of classifier inputs.
pub const FEATURE_COUNT: usize = 11;

/// Classifier input order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "water_level_avg",
    "water_level_max",
    "water_level_slope",
    "humidity_avg",
    "humidity_max",
    "humidity_slope",
    "rainfall",
    "temperature",
    "wind_speed",
    "river_level",
    "soil_moisture",
];

/// Weight of the water level average in the river level proxy.
const RIVER_WATER_WEIGHT: f64 = 0.9;
/// Weight of rainfall (mm) in the river level proxy.
const RIVER_RAIN_WEIGHT: f64 = 0.5;
/// Rising water (per second) pushes the river proxy up.
const RIVER_SLOPE_WEIGHT: f64 = 600.0;
/// Weight of the humidity average in the soil moisture proxy.
const SOIL_HUMIDITY_WEIGHT: f64 = 0.6;
/// Weight of rainfall (mm) in the soil moisture proxy.
const SOIL_RAIN_WEIGHT: f64 = 1.2;

/// Aggregates over one channel's window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub avg: f64,
    pub max: f64,
    /// Least-squares slope of value against elapsed seconds
    pub slope: f64,
}

impl WindowStats {
    /// Compute stats over readings sorted by time. Empty windows give zeros.
    pub fn from_readings(readings: &[SensorReading]) -> Self {
        if readings.is_empty() {
            return Self::default();
        }

        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();

        Self {
            avg: values.iter().mean(),
            max: Statistics::max(values.iter()),
            slope: slope(readings),
        }
    }
}

/// Least-squares slope of value vs. seconds since the first reading.
///
/// Exactly 0 for fewer than two points or when every reading shares one timestamp.
pub fn slope(readings: &[SensorReading]) -> f64 {
    if readings.len() < 2 {
        return 0.0;
    }

    let t0 = readings[0].timestamp;
    let elapsed: Vec<f64> = readings
        .iter()
        .map(|r| (r.timestamp - t0).num_milliseconds() as f64 / 1000.0)
        .collect();
    let values: Vec<f64> = readings.iter().map(|r| r.value).collect();

    let var_t = elapsed.iter().variance();
    if !var_t.is_finite() || var_t == 0.0 {
        return 0.0;
    }

    elapsed.iter().covariance(values.iter()) / var_t
}

/// Buffered readings for one sensor at tick time.
#[derive(Debug, Clone, Default)]
pub struct SensorWindows {
    pub water_level: Vec<SensorReading>,
    pub humidity: Vec<SensorReading>,
    pub river_level: Vec<SensorReading>,
    pub soil_moisture: Vec<SensorReading>,
}

/// Classifier input for one sensor at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub sensor_id: String,
    pub city: String,
    pub timestamp: DateTime<Utc>,
    pub water_level_avg: f64,
    pub water_level_max: f64,
    pub water_level_slope: f64,
    pub humidity_avg: f64,
    pub humidity_max: f64,
    pub humidity_slope: f64,
    pub rainfall: f64,
    pub temperature: f64,
    pub wind_speed: f64,
    pub river_level: f64,
    pub soil_moisture: f64,
}

impl FeatureVector {
    /// Values in [`FEATURE_NAMES`] order.
    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.water_level_avg,
            self.water_level_max,
            self.water_level_slope,
            self.humidity_avg,
            self.humidity_max,
            self.humidity_slope,
            self.rainfall,
            self.temperature,
            self.wind_speed,
            self.river_level,
            self.soil_moisture,
        ]
    }
}

/// River level proxy (cm) for sensors without a river gauge.
pub fn synthesize_river_level(water: &WindowStats, rainfall: f64) -> f64 {
    (RIVER_WATER_WEIGHT * water.avg
        + RIVER_RAIN_WEIGHT * rainfall
        + RIVER_SLOPE_WEIGHT * water.slope.max(0.0))
    .clamp(0.0, 100.0)
}

/// Soil moisture proxy (%) for sensors without a soil probe.
pub fn synthesize_soil_moisture(humidity: &WindowStats, rainfall: f64) -> f64 {
    (SOIL_HUMIDITY_WEIGHT * humidity.avg + SOIL_RAIN_WEIGHT * rainfall).clamp(0.0, 100.0)
}

/// Build the feature vector for one sensor.
pub fn compute_features(
    sensor_id: &str,
    city: &str,
    timestamp: DateTime<Utc>,
    windows: &SensorWindows,
    weather: &WeatherConditions,
) -> FeatureVector {
    let water = WindowStats::from_readings(&windows.water_level);
    let humidity = WindowStats::from_readings(&windows.humidity);

    // Reported channels win over the proxies.
    let river_level = windows
        .river_level
        .last()
        .map(|r| r.value)
        .unwrap_or_else(|| synthesize_river_level(&water, weather.rainfall));
    let soil_moisture = windows
        .soil_moisture
        .last()
        .map(|r| r.value)
        .unwrap_or_else(|| synthesize_soil_moisture(&humidity, weather.rainfall));

    FeatureVector {
        sensor_id: sensor_id.to_string(),
        city: city.to_string(),
        timestamp,
        water_level_avg: water.avg,
        water_level_max: water.max,
        water_level_slope: water.slope,
        humidity_avg: humidity.avg,
        humidity_max: humidity.max,
        humidity_slope: humidity.slope,
        rainfall: weather.rainfall,
        temperature: weather.temperature,
        wind_speed: weather.wind_speed,
        river_level,
        soil_moisture,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::types::Channel;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn series(channel: Channel, points: &[(i64, f64)]) -> Vec<SensorReading> {
        points
            .iter()
            .map(|(secs, value)| {
                SensorReading::new("CAS_1", "Casablanca", channel, *value, base() + Duration::seconds(*secs))
            })
            .collect()
    }

    #[test]
    fn test_slope_edge_cases() {
        assert_eq!(slope(&[]), 0.0);
        assert_eq!(slope(&series(Channel::WaterLevel, &[(0, 42.0)])), 0.0);
        assert_eq!(slope(&series(Channel::WaterLevel, &[(0, 10.0), (1, 20.0)])), 10.0);
    }

    #[test]
    fn test_slope_least_squares() {
        // v = 2t + 5 exactly
        let readings = series(Channel::WaterLevel, &[(0, 5.0), (10, 25.0), (20, 45.0), (40, 85.0)]);
        assert!((slope(&readings) - 2.0).abs() < 1e-9);

        let falling = series(Channel::WaterLevel, &[(0, 50.0), (60, 40.0)]);
        assert!(slope(&falling) < 0.0);
    }

    #[test]
    fn test_window_stats() {
        let stats = WindowStats::from_readings(&series(Channel::WaterLevel, &[(0, 75.0), (180, 78.0)]));
        assert!((stats.avg - 76.5).abs() < 1e-9);
        assert_eq!(stats.max, 78.0);
        assert!(stats.slope > 0.0);

        assert_eq!(WindowStats::from_readings(&[]), WindowStats::default());
    }

    #[test]
    fn test_synthesis_is_deterministic_and_clamped() {
        let water = WindowStats {
            avg: 50.0,
            max: 60.0,
            slope: 0.01,
        };
        assert!((synthesize_river_level(&water, 10.0) - 56.0).abs() < 1e-9);
        assert_eq!(synthesize_river_level(&water, 10.0), synthesize_river_level(&water, 10.0));

        let falling = WindowStats { slope: -1.0, ..water };
        assert!((synthesize_river_level(&falling, 0.0) - 45.0).abs() < 1e-9);

        let flooded = WindowStats { avg: 100.0, max: 100.0, slope: 1.0 };
        assert_eq!(synthesize_river_level(&flooded, 100.0), 100.0);

        let humidity = WindowStats { avg: 80.0, max: 85.0, slope: 0.0 };
        assert!((synthesize_soil_moisture(&humidity, 5.0) - 54.0).abs() < 1e-9);
        assert_eq!(synthesize_soil_moisture(&humidity, 60.0), 100.0);
    }

    #[test]
    fn test_compute_features() {
        let windows = SensorWindows {
            water_level: series(Channel::WaterLevel, &[(0, 75.0), (180, 78.0)]),
            humidity: series(Channel::Humidity, &[(0, 80.0)]),
            river_level: Vec::new(),
            soil_moisture: series(Channel::SoilMoisture, &[(0, 30.0), (60, 35.0)]),
        };
        let weather = WeatherConditions {
            rainfall: 12.0,
            temperature: 18.0,
            wind_speed: 20.0,
        };

        let v = compute_features("CAS_1", "Casablanca", base(), &windows, &weather);
        assert!((v.water_level_avg - 76.5).abs() < 1e-9);
        assert_eq!(v.water_level_max, 78.0);
        assert!(v.water_level_slope > 0.0);
        assert_eq!(v.humidity_avg, 80.0);
        assert_eq!(v.humidity_slope, 0.0);
        assert_eq!(v.rainfall, 12.0);
        assert_eq!(v.soil_moisture, 35.0);

        let water = WindowStats::from_readings(&windows.water_level);
        assert_eq!(v.river_level, synthesize_river_level(&water, 12.0));

        let array = v.as_array();
        assert_eq!(array.len(), FEATURE_NAMES.len());
        assert_eq!(array[0], v.water_level_avg);
        assert_eq!(array[10], v.soil_moisture);
    }

    #[test]
    fn test_empty_windows_are_neutral() {
        let v = compute_features(
            "RAB_1",
            "Rabat",
            base(),
            &SensorWindows::default(),
            &WeatherConditions::neutral(),
        );
        assert_eq!(v.water_level_avg, 0.0);
        assert_eq!(v.water_level_max, 0.0);
        assert_eq!(v.water_level_slope, 0.0);
        assert_eq!(v.humidity_max, 0.0);
        assert_eq!(v.river_level, 0.0);
        assert_eq!(v.soil_moisture, 0.0);
        assert_eq!(v.temperature, 15.0);
    }
}
