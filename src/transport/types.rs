//! Typed readings and actuator commands.
//!
//! Nothing untyped crosses the transport boundary: a message either parses
//! into a [`SensorReading`] or is rejected as malformed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A measured quantity reported by a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    WaterLevel,
    Humidity,
    RiverLevel,
    SoilMoisture,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::WaterLevel,
        Channel::Humidity,
        Channel::RiverLevel,
        Channel::SoilMoisture,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::WaterLevel => "water_level",
            Channel::Humidity => "humidity",
            Channel::RiverLevel => "river_level",
            Channel::SoilMoisture => "soil_moisture",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown channel '{s}'"))
    }
}

/// One timestamped value from one sensor channel. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub city: String,
    pub channel: Channel,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    pub fn new(
        sensor_id: impl Into<String>,
        city: impl Into<String>,
        channel: Channel,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            city: city.into(),
            channel,
            value,
            timestamp,
        }
    }
}

/// Pump command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorCommand {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorCommand::On => f.write_str("ON"),
            ActuatorCommand::Off => f.write_str("OFF"),
        }
    }
}

impl FromStr for ActuatorCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(ActuatorCommand::On),
            "OFF" => Ok(ActuatorCommand::Off),
            other => Err(format!("invalid command '{other}', expected ON or OFF")),
        }
    }
}

/// Wire payload published on the actuator topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorMessage {
    pub command: ActuatorCommand,
    pub timestamp: DateTime<Utc>,
}

impl ActuatorMessage {
    pub fn new(command: ActuatorCommand) -> Self {
        Self {
            command,
            timestamp: Utc::now(),
        }
    }
}

/// Topic namespace for readings and actuator commands.
#[derive(Debug, Clone)]
pub struct Topics {
    sensor_prefix: String,
    actuator_prefix: String,
}

impl Topics {
    pub fn new(sensor_prefix: impl Into<String>, actuator_prefix: impl Into<String>) -> Self {
        Self {
            sensor_prefix: sensor_prefix.into(),
            actuator_prefix: actuator_prefix.into(),
        }
    }

    /// Filter covering every city, sensor and channel.
    pub fn subscription(&self) -> String {
        format!("{}/+/+/+", self.sensor_prefix)
    }

    pub fn reading(&self, city: &str, sensor_id: &str, channel: Channel) -> String {
        format!("{}/{city}/{sensor_id}/{channel}", self.sensor_prefix)
    }

    pub fn actuator(&self, city: &str, sensor_id: &str) -> String {
        format!("{}/{city}/{sensor_id}/pump", self.actuator_prefix)
    }

    /// Split a reading topic into (city, sensor_id, channel).
    pub fn parse_reading_topic<'a>(&self, topic: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
        let mut parts = topic.split('/');
        let prefix = parts.next()?;
        let city = parts.next()?;
        let sensor_id = parts.next()?;
        let channel = parts.next()?;

        if parts.next().is_some()
            || prefix != self.sensor_prefix
            || city.is_empty()
            || sensor_id.is_empty()
        {
            return None;
        }
        Some((city, sensor_id, channel))
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("sensors", "actuators")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!("water_level".parse::<Channel>().unwrap(), Channel::WaterLevel);
        assert_eq!(Channel::SoilMoisture.to_string(), "soil_moisture");
        assert!("pressure".parse::<Channel>().is_err());
    }

    #[test]
    fn test_actuator_command_wire_format() {
        let message = ActuatorMessage::new(ActuatorCommand::On);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["command"], "ON");
        assert!(json["timestamp"].as_str().is_some());

        assert_eq!("off".parse::<ActuatorCommand>().unwrap(), ActuatorCommand::Off);
        assert!("toggle".parse::<ActuatorCommand>().is_err());
    }

    #[test]
    fn test_topics() {
        let topics = Topics::default();
        assert_eq!(topics.subscription(), "sensors/+/+/+");
        assert_eq!(
            topics.reading("Casablanca", "CAS_1", Channel::Humidity),
            "sensors/Casablanca/CAS_1/humidity"
        );
        assert_eq!(topics.actuator("Casablanca", "CAS_1"), "actuators/Casablanca/CAS_1/pump");

        assert_eq!(
            topics.parse_reading_topic("sensors/Rabat/RAB_2/water_level"),
            Some(("Rabat", "RAB_2", "water_level"))
        );
        assert_eq!(topics.parse_reading_topic("sensors/Rabat/RAB_2"), None);
        assert_eq!(topics.parse_reading_topic("sensors/Rabat/RAB_2/x/y"), None);
        assert_eq!(topics.parse_reading_topic("actuators/Rabat/RAB_2/pump"), None);
        assert_eq!(topics.parse_reading_topic("sensors//RAB_2/humidity"), None);
    }
}
