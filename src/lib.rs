//! Floodwatch - flood-risk pipeline for networked water sensors.
//!
//! Readings arrive over a pub/sub transport, are held in a rolling
//! buffer, and are aggregated on a fixed tick into per-sensor feature
//! vectors. A classifier turns each vector into a flood probability and a
//! risk level; records are persisted and escalations to High trigger an
//! explanation and an alert.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Floodwatch Pipeline                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌───────────┐   │
//! │  │ Transport │──▶│  Rolling  │──▶│ Scheduler │──▶│ Inference │   │
//! │  │  (MQTT)   │   │  Buffer   │   │  (tick)   │   │  Engine   │   │
//! │  └───────────┘   └───────────┘   └─────┬─────┘   └───────────┘   │
//! │        ▲                               │                         │
//! │        │                               ▼                         │
//! │  ┌───────────┐   ┌───────────┐   ┌───────────┐                   │
//! │  │   Pump    │◀──│Dispatcher │◀──│Prediction │──▶ read API       │
//! │  │ commands  │   │ (alerts)  │   │  Store    │                   │
//! │  └───────────┘   └───────────┘   └───────────┘                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use floodwatch_pipeline::{pipeline, telemetry, transport, Config};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let (transport, source) = transport::InMemoryTransport::new();
//! let collaborators = pipeline::Collaborators::from_config(&config)?;
//!
//! let handle = pipeline::start(
//!     &config,
//!     collaborators,
//!     Arc::new(transport),
//!     Box::new(source),
//!     telemetry::create_shared_stats(),
//! )?;
//!
//! // ... later
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod external;
pub mod pipeline;
pub mod telemetry;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use core::{
    compute_features, Dispatcher, FeatureVector, InferenceEngine, ModelArtifact, PredictionRecord,
    PredictionStore, RiskLevel, RollingBuffer,
};
pub use pipeline::{Collaborators, PipelineError, PipelineHandle};
pub use telemetry::{PipelineStats, SharedStats, StatsSnapshot};
pub use transport::{ActuatorCommand, Channel, SensorReading};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
