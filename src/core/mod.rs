//! Core of the flood-risk pipeline.
//!
//! This module contains:
//! - The rolling buffer of recent readings
//! - Feature computation over a sensor's window
//! - Model artifacts and inference
//! - The prediction store
//! - The aggregation scheduler and the side-effect dispatcher

pub mod buffer;
pub mod dispatch;
pub mod features;
pub mod inference;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use buffer::{IngestError, KeyStatus, RollingBuffer};
pub use dispatch::{DispatchError, Dispatcher, DispatcherConfig, EscalationTracker};
pub use features::{compute_features, FeatureVector, SensorWindows, WindowStats, FEATURE_NAMES};
pub use inference::{
    ArtifactError, ArtifactSource, Classifier, FileArtifactSource, InferenceEngine,
    InferenceError, ModelArtifact, PredictionRecord, RiskLevel,
};
pub use scheduler::{Aggregator, AggregatorParts, TickReport};
pub use store::{AppendOutcome, CityRiskSummary, DurableSink, JsonlSink, PredictionStore};
