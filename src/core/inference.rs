//! Inference engine and model artifacts.
//!
//! An artifact bundles a classifier with the scaler it was trained against.
//! The engine holds the active artifact behind an `Arc`: a prediction clones
//! the reference once and runs entirely against that artifact, so a reload
//! that swaps the reference mid-tick never mixes scaler and weights from two
//! different versions.

use crate::core::features::{FeatureVector, FEATURE_COUNT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Probability at or above which risk is Medium.
pub const MEDIUM_THRESHOLD: f64 = 0.40;
/// Probability at or above which risk is High.
pub const HIGH_THRESHOLD: f64 = 0.70;

/// Discrete flood risk category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// `<0.40` Low, `[0.40, 0.70)` Medium, `>=0.70` High.
    pub fn from_probability(probability: f64) -> Self {
        if probability >= HIGH_THRESHOLD {
            RiskLevel::High
        } else if probability >= MEDIUM_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One prediction for one sensor at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub sensor_id: String,
    pub city: String,
    pub timestamp: DateTime<Utc>,
    /// Probability in [0, 1]
    pub probability: f64,
    pub risk_level: RiskLevel,
    pub model_version: String,
    pub features: FeatureVector,
}

impl PredictionRecord {
    /// Probability as a percentage rounded to one decimal.
    pub fn probability_percent(&self) -> f64 {
        (self.probability * 1000.0).round() / 10.0
    }
}

/// Errors loading an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid model artifact: {0}")]
    Invalid(String),
    #[error("no model artifact source configured")]
    NoSource,
}

/// Errors from [`InferenceEngine::predict`].
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no model artifact loaded")]
    ModelUnavailable,
    #[error("classifier produced a non-finite probability for {0}")]
    NonFinite(String),
}

/// A trained classifier over scaled features.
pub trait Classifier: Send + Sync {
    /// Probability of flooding, in [0, 1].
    fn predict_proba(&self, features: &[f64]) -> f64;

    /// Short name for diagnostics.
    fn kind(&self) -> &'static str;
}

/// Logistic regression: `sigmoid(w·x + b)`.
#[derive(Debug, Clone)]
pub struct LogisticClassifier {
    pub weights: Vec<f64>,
    pub intercept: f64,
}

impl Classifier for LogisticClassifier {
    fn predict_proba(&self, features: &[f64]) -> f64 {
        let z: f64 = self
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.intercept;
        1.0 / (1.0 + (-z).exp())
    }

    fn kind(&self) -> &'static str {
        "logistic"
    }
}

/// Weighted threshold rules over raw features, used when no trained model exists.
///
/// Points per factor: water level up to 40, rising water up to 20, rainfall
/// up to 20, river level up to 10, soil moisture up to 10.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedClassifier;

impl Classifier for RuleBasedClassifier {
    fn predict_proba(&self, features: &[f64]) -> f64 {
        let get = |i: usize| features.get(i).copied().unwrap_or(0.0);
        let water_level_avg = get(0);
        // cm per minute
        let water_level_rise = get(2) * 60.0;
        let rainfall = get(6);
        let river_level = get(9);
        let soil_moisture = get(10);

        let mut score: f64 = 0.0;

        score += if water_level_avg > 80.0 {
            40.0
        } else if water_level_avg > 60.0 {
            30.0
        } else if water_level_avg > 40.0 {
            15.0
        } else {
            0.0
        };

        score += if water_level_rise > 1.0 {
            20.0
        } else if water_level_rise > 0.5 {
            10.0
        } else {
            0.0
        };

        score += if rainfall > 30.0 {
            20.0
        } else if rainfall > 15.0 {
            10.0
        } else {
            0.0
        };

        score += if river_level > 70.0 {
            10.0
        } else if river_level > 50.0 {
            5.0
        } else {
            0.0
        };

        score += if soil_moisture > 80.0 {
            10.0
        } else if soil_moisture > 60.0 {
            5.0
        } else {
            0.0
        };

        score.min(100.0) / 100.0
    }

    fn kind(&self) -> &'static str {
        "rule_based"
    }
}

/// Always returns the same probability.
#[derive(Debug, Clone, Copy)]
pub struct ConstantClassifier(pub f64);

impl Classifier for ConstantClassifier {
    fn predict_proba(&self, _features: &[f64]) -> f64 {
        self.0
    }

    fn kind(&self) -> &'static str {
        "constant"
    }
}

/// Standard scaling: `(x - mean) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl FeatureScaler {
    /// A scaler that leaves features untouched.
    pub fn identity() -> Self {
        Self {
            mean: vec![0.0; FEATURE_COUNT],
            scale: vec![1.0; FEATURE_COUNT],
        }
    }

    pub fn transform(&self, features: &[f64]) -> Vec<f64> {
        features
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let mean = self.mean.get(i).copied().unwrap_or(0.0);
                let scale = match self.scale.get(i).copied() {
                    Some(s) if s != 0.0 => s,
                    _ => 1.0,
                };
                (x - mean) / scale
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ArtifactError> {
        if self.mean.len() != FEATURE_COUNT || self.scale.len() != FEATURE_COUNT {
            return Err(ArtifactError::Invalid(format!(
                "scaler must have {FEATURE_COUNT} entries, got mean={} scale={}",
                self.mean.len(),
                self.scale.len()
            )));
        }
        if self.mean.iter().chain(&self.scale).any(|v| !v.is_finite()) {
            return Err(ArtifactError::Invalid(
                "scaler entries must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// A loaded classifier plus its scaler. Immutable once built.
#[derive(Clone)]
pub struct ModelArtifact {
    pub classifier: Arc<dyn Classifier>,
    pub scaler: FeatureScaler,
    pub model_version: String,
    pub training_metrics: BTreeMap<String, f64>,
}

impl fmt::Debug for ModelArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelArtifact")
            .field("classifier", &self.classifier.kind())
            .field("model_version", &self.model_version)
            .field("training_metrics", &self.training_metrics)
            .finish()
    }
}

/// On-disk artifact layout.
#[derive(Debug, Serialize, Deserialize)]
struct ArtifactFile {
    model_version: String,
    #[serde(default)]
    scaler: Option<FeatureScaler>,
    classifier: ClassifierFile,
    #[serde(default)]
    training_metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClassifierFile {
    Logistic { weights: Vec<f64>, intercept: f64 },
    RuleBased,
}

impl ModelArtifact {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        scaler: FeatureScaler,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            classifier,
            scaler,
            model_version: model_version.into(),
            training_metrics: BTreeMap::new(),
        }
    }

    /// The threshold rules with an identity scaler.
    pub fn rule_based() -> Self {
        Self::new(
            Arc::new(RuleBasedClassifier),
            FeatureScaler::identity(),
            "rule-based-v1",
        )
    }

    /// Parse and validate an artifact document.
    pub fn from_json(json: &str) -> Result<Self, ArtifactError> {
        let file: ArtifactFile = serde_json::from_str(json)?;

        if file.model_version.trim().is_empty() {
            return Err(ArtifactError::Invalid("model_version is empty".to_string()));
        }

        let scaler = file.scaler.unwrap_or_else(FeatureScaler::identity);
        scaler.validate()?;

        let classifier: Arc<dyn Classifier> = match file.classifier {
            ClassifierFile::Logistic { weights, intercept } => {
                if weights.len() != FEATURE_COUNT {
                    return Err(ArtifactError::Invalid(format!(
                        "classifier must have {FEATURE_COUNT} weights, got {}",
                        weights.len()
                    )));
                }
                if !intercept.is_finite() || weights.iter().any(|w| !w.is_finite()) {
                    return Err(ArtifactError::Invalid(
                        "classifier weights must be finite".to_string(),
                    ));
                }
                Arc::new(LogisticClassifier { weights, intercept })
            }
            ClassifierFile::RuleBased => Arc::new(RuleBasedClassifier),
        };

        Ok(Self {
            classifier,
            scaler,
            model_version: file.model_version,
            training_metrics: file.training_metrics,
        })
    }

    /// Probability for a raw (unscaled) feature array.
    pub fn probability(&self, features: &[f64]) -> f64 {
        let scaled = self.scaler.transform(features);
        self.classifier.predict_proba(&scaled)
    }
}

/// Where artifacts come from.
pub trait ArtifactSource: Send + Sync {
    fn load(&self) -> Result<ModelArtifact, ArtifactError>;
}

/// Loads a JSON artifact from disk.
#[derive(Debug, Clone)]
pub struct FileArtifactSource {
    path: PathBuf,
}

impl FileArtifactSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArtifactSource for FileArtifactSource {
    fn load(&self) -> Result<ModelArtifact, ArtifactError> {
        let json = std::fs::read_to_string(&self.path)?;
        ModelArtifact::from_json(&json)
    }
}

/// Holds the active artifact and turns feature vectors into predictions.
pub struct InferenceEngine {
    active: RwLock<Option<Arc<ModelArtifact>>>,
    source: Option<Arc<dyn ArtifactSource>>,
}

impl InferenceEngine {
    /// An engine with nothing loaded yet.
    pub fn new(source: Option<Arc<dyn ArtifactSource>>) -> Self {
        Self {
            active: RwLock::new(None),
            source,
        }
    }

    /// An engine serving a fixed artifact.
    pub fn with_artifact(artifact: ModelArtifact) -> Self {
        let engine = Self::new(None);
        engine.install(artifact);
        engine
    }

    /// Load from the configured source and swap it in.
    ///
    /// On failure the previously active artifact stays in place.
    pub fn reload(&self) -> Result<Arc<ModelArtifact>, ArtifactError> {
        let source = self.source.as_ref().ok_or(ArtifactError::NoSource)?;
        let artifact = source.load()?;
        tracing::info!(
            "Loaded model artifact {} ({})",
            artifact.model_version,
            artifact.classifier.kind()
        );
        Ok(self.install(artifact))
    }

    /// Swap in a new artifact.
    pub fn install(&self, artifact: ModelArtifact) -> Arc<ModelArtifact> {
        let artifact = Arc::new(artifact);
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = Some(Arc::clone(&artifact));
        artifact
    }

    pub fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    pub fn model_version(&self) -> Option<String> {
        self.current().map(|a| a.model_version.clone())
    }

    /// Score one feature vector.
    pub fn predict(&self, features: &FeatureVector) -> Result<PredictionRecord, InferenceError> {
        let artifact = self.current().ok_or(InferenceError::ModelUnavailable)?;

        let probability = artifact.probability(&features.as_array());
        if !probability.is_finite() {
            return Err(InferenceError::NonFinite(features.sensor_id.clone()));
        }
        let probability = probability.clamp(0.0, 1.0);

        Ok(PredictionRecord {
            sensor_id: features.sensor_id.clone(),
            city: features.city.clone(),
            timestamp: features.timestamp,
            probability,
            risk_level: RiskLevel::from_probability(probability),
            model_version: artifact.model_version.clone(),
            features: features.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::{compute_features, SensorWindows};
    use crate::external::weather::WeatherConditions;
    use std::io::Write;

    fn vector() -> FeatureVector {
        compute_features(
            "CAS_1",
            "Casablanca",
            Utc::now(),
            &SensorWindows::default(),
            &WeatherConditions::neutral(),
        )
    }

    #[test]
    fn test_risk_thresholds() {
        assert_eq!(RiskLevel::from_probability(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_probability(0.39), RiskLevel::Low);
        assert_eq!(RiskLevel::from_probability(0.40), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_probability(0.699999), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_probability(0.70), RiskLevel::High);
        assert_eq!(RiskLevel::from_probability(1.0), RiskLevel::High);
    }

    #[test]
    fn test_predict_without_artifact() {
        let engine = InferenceEngine::new(None);
        assert!(matches!(
            engine.predict(&vector()),
            Err(InferenceError::ModelUnavailable)
        ));
        assert!(matches!(engine.reload(), Err(ArtifactError::NoSource)));
    }

    #[test]
    fn test_predict_with_constant_classifier() {
        let engine = InferenceEngine::with_artifact(ModelArtifact::new(
            Arc::new(ConstantClassifier(0.85)),
            FeatureScaler::identity(),
            "test-v1",
        ));
        let record = engine.predict(&vector()).unwrap();
        assert_eq!(record.probability, 0.85);
        assert_eq!(record.risk_level, RiskLevel::High);
        assert_eq!(record.model_version, "test-v1");
        assert_eq!(record.probability_percent(), 85.0);
    }

    #[test]
    fn test_rule_based_scoring() {
        let rules = RuleBasedClassifier;
        let mut features = [0.0; FEATURE_COUNT];
        assert_eq!(rules.predict_proba(&features), 0.0);

        features[0] = 85.0; // water level
        features[2] = 1.5 / 60.0; // 1.5 cm/min
        features[6] = 35.0; // rainfall
        features[9] = 75.0; // river
        features[10] = 85.0; // soil
        assert!((rules.predict_proba(&features) - 1.0).abs() < 1e-9);

        features[0] = 65.0;
        features[2] = 0.0;
        features[6] = 20.0;
        features[9] = 0.0;
        features[10] = 0.0;
        assert!((rules.predict_proba(&features) - 0.40).abs() < 1e-9);
    }

    #[test]
    fn test_scaler() {
        let scaler = FeatureScaler {
            mean: vec![10.0, 0.0],
            scale: vec![2.0, 0.0],
        };
        assert_eq!(scaler.transform(&[14.0, 3.0]), vec![2.0, 3.0]);
    }

    #[test]
    fn test_artifact_from_json() {
        let json = serde_json::json!({
            "model_version": "rf-2024-03",
            "scaler": {"mean": vec![0.0; FEATURE_COUNT], "scale": vec![1.0; FEATURE_COUNT]},
            "classifier": {"type": "logistic", "weights": vec![0.0; FEATURE_COUNT], "intercept": 0.0},
            "training_metrics": {"accuracy": 0.91}
        });
        let artifact = ModelArtifact::from_json(&json.to_string()).unwrap();
        assert_eq!(artifact.model_version, "rf-2024-03");
        assert_eq!(artifact.classifier.kind(), "logistic");
        assert_eq!(artifact.training_metrics["accuracy"], 0.91);
        assert!((artifact.probability(&[0.0; FEATURE_COUNT]) - 0.5).abs() < 1e-9);

        let rules = r#"{"model_version": "rules", "classifier": {"type": "rule_based"}}"#;
        assert_eq!(ModelArtifact::from_json(rules).unwrap().classifier.kind(), "rule_based");
    }

    #[test]
    fn test_artifact_validation() {
        let short = serde_json::json!({
            "model_version": "bad",
            "classifier": {"type": "logistic", "weights": [1.0, 2.0], "intercept": 0.0}
        });
        assert!(matches!(
            ModelArtifact::from_json(&short.to_string()),
            Err(ArtifactError::Invalid(_))
        ));
        assert!(matches!(
            ModelArtifact::from_json("{not json"),
            Err(ArtifactError::Parse(_))
        ));
    }

    #[test]
    fn test_reload_keeps_previous_on_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"model_version": "rules-v2", "classifier": {{"type": "rule_based"}}}}"#
        )
        .unwrap();

        let engine = InferenceEngine::new(Some(Arc::new(FileArtifactSource::new(file.path()))));
        assert!(!engine.is_loaded());
        engine.reload().unwrap();
        assert_eq!(engine.model_version().as_deref(), Some("rules-v2"));

        std::fs::write(file.path(), "garbage").unwrap();
        assert!(engine.reload().is_err());
        assert_eq!(engine.model_version().as_deref(), Some("rules-v2"));
    }

    #[test]
    fn test_in_flight_prediction_uses_one_artifact() {
        let engine = InferenceEngine::with_artifact(ModelArtifact::new(
            Arc::new(ConstantClassifier(0.2)),
            FeatureScaler::identity(),
            "v1",
        ));
        let held = engine.current().unwrap();
        engine.install(ModelArtifact::new(
            Arc::new(ConstantClassifier(0.9)),
            FeatureScaler::identity(),
            "v2",
        ));
        assert_eq!(held.model_version, "v1");
        assert_eq!(held.probability(&[0.0; FEATURE_COUNT]), 0.2);
        assert_eq!(engine.model_version().as_deref(), Some("v2"));
    }
}
