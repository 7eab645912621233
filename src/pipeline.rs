//! Pipeline assembly and lifecycle.
//!
//! Three workers run side by side: the transport receive loop feeding the
//! buffer, the ticking scheduler, and the dispatcher draining the record
//! queue. All three watch one shutdown signal.

use crate::config::{Config, ConfigError};
use crate::core::buffer::RollingBuffer;
use crate::core::dispatch::{Dispatcher, DispatcherConfig};
use crate::core::inference::{ArtifactError, ArtifactSource, FileArtifactSource, InferenceEngine};
use crate::core::scheduler::{dispatch_queue, Aggregator, AggregatorParts};
use crate::core::store::{DurableSink, JsonlSink, PredictionStore};
use crate::external::alert::{AlertError, AlertSink, LogAlertSink, WebhookAlertSink};
use crate::external::explain::{ExplainError, Explainer, Language, OpenAiExplainer, TemplateExplainer};
use crate::external::registry::{FileRegistry, SensorRegistry};
use crate::external::weather::{FixedWeather, OpenWeatherProvider, WeatherError, WeatherProvider};
use crate::telemetry::SharedStats;
use crate::transport::types::Topics;
use crate::transport::{Ingestor, MessageSource, Transport};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Timeout for webhook alert delivery.
const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("weather client: {0}")]
    Weather(#[from] WeatherError),
    #[error("explanation client: {0}")]
    Explain(#[from] ExplainError),
    #[error("alert client: {0}")]
    Alert(#[from] AlertError),
    #[error("invalid explanation language: {0}")]
    Language(String),
}

/// External collaborators the pipeline runs against.
pub struct Collaborators {
    pub registry: Arc<dyn SensorRegistry>,
    pub weather: Arc<dyn WeatherProvider>,
    pub explainer: Arc<dyn Explainer>,
    pub alerts: Arc<dyn AlertSink>,
    pub artifacts: Option<Arc<dyn ArtifactSource>>,
    pub sink: Box<dyn DurableSink>,
}

impl Collaborators {
    /// Production collaborators as configured. Missing API keys select the offline fallbacks.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let weather: Arc<dyn WeatherProvider> = match config.weather.api_key {
            Some(ref key) => Arc::new(OpenWeatherProvider::new(&config.weather, key.clone())?),
            None => {
                tracing::info!("No weather API key configured, using neutral weather");
                Arc::new(FixedWeather::neutral())
            }
        };

        let explainer: Arc<dyn Explainer> = match config.explanation.api_key {
            Some(ref key) => Arc::new(OpenAiExplainer::new(&config.explanation, key.clone())?),
            None => {
                tracing::info!("No explanation API key configured, using templated explanations");
                Arc::new(TemplateExplainer)
            }
        };

        let alerts: Arc<dyn AlertSink> = match config.alerts.webhook_url {
            Some(ref url) => Arc::new(WebhookAlertSink::new(
                url.clone(),
                config.alerts.webhook_token.clone(),
                ALERT_TIMEOUT,
            )?),
            None => Arc::new(LogAlertSink),
        };

        Ok(Self {
            registry: Arc::new(FileRegistry::new(config.registry_path.clone())),
            weather,
            explainer,
            alerts,
            artifacts: Some(Arc::new(FileArtifactSource::new(config.model_path.clone()))),
            sink: Box::new(JsonlSink::new(config.predictions_dir())),
        })
    }
}

/// A running pipeline.
pub struct PipelineHandle {
    pub buffer: Arc<RollingBuffer>,
    pub engine: Arc<InferenceEngine>,
    pub store: Arc<PredictionStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: SharedStats,
    shutdown: watch::Sender<bool>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

/// Build every component and spawn the workers. Must be called inside a Tokio runtime.
pub fn start(
    config: &Config,
    collaborators: Collaborators,
    transport: Arc<dyn Transport>,
    source: Box<dyn MessageSource>,
    stats: SharedStats,
) -> Result<PipelineHandle, PipelineError> {
    config.validate()?;
    let language: Language = config
        .explanation
        .language
        .parse()
        .map_err(PipelineError::Language)?;
    let topics = Topics::new(&config.broker.sensor_prefix, &config.broker.actuator_prefix);

    let engine = Arc::new(InferenceEngine::new(collaborators.artifacts));
    match engine.reload() {
        Ok(_) | Err(ArtifactError::NoSource) => {}
        Err(e) => tracing::warn!("No model loaded ({e}); predictions paused until a reload succeeds"),
    }

    let buffer = Arc::new(RollingBuffer::new(
        config.retention.as_secs(),
        config.max_readings_per_key,
    ));
    let store = Arc::new(PredictionStore::new(
        collaborators.sink,
        config.cache_per_sensor,
        config.retry_queue_capacity,
        Arc::clone(&stats),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig {
            explainer: collaborators.explainer,
            language,
            explanation_timeout: config.explanation.timeout,
            alerts: collaborators.alerts,
            cooldown: config.alerts.cooldown(),
            transport,
            topics: topics.clone(),
            registry: Arc::clone(&collaborators.registry),
        },
        Arc::clone(&stats),
    ));

    let (queue_tx, queue_rx) = dispatch_queue(config.dispatch_queue_capacity);
    // The scheduler task owns the only sender; the dispatcher sees the queue close when it exits.
    let aggregator = Arc::new(Aggregator::new(
        AggregatorParts {
            buffer: Arc::clone(&buffer),
            registry: collaborators.registry,
            weather: collaborators.weather,
            engine: Arc::clone(&engine),
            store: Arc::clone(&store),
            dispatch: queue_tx,
            weather_timeout: config.weather.timeout,
        },
        Arc::clone(&stats),
    ));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let ingestor = Ingestor::new(topics, Arc::clone(&buffer), Arc::clone(&stats));

    let workers = vec![
        ("receive", tokio::spawn(source.run(ingestor, shutdown_rx.clone()))),
        (
            "scheduler",
            tokio::spawn(aggregator.run(
                config.aggregation_interval,
                shutdown_rx.clone(),
                config.shutdown_deadline,
            )),
        ),
        (
            "dispatcher",
            tokio::spawn(Arc::clone(&dispatcher).run(
                queue_rx,
                shutdown_rx,
                config.shutdown_deadline,
            )),
        ),
    ];

    tracing::info!(
        "Pipeline started: tick every {}s, retention {}s",
        config.aggregation_interval.as_secs(),
        config.retention.as_secs()
    );

    Ok(PipelineHandle {
        buffer,
        engine,
        store,
        dispatcher,
        stats,
        shutdown,
        workers,
    })
}

impl PipelineHandle {
    /// Stop intake, let the workers wind down, then flush the store.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down pipeline");
        let _ = self.shutdown.send(true);

        for (name, worker) in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("{name} worker failed: {e}");
            }
        }

        let pending = self.store.flush();
        tracing::info!(
            "Pipeline stopped ({} prediction(s) left unwritten)",
            pending
        );
    }
}
