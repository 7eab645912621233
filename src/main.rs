//! Floodwatch CLI
//!
//! Flood-risk pipeline: sensor ingestion, rolling aggregation, inference
//! and alert dispatch.

use clap::{Parser, Subcommand};
use floodwatch_pipeline::{
    config::Config,
    core::{
        dispatch::{Dispatcher, DispatcherConfig},
        inference::{ArtifactSource, FileArtifactSource},
        store::{DurableSink, JsonlSink},
    },
    external::explain::Language,
    pipeline::{self, Collaborators},
    telemetry::{PipelineStats, SharedStats},
    transport::{
        ActuatorCommand, InMemoryTransport, Ingestor, MessageSource, MqttTransport, Topics,
        Transport,
    },
    RollingBuffer, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long a one-shot pump command keeps the broker connection open.
const PUMP_FLUSH_WAIT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "floodwatch")]
#[command(author = "Floodwatch")]
#[command(version = VERSION)]
#[command(about = "Flood-risk pipeline for networked water sensors", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until Ctrl+C
    Run {
        /// Use the in-process transport instead of the broker
        #[arg(long)]
        dry_run: bool,

        /// Do not start the HTTP read API
        #[arg(long)]
        no_server: bool,
    },

    /// Show counters from previous runs
    Status,

    /// Show configuration
    Config {
        /// Write the default configuration if no file exists yet
        #[arg(long)]
        init: bool,
    },

    /// Show stored predictions for a sensor, newest first
    History {
        sensor_id: String,

        /// Maximum number of records to show
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },

    /// Send a pump command to a sensor's actuator
    Pump {
        sensor_id: String,

        /// ON or OFF
        command: String,
    },

    /// Load the model artifact and describe it
    CheckModel,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "floodwatch_pipeline=info,floodwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::config_path);

    let result = match cli.command {
        Commands::Run { dry_run, no_server } => cmd_run(&config_path, dry_run, no_server),
        Commands::Status => {
            cmd_status(&config_path);
            Ok(())
        }
        Commands::Config { init } => cmd_config(&config_path, init),
        Commands::History { sensor_id, limit } => {
            cmd_history(&config_path, &sensor_id, limit);
            Ok(())
        }
        Commands::Pump { sensor_id, command } => cmd_pump(&config_path, &sensor_id, &command),
        Commands::CheckModel => {
            cmd_check_model(&config_path);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(path: &std::path::Path) -> Config {
    match Config::load_from(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load {path:?} ({e}), using defaults");
            Config::default()
        }
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn cmd_run(config_path: &std::path::Path, dry_run: bool, no_server: bool) -> anyhow::Result<()> {
    // A config that exists but does not parse is fatal here, unlike the read-only commands.
    let config = Config::load_from(config_path)?;
    config.validate()?;
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    println!("Floodwatch Pipeline v{VERSION}");
    println!();
    if dry_run {
        println!("  Transport: in-process (dry run)");
    } else {
        println!(
            "  Broker: {}:{}",
            config.broker.host, config.broker.port
        );
    }
    println!("  Tick interval: {}s", config.aggregation_interval.as_secs());
    println!("  Retention: {}s", config.retention.as_secs());
    println!("  Registry: {:?}", config.registry_path);
    println!("  Model: {:?}", config.model_path);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    runtime()?.block_on(async move {
        let stats: SharedStats = Arc::new(PipelineStats::with_persistence(config.stats_path()));
        let collaborators = Collaborators::from_config(&config)?;

        let (transport, source): (Arc<dyn Transport>, Box<dyn MessageSource>) = if dry_run {
            let (transport, source) = InMemoryTransport::new();
            (Arc::new(transport), Box::new(source))
        } else {
            let (transport, source) = MqttTransport::connect(&config.broker, Arc::clone(&stats));
            (Arc::new(transport), Box::new(source))
        };

        let handle = pipeline::start(&config, collaborators, transport, source, Arc::clone(&stats))?;

        #[cfg(feature = "server")]
        let server_shutdown = if no_server {
            None
        } else {
            let state = floodwatch_pipeline::server::ApiState::from_pipeline(&handle);
            let (addr, shutdown_tx) = floodwatch_pipeline::server::run(config.server_port, state).await?;
            println!("Read API: http://{addr}");
            Some(shutdown_tx)
        };
        #[cfg(not(feature = "server"))]
        if !no_server {
            eprintln!("Warning: read API not available (server feature not enabled at compile time)");
        }

        stop_rx.recv().await;
        println!();
        println!("Stopping pipeline...");

        #[cfg(feature = "server")]
        if let Some(shutdown_tx) = server_shutdown {
            let _ = shutdown_tx.send(());
        }

        handle.shutdown().await;

        if let Err(e) = stats.save() {
            eprintln!("Warning: Could not save pipeline counters: {e}");
        }

        println!();
        println!("{}", stats.summary());
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_status(config_path: &std::path::Path) {
    let config = load_config(config_path);

    println!("Floodwatch Pipeline Status");
    println!("==========================");
    println!();

    println!("Configuration:");
    println!("  Broker: {}:{}", config.broker.host, config.broker.port);
    println!("  Tick interval: {}s", config.aggregation_interval.as_secs());
    println!(
        "  Model artifact: {:?} ({})",
        config.model_path,
        if config.model_path.exists() { "present" } else { "missing" }
    );
    println!(
        "  Sensor registry: {:?} ({})",
        config.registry_path,
        if config.registry_path.exists() { "present" } else { "missing" }
    );
    println!();

    match PipelineStats::read_persisted(&config.stats_path()) {
        Ok(s) => {
            println!("Cumulative Statistics:");
            println!("  Readings ingested: {}", s.readings_ingested);
            println!("  Malformed readings: {}", s.malformed_readings);
            println!("  Late/duplicate readings: {}", s.late_or_duplicate_readings);
            println!("  Ticks completed: {}", s.ticks_completed);
            println!("  Ticks skipped: {}", s.ticks_skipped);
            println!("  Predictions made: {}", s.predictions_made);
            println!("  Model unavailable: {}", s.model_unavailable);
            println!("  Alerts sent: {}", s.alerts_sent);
            println!("  Alert failures: {}", s.alert_failures);
            println!("  Store write failures: {}", s.store_write_failures);
            println!("  Dispatch dropped: {}", s.dispatch_dropped);
        }
        Err(_) => println!("No previous run data found."),
    }
}

fn cmd_config(config_path: &std::path::Path, init: bool) -> anyhow::Result<()> {
    if init {
        if config_path.exists() {
            println!("Config file already exists: {config_path:?}");
        } else {
            Config::default().save_to(config_path)?;
            println!("Wrote default configuration to {config_path:?}");
        }
        println!();
    }

    let config = load_config(config_path);

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {config_path:?}");
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
    Ok(())
}

fn cmd_history(config_path: &std::path::Path, sensor_id: &str, limit: usize) {
    let config = load_config(config_path);
    let sink = JsonlSink::new(config.predictions_dir());

    let records = match sink.read_recent(sensor_id, limit) {
        Ok(records) => records,
        Err(e) => {
            eprintln!("Error reading predictions: {e}");
            std::process::exit(1);
        }
    };

    if records.is_empty() {
        println!("No predictions stored for {sensor_id}.");
        return;
    }

    println!("Predictions for {sensor_id} ({} shown)", records.len());
    println!();
    for record in &records {
        println!(
            "[{}] {:>5.1}%  {:<6}  {}  ({})",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.probability_percent(),
            record.risk_level,
            record.city,
            record.model_version
        );
    }
}

fn cmd_pump(config_path: &std::path::Path, sensor_id: &str, command: &str) -> anyhow::Result<()> {
    let command: ActuatorCommand = command.parse().map_err(anyhow::Error::msg)?;
    let config = load_config(config_path);
    let language: Language = config
        .explanation
        .language
        .parse()
        .unwrap_or_default();

    runtime()?.block_on(async {
        let stats: SharedStats = Arc::new(PipelineStats::new());
        let collaborators = Collaborators::from_config(&config)?;
        let topics = Topics::new(&config.broker.sensor_prefix, &config.broker.actuator_prefix);

        let (transport, source) = MqttTransport::connect(&config.broker, Arc::clone(&stats));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // The event loop only flushes the publish while it is being polled.
        let ingestor = Ingestor::new(
            topics.clone(),
            Arc::new(RollingBuffer::new(config.retention.as_secs(), 1)),
            Arc::clone(&stats),
        );
        let event_loop = tokio::spawn(Box::new(source).run(ingestor, shutdown_rx));

        let dispatcher = Dispatcher::new(
            DispatcherConfig {
                explainer: collaborators.explainer,
                language,
                explanation_timeout: config.explanation.timeout,
                alerts: collaborators.alerts,
                cooldown: config.alerts.cooldown(),
                transport: Arc::new(transport),
                topics,
                registry: collaborators.registry,
            },
            stats,
        );

        let result = dispatcher.control_actuator(sensor_id, command).await;
        if result.is_ok() {
            tokio::time::sleep(PUMP_FLUSH_WAIT).await;
        }
        let _ = shutdown_tx.send(true);
        let _ = event_loop.await;

        let message = result?;
        println!(
            "Sent {} to {sensor_id} at {}",
            message.command,
            message.timestamp.format("%H:%M:%S")
        );
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_check_model(config_path: &std::path::Path) {
    let config = load_config(config_path);
    let source = FileArtifactSource::new(config.model_path.clone());

    println!("Model artifact: {:?}", config.model_path);
    match source.load() {
        Ok(artifact) => {
            println!("  Version: {}", artifact.model_version);
            println!("  Classifier: {}", artifact.classifier.kind());
            if artifact.training_metrics.is_empty() {
                println!("  Training metrics: none recorded");
            } else {
                println!("  Training metrics:");
                for (name, value) in &artifact.training_metrics {
                    println!("    {name}: {value:.4}");
                }
            }
        }
        Err(e) => {
            eprintln!("  Could not load artifact: {e}");
            std::process::exit(1);
        }
    }
}
