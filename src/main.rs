//! fleetbus command-line client
//!
//! Watches topic patterns or publishes single messages through a resilient
//! session, mainly for operators checking a fleet broker by hand.

use clap::{Parser, Subcommand};
use fleetbus::observability::init_default_logging;
use fleetbus::transport::MqttTransport;
use fleetbus::{
    ConnectionEvent, HandlerResult, PublishOptions, QoS, Session, SessionConfig, SessionError,
};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const DEFAULT_CONFIG_PATHS: &[&str] = &["fleetbus.toml", "config/fleetbus.toml"];

/// Resilient publish/subscribe client for vending-fleet brokers
#[derive(Parser)]
#[command(name = "fleetbus")]
#[command(about = "Resilient publish/subscribe client for vending-fleet brokers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, overriding the configuration file
    #[arg(short, long, env = "FLEETBUS_BROKER_URL", value_name = "URL")]
    broker: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print messages matching the given patterns until interrupted
    Watch {
        #[arg(required = true, value_name = "PATTERN")]
        patterns: Vec<String>,

        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
    },
    /// Publish a single message
    Publish {
        topic: String,
        payload: String,

        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,

        #[arg(long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging() {
        eprintln!("Logging already initialized: {e}");
    }

    let config = match load_configuration(cli.config.as_deref(), cli.broker) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch { patterns, qos } => watch(config, patterns, qos_level(qos)).await,
        Commands::Publish {
            topic,
            payload,
            qos,
            retain,
        } => {
            let options = PublishOptions {
                qos: qos_level(qos),
                retained: retain,
            };
            publish(config, &topic, payload, options).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

// clap already restricts the range
fn qos_level(level: u8) -> QoS {
    QoS::try_from(level).unwrap_or_default()
}

fn load_configuration(path: Option<&Path>, broker: Option<String>) -> CliResult<SessionConfig> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            SessionConfig::load_from_file(path)?
        }
        None => match DEFAULT_CONFIG_PATHS.iter().map(Path::new).find(|p| p.exists()) {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                SessionConfig::load_from_file(path)?
            }
            None => {
                info!("No configuration file found, using defaults");
                SessionConfig::default()
            }
        },
    };

    if let Some(url) = broker {
        config.broker.url = url;
        config.validate()?;
    }

    Ok(config)
}

async fn watch(config: SessionConfig, patterns: Vec<String>, qos: QoS) -> CliResult<()> {
    let session = Session::new(config, MqttTransport::new())?;
    let exhausted = Arc::new(Notify::new());

    session.on_connection(|event| match event {
        ConnectionEvent::Connected => info!("Connected"),
        ConnectionEvent::Disconnected { reason } => warn!(reason = %reason, "Disconnected"),
    });

    let notify = exhausted.clone();
    session.on_error(move |error| {
        if matches!(error, SessionError::ReconnectExhausted { .. }) {
            notify.notify_one();
        }
    });

    for pattern in &patterns {
        session
            .subscribe(pattern, qos, |topic: &str, payload: &[u8]| -> HandlerResult {
                println!("{topic} {}", String::from_utf8_lossy(payload));
                Ok(())
            })
            .await?;
    }

    session.connect().await?;
    info!(client_id = %session.client_id(), patterns = ?patterns, "Watching");

    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Interrupted, shutting down");
        }
        _ = exhausted.notified() => {
            error!("Broker unreachable, giving up");
        }
    }

    session.disconnect().await;
    Ok(())
}

async fn publish(
    config: SessionConfig,
    topic: &str,
    payload: String,
    options: PublishOptions,
) -> CliResult<()> {
    let session = Session::new(config, MqttTransport::new())?;
    session.connect().await?;
    session.publish(topic, payload, options).await?;
    info!(topic = %topic, qos = %options.qos, retained = options.retained, "Published");
    session.disconnect().await;
    Ok(())
}

fn handle_config_command(config: &SessionConfig, show: bool) -> CliResult<()> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}
