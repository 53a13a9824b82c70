//! Climate telemetry agent - main entry point

use climate_agent::agent::{AgentLifecycle, CycleOutcome, SendStatus};
use climate_agent::config::AgentConfig;
use climate_agent::error::AgentResult;
use climate_agent::observability::init_default_logging;
use climate_agent::sensor::{co2, Co2Sensor, IioEnvironmentSensor, SensorSource};
use climate_agent::transport::mqtt::MqttClient;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Device-side climate telemetry agent
#[derive(Parser)]
#[command(name = "climate-agent")]
#[command(about = "CO2, temperature, and humidity telemetry over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CLIMATE_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the measurement loop until SIGINT/SIGTERM
    Run {
        /// Run a single measurement cycle and exit
        #[arg(long)]
        once: bool,
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

    init_default_logging(cli.verbose > 0);

    info!("Starting climate agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { once } => run_agent(config, once).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&PathBuf>,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path.clone(),
        None => AgentConfig::find_default_path().ok_or(
            "No configuration file found. Provide one with -c/--config or create agent.toml",
        )?,
    };

    info!("Loading configuration from: {}", path.display());
    Ok(AgentConfig::load_from_file(&path)?)
}

/// Build the lifecycle with real sensors and the MQTT channel
fn build_agent(config: AgentConfig) -> AgentResult<AgentLifecycle<MqttClient>> {
    let port = co2::open_serial(&config.sensors)?;
    info!(
        port = %config.sensors.serial_port,
        baud_rate = config.sensors.baud_rate,
        "CO2 sensor serial port opened"
    );

    let source = SensorSource::new(
        IioEnvironmentSensor::from_config(&config.sensors),
        Co2Sensor::new(port),
    );
    let channel = MqttClient::new(&config.device.id, config.mqtt.clone())?;

    Ok(AgentLifecycle::new(config, channel, Box::new(source)))
}

async fn run_agent(config: AgentConfig, once: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Application starting with device ID: {}", config.device.id);

    let mut agent = build_agent(config)?;
    agent.start().await?;

    let run_result: Result<(), Box<dyn std::error::Error>> = if once {
        match agent.run_once().await {
            Ok(CycleOutcome::Skipped(e)) => Err(format!("Measurement cycle skipped: {e}").into()),
            Ok(CycleOutcome::DispatchFailed { seq, error }) => {
                Err(format!("Telemetry {seq} was not sent: {error}").into())
            }
            Ok(outcome) => match agent.drain().await {
                SendStatus::Idle => {
                    info!(outcome = ?outcome, "Single cycle complete");
                    Ok(())
                }
                SendStatus::Busy => Err(format!(
                    "Telemetry not confirmed before shutdown: pending {:?}",
                    agent.context().tracker.pending()
                )
                .into()),
            },
            Err(e) => Err(e.into()),
        }
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(signal_name) => info!("Received {}, shutting down gracefully...", signal_name),
                Err(e) => error!("Signal handler failed, shutting down: {}", e),
            }
            let _ = shutdown_tx.send(true);
        });

        info!("Agent is running");
        agent
            .run(shutdown_rx, None)
            .await
            .map(|cycles| info!(cycles = cycles, "Measurement loop stopped"))
            .map_err(Into::into)
    };

    info!("Application shutdown initiated");
    if let Err(e) = agent.shutdown().await {
        warn!("Error during shutdown: {}", e);
    }
    run_result
}

async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

fn handle_config_command(config: &AgentConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
