//! CLI Entry Point for plm-daq
//!
//! Provides command-line interface for:
//! - Running the acquisition loop with display, telemetry and recording
//! - Taking a single snapshot (`probe`) for bench checks
//! - Validating a configuration file
//!
//! # Usage
//!
//! Run against the configured hardware:
//! ```bash
//! plm-daq --config config/plm.toml run
//! ```
//!
//! Run the simulated rig and start recording right away:
//! ```bash
//! plm-daq --simulate run --record bench-test
//! ```
//!
//! While running, operator commands are read from stdin one per line
//! (`set voltage cathode 24`, `valve open`, `record stop`, ...). `quit` or Ctrl-C stops.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plm_daq::acquisition::CycleScheduler;
use plm_daq::config::{PlmConfig, DEFAULT_CONFIG_PATH};
use plm_daq::control::{ControlCommand, Controller};
use plm_daq::fanout::{
    spawn_bus_publisher, spawn_recorder, Alert, CsvRecordStore, DisplayReceiver, FanoutSink,
    MqttPublisher,
};
use plm_daq::logging;
use plm_daq::rig::PlmRig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "plm-daq")]
#[command(about = "Data acquisition and control for the PLM plasma rig", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated instruments instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the rig until Ctrl-C, reading operator commands from stdin
    Run {
        /// Start recording an experiment with this name
        #[arg(long)]
        record: Option<String>,
    },

    /// Take one snapshot and print it as JSON
    Probe,

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PlmConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run { record } => run(config, cli.simulate, record).await,
        Commands::Probe => probe(config, cli.simulate).await,
        Commands::CheckConfig => check_config(&config),
    }
}

async fn build_rig(config: &PlmConfig, simulate: bool) -> Arc<PlmRig> {
    if simulate {
        Arc::new(PlmRig::simulated(config))
    } else {
        Arc::new(PlmRig::connect(config).await)
    }
}

async fn run(config: PlmConfig, simulate: bool, record: Option<String>) -> Result<()> {
    println!("🚀 {}", config.application.name);
    println!(
        "Polling every {:?}{}",
        config.acquisition.read_interval,
        if simulate { " (simulated rig)" } else { "" }
    );

    let rig = build_rig(&config, simulate).await;
    let aggregator = Arc::new(rig.aggregator()?);
    info!(keys = ?aggregator.schema(), channels = aggregator.channel_count(), "acquisition schema");

    let sink = FanoutSink::new();
    let (recording, recorder_task) = spawn_recorder(
        Box::new(CsvRecordStore::new(config.storage.output_dir.clone())),
        config.storage.queue_capacity,
        sink.alert_sender(),
    );
    let mut sink = sink.with_recording(recording.clone());

    let bus_task = if config.bus.enabled {
        let publisher = MqttPublisher::new(config.bus.mqtt_settings());
        let (queue, task) =
            spawn_bus_publisher(publisher, config.bus.topics(), config.bus.queue_capacity);
        sink = sink.with_bus(queue);
        Some(task)
    } else {
        None
    };

    let display_task = tokio::spawn(show_snapshots(sink.subscribe_display()));
    let alert_task = tokio::spawn(show_alerts(sink.subscribe_alerts()));

    let sink = Arc::new(sink);
    let scheduler = CycleScheduler::new(
        Arc::clone(&aggregator),
        sink.clone(),
        config.acquisition.scheduler(),
    )?;
    let handle = scheduler.spawn();

    let controller = Controller::new(Arc::clone(&rig)).with_recording(recording.clone());
    if let Some(name) = record {
        let outcome = controller.apply(ControlCommand::RecordStart { name }).await?;
        println!("✅ {outcome}");
    }

    read_commands(&controller).await?;

    println!("Shutting down...");
    let stats = handle.stop().await?;
    if recording.is_recording() {
        recording.stop().await?;
    }

    // Dropping the last senders lets the consumer tasks drain and exit.
    drop(controller);
    drop(recording);
    drop(sink);
    recorder_task.await.context("recorder task")?;
    if let Some(task) = bus_task {
        task.await.context("bus publisher task")?;
    }
    display_task.await.context("display task")?;
    alert_task.abort();
    rig.shutdown().await;

    println!(
        "✅ {} cycles, {} overruns, slowest cycle {:?}",
        stats.cycles, stats.overruns, stats.max_elapsed
    );
    Ok(())
}

async fn read_commands(controller: &Controller) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    // Stdin closed (daemonized); keep running until Ctrl-C.
                    tokio::signal::ctrl_c().await.context("listening for Ctrl-C")?;
                    return Ok(());
                };
                let line = line.trim();
                match line {
                    "" => continue,
                    "quit" | "exit" => return Ok(()),
                    _ => match controller.apply_line(line).await {
                        Ok(outcome) => println!("✅ {outcome}"),
                        Err(err) => eprintln!("❌ {err}"),
                    },
                }
            }
        }
    }
}

async fn show_snapshots(mut display: DisplayReceiver) {
    while display.changed().await.is_ok() {
        let Some(snapshot) = display.borrow_and_update().clone() else {
            continue;
        };
        let faulted = snapshot.faulted_keys();
        info!(
            cycle = snapshot.cycle,
            instruments = ?snapshot.instrument_values(),
            thermocouples = ?snapshot.thermocouple_series(),
            faulted = ?faulted,
            "snapshot"
        );
    }
}

async fn show_alerts(mut alerts: broadcast::Receiver<Alert>) {
    loop {
        match alerts.recv().await {
            Ok(Alert::StorageFailure { message }) => {
                eprintln!("⚠️  Recording failure: {message}");
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                error!(missed, "alerts missed");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn probe(config: PlmConfig, simulate: bool) -> Result<()> {
    let rig = build_rig(&config, simulate).await;
    let snapshot = rig.aggregator()?.poll().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    rig.shutdown().await;
    Ok(())
}

fn check_config(config: &PlmConfig) -> Result<()> {
    println!("✅ Configuration is valid");
    println!();
    println!("Instrument keys:");
    for key in config.instrument_keys() {
        println!("  {key}");
    }
    if let Some(tc) = &config.instruments.thermocouples {
        println!("Thermocouple channels: {}", tc.channel_count());
    }
    println!();
    println!(
        "{}",
        toml::to_string_pretty(config).context("rendering effective configuration")?
    );
    Ok(())
}
