//! `stagectl`: operator CLI for Xeryon piezo stage controllers
//!
//! Provides command-line access to:
//! - serial port enumeration and controller discovery
//! - absolute moves, steps, homing and stop
//! - parameter inspection and editing
//! - live telemetry monitoring
//!
//! Controllers come from the `[[controllers]]` section of the configuration
//! file. When none are configured, the discovery ports are probed and every
//! responding controller becomes selectable by its derived name.
//!
//! # Usage
//!
//! ```bash
//! stagectl discover --json
//! stagectl move 2.5 --unit mm
//! stagectl --config bench.toml monitor --controller bench --axis X
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use stage_core::serial::{available_ports, SerialOpener};
use stage_daq::config::{StageConfig, DEFAULT_CONFIG_PATH};
use stage_daq::tracing_init::{self, parse_log_level, TracingConfig};
use stage_driver_xeryon::units::{from_encoder, to_encoder};
use stage_driver_xeryon::{
    discover_ports, Axis, Controller, ControllerRegistry, Unit, XeryonFactory,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "stagectl")]
#[command(about = "Command and monitor Xeryon piezo stage controllers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Controller and axis selection shared by the motion commands
#[derive(clap::Args, Clone)]
struct Target {
    /// Controller name (defaults to the only configured controller)
    #[arg(long)]
    controller: Option<String>,

    /// Axis letter on multi-axis controllers
    #[arg(long)]
    axis: Option<char>,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports reported by the OS
    Ports,

    /// Probe ports for controllers
    Discover {
        /// Ports to probe (defaults to the configured list, then every port)
        ports: Vec<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Move an axis to an absolute position and wait for arrival
    Move {
        /// Target position
        #[arg(allow_hyphen_values = true)]
        position: f64,

        /// Unit of the position (defaults to the axis display unit)
        #[arg(long)]
        unit: Option<Unit>,

        #[command(flatten)]
        target: Target,
    },

    /// Step an axis relative to its current position
    Step {
        /// Step size, negative to step backwards
        #[arg(allow_hyphen_values = true)]
        step: f64,

        /// Unit of the step (defaults to the axis display unit)
        #[arg(long)]
        unit: Option<Unit>,

        #[command(flatten)]
        target: Target,
    },

    /// Move an axis to its zero position
    Home {
        #[command(flatten)]
        target: Target,
    },

    /// Stop an axis, or every axis when none is given
    Stop {
        #[command(flatten)]
        target: Target,
    },

    /// Print the parameter set of an axis
    Params {
        #[command(flatten)]
        target: Target,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Set one parameter and send it to the controller
    SetParam {
        /// Parameter mnemonic, e.g. SSPD
        mnemonic: String,

        /// Value in parameter units
        #[arg(allow_hyphen_values = true)]
        value: f64,

        /// Persist all settings on the controller afterwards
        #[arg(long)]
        save: bool,

        #[command(flatten)]
        target: Target,
    },

    /// Print telemetry until interrupted
    Monitor {
        #[command(flatten)]
        target: Target,
    },
}

impl Commands {
    fn target(&self) -> Option<&Target> {
        match self {
            Commands::Move { target, .. }
            | Commands::Step { target, .. }
            | Commands::Home { target }
            | Commands::Stop { target }
            | Commands::Params { target, .. }
            | Commands::SetParam { target, .. }
            | Commands::Monitor { target } => Some(target),
            Commands::Ports | Commands::Discover { .. } => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    stage_driver_xeryon::link();

    let cli = Cli::parse();
    let config = StageConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;

    let mut tracing_config = TracingConfig::from_stage_config(&config).map_err(|e| anyhow!(e))?;
    if let Some(level) = &cli.log_level {
        tracing_config.level = parse_log_level(level).map_err(|e| anyhow!(e))?;
    }
    tracing_init::init(tracing_config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Discover { ports, json } => discover(&config, ports, json).await,
        command => run_on_controller(&config, command).await,
    }
}

fn list_ports() -> Result<()> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!(
            "{:<24} {:<16} {}",
            port.name,
            port.serial_number.as_deref().unwrap_or("-"),
            port.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn probe_list(config: &StageConfig, requested: Vec<String>) -> Result<Vec<String>> {
    if !requested.is_empty() {
        return Ok(requested);
    }
    if !config.discovery.ports.is_empty() {
        return Ok(config.discovery.ports.clone());
    }
    Ok(available_ports()?.into_iter().map(|p| p.name).collect())
}

async fn discover(config: &StageConfig, ports: Vec<String>, json: bool) -> Result<()> {
    let ports = probe_list(config, ports)?;
    let found = discover_ports(&SerialOpener, &ports, &config.discovery.options()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    if found.is_empty() {
        println!("No controllers found on {} port(s)", ports.len());
    }
    for controller in &found {
        println!(
            "{} on {} ({}, firmware {})",
            controller.name(),
            controller.port,
            controller.controller_type,
            controller.firmware.as_deref().unwrap_or("?")
        );
        for axis in &controller.axes {
            println!(
                "  {} {:<6} resolution {:>8} range {:.3}",
                axis.letter.map(String::from).unwrap_or_else(|| "-".into()),
                axis.model,
                axis.resolution,
                axis.range
            );
        }
    }
    Ok(())
}

/// Fill a registry from the enabled controller definitions, or from
/// discovery when none are configured.
async fn build_registry(config: &StageConfig) -> Result<ControllerRegistry> {
    let registry = ControllerRegistry::new();
    let definitions = config.enabled_controllers();

    if definitions.is_empty() {
        let ports = probe_list(config, Vec::new())?;
        let opener = Arc::new(SerialOpener);
        for found in discover_ports(opener.as_ref(), &ports, &config.discovery.options()).await {
            let controller = found.into_controller(opener.clone(), stage_core::dispatch::inline())?;
            registry.add_found(controller)?;
        }
    } else {
        for definition in definitions {
            let controller = XeryonFactory.build(definition.config.clone()).await?;
            registry.add_found(controller)?;
        }
    }
    Ok(registry)
}

fn pick_controller(registry: &ControllerRegistry, name: Option<&str>) -> Result<String> {
    if let Some(name) = name {
        return Ok(registry.get(name)?.name().to_string());
    }
    let found = registry.found();
    match found.as_slice() {
        [] => bail!("no controller configured or discovered"),
        [only] => Ok(only.name().to_string()),
        many => bail!(
            "several controllers available, pick one with --controller: {}",
            many.iter()
                .map(|c| c.name().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

async fn run_on_controller(config: &StageConfig, command: Commands) -> Result<()> {
    let target = command
        .target()
        .cloned()
        .ok_or_else(|| anyhow!("command does not address a controller"))?;
    let registry = build_registry(config).await?;

    let name = pick_controller(&registry, target.controller.as_deref())?;
    let controller = registry.start(&name).await?;
    tracing::info!(controller = %controller.display_name(), port = %controller.port(), "connected");

    let result = execute(&controller, target.axis, command).await;
    registry.stop_all().await;
    result
}

async fn execute(controller: &Arc<Controller>, letter: Option<char>, command: Commands) -> Result<()> {
    match command {
        Commands::Move { position, unit, .. } => {
            let axis = controller.axis(letter)?;
            let unit = unit.unwrap_or_else(|| axis.display_unit());
            let counts = to_encoder(position, unit, axis.resolution())?.round();
            if !counts.is_finite() {
                bail!("position {} {} is not a finite distance", position, unit);
            }
            let counts = counts as i64;
            let report = axis.set_dpos(counts).await?;
            println!(
                "Reached {} counts ({}) after {:.3} s",
                report.target,
                format_position(&axis, report.target, unit)?,
                report.delay.as_secs_f64()
            );
        }
        Commands::Step { step, unit, .. } => {
            let axis = controller.axis(letter)?;
            let unit = unit.unwrap_or_else(|| axis.display_unit());
            let report = axis.take_step(step, unit).await?;
            println!(
                "Stepped to {} after {:.3} s",
                format_position(&axis, report.target, unit)?,
                report.delay.as_secs_f64()
            );
        }
        Commands::Home { .. } => {
            let axis = controller.axis(letter)?;
            let report = axis.home().await?;
            println!("Home reached after {:.3} s", report.delay.as_secs_f64());
        }
        Commands::Stop { .. } => match letter {
            Some(_) => controller.axis(letter)?.stop().await?,
            None => controller.stop_all().await?,
        },
        Commands::Params { json, .. } => {
            let axis = controller.axis(letter)?;
            let report = controller.load_parameters_from_controller().await?;
            if !report.skipped.is_empty() {
                tracing::warn!(skipped = ?report.skipped, "some parameters did not answer");
            }
            let views = axis.parameters().views();
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                for view in views {
                    println!(
                        "{:<5} {:<28} {:>12} [{} .. {}]",
                        view.mnemonic, view.name, view.value, view.min, view.max
                    );
                }
            }
        }
        Commands::SetParam {
            mnemonic,
            value,
            save,
            ..
        } => {
            let axis = controller.axis(letter)?;
            let changed = axis.set_parameter(&mnemonic, value).await?;
            let applied = axis.parameters().require(&mnemonic)?.value();
            if changed {
                println!("{} = {}", mnemonic.to_ascii_uppercase(), applied);
            } else {
                println!("{} unchanged at {}", mnemonic.to_ascii_uppercase(), applied);
            }
            if save {
                axis.save_settings().await?;
            }
        }
        Commands::Monitor { .. } => monitor(controller.axis(letter)?).await?,
        Commands::Ports | Commands::Discover { .. } => {}
    }
    Ok(())
}

fn format_position(axis: &Axis, counts: i64, unit: Unit) -> Result<String> {
    let value = from_encoder(counts as f64, unit, axis.resolution())?;
    Ok(format!("{:.4} {}", value, unit))
}

async fn monitor(axis: Arc<Axis>) -> Result<()> {
    let unit = axis.display_unit();
    let mut snapshots = axis.subscribe();
    println!("Monitoring, press Ctrl-C to stop");

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = snapshots.borrow_and_update().clone();
                println!(
                    "EPOS {:>10} ({})  DPOS {:>10}  speed {:>9.3}  {}{}",
                    snap.epos,
                    format_position(&axis, snap.epos, unit)?,
                    snap.dpos,
                    snap.speed,
                    if snap.position_reached { "reached" } else { "moving" },
                    snap.info
                        .first()
                        .map(|m| format!("  [{}]", m.title))
                        .unwrap_or_default()
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
