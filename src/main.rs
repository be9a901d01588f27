//! CLI entry point for the IR alignment rig.
//!
//! ```bash
//! ir-align scan --rx-port /dev/ttyUSB1 # drive the real printer and IR link
//! ir-align simulate --auto            # full scan against simulated hardware
//! ir-align report data/2024-05-01_10-00-00_9600
//! ir-align config                     # print the effective configuration
//! ```
//!
//! While scanning, operator keys are read from stdin (one line at a time);
//! an empty line toggles the scan.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use ir_align::config::{RigConfig, DEFAULT_CONFIG_PATH};
use ir_align::data::report::EnvelopeReport;
use ir_align::data::table::SampleTable;
use ir_align::experiment::{operator_channel, OperatorCommand, OperatorSender, ScanDriver};
#[cfg(feature = "tokio_serial")]
use ir_align::hardware::ir_link::SerialIrLink;
#[cfg(feature = "tokio_serial")]
use ir_align::hardware::marlin::MarlinController;
use ir_align::hardware::mock::{ConeField, MockMotionStage, SimulatedIrLink};
#[cfg(feature = "tokio_serial")]
use ir_align::hardware::serial::log_available_ports;
use ir_align::hardware::{LinkTransport, MotionController};
use ir_align::tracing_init;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "ir-align")]
#[command(about = "Spiral scan alignment of an IR link on a G-code stage", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan with the printer and IR transceivers from the configuration
    #[cfg(feature = "tokio_serial")]
    Scan {
        /// Printer serial port (overrides `motion.port`)
        #[arg(long)]
        motion_port: Option<String>,

        /// IR receiver port (overrides `link.rx_port`)
        #[arg(long)]
        rx_port: Option<String>,

        /// IR transmitter port (overrides `link.tx_port`)
        #[arg(long)]
        tx_port: Option<String>,
    },

    /// Scan against a simulated stage and link
    Simulate {
        /// Seed for the simulated link noise
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Start right away and exit once the scan completes
        #[arg(long)]
        auto: bool,
    },

    /// Summarize a saved sample directory
    Report {
        /// Directory written by a scan
        dir: PathBuf,

        /// Score counted as a working link
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RigConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    tracing_init::init_from_config(&config)?;

    match cli.command {
        #[cfg(feature = "tokio_serial")]
        Commands::Scan {
            motion_port,
            rx_port,
            tx_port,
        } => {
            if let Some(port) = motion_port {
                config.motion.port = port;
            }
            if let Some(port) = rx_port {
                config.link.rx_port = port;
            }
            if let Some(port) = tx_port {
                config.link.tx_port = port;
            }
            scan(&config).await
        }
        Commands::Simulate { seed, auto } => simulate(&config, seed, auto).await,
        Commands::Report { dir, threshold } => {
            report(dir, threshold.unwrap_or(config.scan.continuation_threshold))
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

#[cfg(feature = "tokio_serial")]
async fn scan(config: &RigConfig) -> Result<()> {
    log_available_ports();

    let motion = MarlinController::open(
        &config.motion.port,
        config.motion.baud,
        config.marlin_settings(),
    )
    .await?;
    let link = SerialIrLink::open(
        &config.link.rx_port,
        &config.link.tx_port,
        config.link.speeds[0],
    )
    .await?;
    info!(
        printer = %config.motion.port,
        rx = %config.link.rx_port,
        tx = %config.link.tx_port,
        "hardware connected"
    );

    let (tx, rx) = operator_channel();
    spawn_keyboard_reader(tx);
    drive(ScanDriver::from_config(motion, link, config)?, rx).await
}

async fn simulate(config: &RigConfig, seed: u64, auto: bool) -> Result<()> {
    let stage = MockMotionStage::new(2.0);
    let field = ConeField::at(config.origin());
    let link = SimulatedIrLink::new(field, stage.head(), config.link.speeds[0], seed);
    info!(seed, apex = %config.origin(), "simulated rig ready");

    let (tx, rx) = operator_channel();
    if auto {
        // Closing the queue lets the driver return once the run is done.
        let _ = tx.send(OperatorCommand::ToggleScan);
        drop(tx);
    } else {
        spawn_keyboard_reader(tx);
    }
    drive(ScanDriver::from_config(stage, link, config)?, rx).await
}

async fn drive<M: MotionController, L: LinkTransport>(
    mut driver: ScanDriver<M, L>,
    mut rx: ir_align::experiment::OperatorReceiver,
) -> Result<()> {
    driver.initialize().await?;

    let outcome = tokio::select! {
        result = driver.run(&mut rx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    let shutdown = driver.shutdown().await;
    if let Some(path) = driver.last_saved() {
        println!("Samples saved to {}", path.display());
    }
    outcome?;
    shutdown?;
    Ok(())
}

fn report(dir: PathBuf, threshold: f64) -> Result<()> {
    let (store, histogram) = SampleTable::new(dir).load()?;
    print!("{}", EnvelopeReport::from_store(&store, threshold));

    if let Some(histogram) = histogram {
        let mut worst: Vec<(u8, u64)> = histogram.iter().filter(|(_, n)| *n > 0).collect();
        worst.sort_by(|a, b| b.1.cmp(&a.1));
        if !worst.is_empty() {
            println!("Most corrupted pattern bytes:");
            for (byte, count) in worst.into_iter().take(8) {
                println!("  0x{:02X}: {}", byte, count);
            }
        }
    }
    Ok(())
}

/// Forward stdin lines to the operator queue until stdin closes.
fn spawn_keyboard_reader(tx: OperatorSender) {
    println!("keys: <enter> start/pause, wasdqe jog, h home, l motors off, r origin, k snapshot, v report, x quit");
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    for command in OperatorCommand::parse_line(&line) {
                        if tx.send(command).is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    return;
                }
            }
        }
    });
}
