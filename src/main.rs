//! CLI Entry Point for ghz-fpga
//!
//! Provides command-line access to a board group:
//! - `detect`: list the boards answering on the configured adapter
//! - `bringup`: calibrate all boards (or a selection) and print a report
//! - `pll`: show the PLL lock state of every board
//!
//! # Usage
//!
//! ```bash
//! ghz-fpga --config config/ghz-fpga.toml detect
//! ghz-fpga bringup --board "Lab DAC 1"
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use ghz_bringup::Bringup;
use ghz_driver_fpga::{BoardGroup, FpgaBoard};
use ghz_fpga::config::{GhzConfig, DEFAULT_CONFIG_PATH};
use ghz_fpga::{lab, tracing_setup};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ghz-fpga")]
#[command(about = "Detect, bring up and inspect GHz DAC/ADC FPGA boards", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List detected boards with their build numbers
    Detect,

    /// Run bring-up and print a per-board report
    Bringup {
        /// Device names to bring up (default: every board)
        #[arg(long = "board")]
        boards: Vec<String>,
    },

    /// Query PLL lock on every board
    Pll,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = GhzConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config
        .validate()
        .map_err(|e| anyhow!(e))
        .context("Invalid configuration")?;
    tracing_setup::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Detect => detect(&config).await,
        Commands::Bringup { boards } => bringup(&config, &boards).await,
        Commands::Pll => pll(&config).await,
    }
}

async fn detect(config: &GhzConfig) -> Result<ExitCode> {
    let ethernet = lab::open_ethernet(config).await?;
    let group = BoardGroup::new(ethernet, config.group_settings());
    let found = group.detect().await.context("Board detection failed")?;
    if found.is_empty() {
        println!("No boards found on port {}", config.transport.port);
    }
    for board in &found {
        println!("{:<16} {}  build {}", board.name, board.address.mac(), board.build);
    }
    Ok(ExitCode::SUCCESS)
}

async fn bringup(config: &GhzConfig, selection: &[String]) -> Result<ExitCode> {
    let group = lab::open_group(config).await?;
    let bringup = Bringup::new(config.bringup.clone());

    let report = if selection.is_empty() {
        bringup.bringup_group(&group).await
    } else {
        let mut boards = Vec::with_capacity(selection.len());
        for name in selection {
            match group.registry().find(name) {
                Some(board) => boards.push(board),
                None => bail!("Board '{}' is not connected", name),
            }
        }
        group.test_mode(|| bringup.bringup_boards(&boards)).await
    };
    print!("{}", report);

    group.shutdown().await.context("Failed to disconnect boards")?;
    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn pll(config: &GhzConfig) -> Result<ExitCode> {
    let group = lab::open_group(config).await?;
    let mut unlocked = 0;
    for board in group.registry().boards() {
        let driver = board.driver();
        match driver.query_pll().await {
            Ok(false) => println!("{:<16} locked", driver.name()),
            Ok(true) => {
                unlocked += 1;
                println!("{:<16} UNLOCKED", driver.name());
            }
            Err(e) => {
                unlocked += 1;
                println!("{:<16} error: {}", driver.name(), e);
            }
        }
    }
    group.shutdown().await.context("Failed to disconnect boards")?;
    Ok(if unlocked == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
