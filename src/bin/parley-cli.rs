//! `parley-cli` — operational commands for a Parley node: run it in the
//! foreground, or validate/print its configuration without starting it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley::config::NetworkConfig;
use parley::mods::ModHost;
use parley::orchestrator::Network;

#[derive(Debug, Parser)]
#[command(name = "parley-cli", version, about = "Operate a Parley network node")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a node in the foreground and run until `Ctrl-C`.
    Run {
        /// Path to a YAML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Configuration-only operations; nothing is started.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Load and validate a configuration file without starting a node.
    Check {
        /// Path to a YAML configuration file.
        config: PathBuf,
    },
    /// Print one of the built-in presets as YAML.
    Show {
        /// Which preset to print.
        #[arg(value_enum, default_value = "development")]
        preset: Preset,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Preset {
    Development,
    Production,
    Testing,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("parley=info"))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run { config } => run(config).await,
        Command::Config(ConfigCommand::Check { config }) => check(&config),
        Command::Config(ConfigCommand::Show { preset }) => show(preset),
    }
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => NetworkConfig::load_from_file(&path).context("failed to load configuration")?,
        None => NetworkConfig::development(),
    };
    let mod_host = Arc::new(ModHost::build(&config));
    let network = Arc::new(Network::new(config, mod_host).context("failed to build network")?);
    network.start().await.context("failed to start network")?;
    println!("node {} running; press Ctrl-C to stop", network.node_id());
    tokio::signal::ctrl_c().await.context("failed to await Ctrl-C")?;
    network.shutdown().await;
    Ok(())
}

fn check(path: &PathBuf) -> Result<()> {
    NetworkConfig::load_from_file(path).context("configuration is invalid")?;
    println!("{} is valid", path.display());
    Ok(())
}

fn show(preset: Preset) -> Result<()> {
    let config = match preset {
        Preset::Development => NetworkConfig::development(),
        Preset::Production => NetworkConfig::production(),
        Preset::Testing => NetworkConfig::testing(),
    };
    let yaml = serde_yaml::to_string(&config).context("failed to render configuration")?;
    print!("{yaml}");
    Ok(())
}
