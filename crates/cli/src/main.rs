//! Meshlink CLI - Main Entry Point
//!
//! Keeps the local record of the user, clouds and instances, and drives
//! the WireGuard mesh and SSH tunnels built from it.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use meshlink_cli::commands::{self, cloud, init, instance, user, vpn};
use meshlink_cli::output;

/// Meshlink - WireGuard mesh between your workstation and cloud instances
#[derive(Parser)]
#[command(name = "meshlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "MESHLINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Store directory, overriding the configuration
    #[arg(long, env = "MESHLINK_STORE", global = true)]
    store: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local store
    Init(init::InitArgs),

    /// Manage the local user
    #[command(subcommand)]
    User(user::UserCommands),

    /// Manage cloud accounts
    #[command(subcommand)]
    Cloud(cloud::CloudCommands),

    /// Manage instances
    #[command(subcommand)]
    Instance(instance::InstanceCommands),

    /// Manage the mesh VPN
    #[command(subcommand)]
    Vpn(vpn::VpnCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let config_path = commands::resolve_config_path(cli.config.clone(), cli.store.as_deref());
    let mut config = meshlink_common::ClientConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    match cli.command {
        Commands::Init(args) => init::execute(args, &config, &config_path)?,
        Commands::User(cmd) => user::execute(cmd, &commands::open_env(config)?, cli.format).await?,
        Commands::Cloud(cmd) => cloud::execute(cmd, &commands::open_env(config)?, cli.format).await?,
        Commands::Instance(cmd) => {
            instance::execute(cmd, &commands::open_env(config)?, cli.format).await?
        }
        Commands::Vpn(cmd) => vpn::execute(cmd, &commands::open_env(config)?, cli.format).await?,
        Commands::Version => {
            println!("meshlink v{}", meshlink_common::VERSION);
            println!("  Target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
        }
    }

    Ok(())
}
