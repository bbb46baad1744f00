//! Spindle - distributed inference ring node
//!
//! Each node holds a contiguous range of transformer layers and
//! cooperates with LAN-discovered peers to execute inference by
//! forwarding intermediate tensors around the ring.
//!
//! ## Commands
//!
//! - `start` - run the node daemon
//! - `capabilities` - probe and print this device's capabilities
//! - `metrics` - show the persisted contribution snapshot
//! - `generate-config` - write a default configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spindle::{
    init_cli_logging, init_daemon_logging, ContributionSnapshot, DeviceCapabilities, EchoBackend,
    Node, NodeConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Spindle - peer-to-peer distributed inference node
#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(about = "Distributed inference ring node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node daemon
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "~/.spindle/node.toml")]
        config: String,

        /// Override the node identity
        #[arg(long)]
        node_id: Option<String>,

        /// Override the inbound RPC port
        #[arg(long)]
        rpc_port: Option<u16>,

        /// Override the UDP discovery port
        #[arg(long)]
        discovery_port: Option<u16>,

        /// Disable UDP discovery (static peers only)
        #[arg(long)]
        no_discovery: bool,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Probe and print this device's capabilities
    Capabilities,

    /// Show the persisted contribution snapshot
    Metrics,

    /// Write a default configuration file and exit
    GenerateConfig {
        /// Configuration file path
        #[arg(short, long, default_value = "~/.spindle/node.toml")]
        config: String,
    },
}

fn config_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

fn load_or_create_config(raw_path: &str) -> Result<NodeConfig> {
    let path = config_path(raw_path);
    if path.exists() {
        NodeConfig::load(&path).with_context(|| format!("loading {}", path.display()))
    } else {
        let config = NodeConfig::default();
        config
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!(
            "First run - created default configuration at {}",
            path.display()
        );
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            node_id,
            rpc_port,
            discovery_port,
            no_discovery,
            log_level,
        } => {
            init_daemon_logging(&log_level, None)?;

            let mut node_config = load_or_create_config(&config)?;
            if let Some(node_id) = node_id {
                node_config.node_id = node_id;
            }
            if let Some(rpc_port) = rpc_port {
                node_config.rpc_port = rpc_port;
            }
            if let Some(discovery_port) = discovery_port {
                node_config.discovery_port = discovery_port;
            }
            if no_discovery {
                node_config.enable_discovery = false;
            }

            let node = Node::new(node_config, Arc::new(EchoBackend::new()))?;
            node.start().await?;
            info!(node_id = %node.node_id(), "press ctrl-c to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("shutdown signal received");

            node.stop().await;
            node.meter().snapshot().display();
        }

        Commands::Capabilities => {
            init_cli_logging("warn")?;
            let capabilities = DeviceCapabilities::detect();
            println!("{}", serde_json::to_string_pretty(&capabilities)?);
        }

        Commands::Metrics => {
            init_cli_logging("warn")?;
            let path = ContributionSnapshot::default_path();
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("no snapshot at {}; has the node run?", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&contents)?;
            let snapshot: ContributionSnapshot =
                serde_json::from_value(value["snapshot"].clone())?;
            snapshot.display();
        }

        Commands::GenerateConfig { config } => {
            let path = config_path(&config);
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            let node_config = NodeConfig::default();
            node_config.save(&path)?;
            println!("Generated default configuration at {}", path.display());
        }
    }

    Ok(())
}
