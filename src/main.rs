//! Hostbook - Replicated Server Registry Node
//!
//! Runs one cluster node: discovery, election, replication and the admin
//! HTTP API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hostbook::api::HttpServer;
use hostbook::config::HostbookConfig;
use hostbook::error::{Error, Result};
use hostbook::node::Node;

/// Hostbook - Replicated Server Registry Node
#[derive(Parser)]
#[command(name = "hostbook")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "hostbook.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging].level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Always elect this node as master
        #[arg(long)]
        manual_master: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "hostbook.toml")]
        output: PathBuf,

        /// IPv4 address of this node (detected at startup when omitted)
        #[arg(long)]
        address: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.clone().unwrap_or_else(|| {
        HostbookConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    });
    init_logging(&level);

    match cli.command {
        Commands::Start { manual_master } => run_start(&cli.config, manual_master),
        Commands::Init { output, address } => run_init(output, address),
        Commands::Validate => run_validate(&cli.config),
        Commands::Info => run_info(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the node and block until Ctrl+C
fn run_start(config_path: &Path, manual_master: bool) -> Result<()> {
    let mut config = HostbookConfig::from_file(config_path)?;
    if manual_master {
        config.cluster.manual_master = true;
    }

    tracing::info!("Starting hostbook node");
    tracing::info!("Config: {}", config_path.display());

    let api_config = config.api.clone();
    let node = Arc::new(Node::new(config)?);
    tracing::info!("Node address: {}", node.id());

    let stop = node.stop_signal();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Received shutdown signal");
            stop.stop();
        })
        .map_err(|e| Error::Internal(format!("Failed to install Ctrl+C handler: {}", e)))?;
    }

    node.start()?;

    let api = if api_config.enabled {
        Some(HttpServer::new(api_config, Arc::clone(&node)).spawn(stop.clone())?)
    } else {
        None
    };

    stop.wait();
    node.shutdown();

    if let Some(handle) = api {
        if handle.join().is_err() {
            tracing::warn!("HTTP API thread panicked");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Write a commented configuration file
fn run_init(output: PathBuf, address: Option<String>) -> Result<()> {
    let address_line = match address {
        Some(addr) => format!("address = \"{}\"", addr),
        None => "# address = \"192.168.1.10\"".to_string(),
    };

    let config_content = format!(r#"# Hostbook Configuration
# Generated configuration file

[node]
{address_line}
data_dir = "/var/lib/hostbook"

[cluster]
membership_port = 5005
# election_port = 5006
replication_port = 5007
broadcast_address = "255.255.255.255"
heartbeat_interval_ms = 2000
heartbeat_retries = 3
join_attempts = 3
join_interval_ms = 1000
election_cooldown_ms = 10000
manual_master = false

# Lower priority wins the election
# [[cluster.peers]]
# address = "192.168.1.10"
# priority = 1

[replication]
fetch_interval_ms = 1000
client_read_timeout_ms = 5000
connect_timeout_ms = 2000

[snapshot]
# directory = "/var/lib/hostbook/snapshots"
interval_ms = 30000

[poller]
interval_ms = 10000

[api]
enabled = true
bind_address = "127.0.0.1:8080"

[logging]
level = "info"
format = "pretty"
"#);

    // Refuse to write something we cannot read back
    HostbookConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure ports and peer priorities.");
    println!("Then start with: hostbook --config {} start", output.display());

    Ok(())
}

fn run_validate(config_path: &Path) -> Result<()> {
    match HostbookConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Address: {}", config.node.address.as_deref().unwrap_or("(detect)"));
            println!(
                "  Ports: membership {}, election {}, replication {}",
                config.cluster.membership_port,
                config.election_port(),
                config.cluster.replication_port
            );
            println!("  Peers: {}", config.cluster.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn run_info(config_path: &Path) -> Result<()> {
    let config = HostbookConfig::from_file(config_path)?;

    println!("Hostbook Node Information");
    println!("=========================");
    println!();
    println!("Address:          {}", config.node.address.as_deref().unwrap_or("(detect)"));
    println!("Data Directory:   {}", config.node.data_dir.display());
    println!("Snapshots:        {}", config.snapshot_dir().display());
    println!();
    println!("Cluster Configuration:");
    println!("  Membership:     udp/{}", config.cluster.membership_port);
    println!("  Election:       udp/{}", config.election_port());
    println!("  Replication:    tcp/{}", config.cluster.replication_port);
    println!("  Broadcast:      {}", config.cluster.broadcast_address);
    println!("  Heartbeat:      {} ms x {}", config.cluster.heartbeat_interval_ms, config.cluster.heartbeat_retries);
    println!("  Cooldown:       {} ms", config.cluster.election_cooldown_ms);
    println!("  Manual Master:  {}", config.cluster.manual_master);
    println!();
    println!("Peer Priorities:");
    if config.cluster.peers.is_empty() {
        println!("  (none, random draw)");
    }
    for peer in &config.cluster.peers {
        println!("  {:<16}{}", peer.address, peer.priority);
    }
    println!();
    println!("API:              {} (enabled: {})", config.api.bind_address, config.api.enabled);

    Ok(())
}
