//! HostbookCtl - Command line tool for a hostbook cluster
//!
//! Usage:
//!   hostbookctl status                 - Show local node status
//!   hostbookctl list                   - Show the server registry
//!   hostbookctl reserve <host> <user>  - Reserve a server
//!   hostbookctl release <host> <user>  - Release a server
//!   hostbookctl requests               - Show pending requests (master)
//!   hostbookctl resolve                - Acknowledge pending requests (master)
//!   hostbookctl promote                - Force this node to become master

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use hostbook::api::{ActionResponse, ErrorResponse, ReservationAction, ReservationRequest, SubmitResponse};
use hostbook::config::HostbookConfig;
use hostbook::node::{NodeStatus, Submitted};
use hostbook::registry::{StateSnapshot, UserRequest};

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";

/// Hostbook Cluster Control Tool
#[derive(Parser)]
#[command(name = "hostbookctl")]
#[command(about = "Control and monitor a hostbook cluster", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "hostbook.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the local node
    Status,
    /// List servers and their reservations
    List,
    /// Reserve a server
    Reserve {
        host: String,
        user: String,
        /// Free-form note stored with the reservation
        #[arg(short = 'm', long, default_value = "")]
        comment: String,
    },
    /// Release a server
    Release { host: String, user: String },
    /// Show requests awaiting review on the master
    Requests,
    /// Acknowledge and clear pending requests on the master
    Resolve,
    /// Force this node to become master
    Promote,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli.endpoint.clone().unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match cli.command {
        Commands::Status => show_status(&client, &endpoint).await,
        Commands::List => list_servers(&client, &endpoint).await,
        Commands::Reserve { host, user, comment } => {
            submit(&client, &endpoint, ReservationRequest {
                host,
                user,
                action: ReservationAction::Reserve,
                comment,
            })
            .await
        }
        Commands::Release { host, user } => {
            submit(&client, &endpoint, ReservationRequest {
                host,
                user,
                action: ReservationAction::Release,
                comment: String::new(),
            })
            .await
        }
        Commands::Requests => list_requests(&client, &endpoint).await,
        Commands::Resolve => resolve(&client, &endpoint).await,
        Commands::Promote => promote(&client, &endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Derive the API endpoint from the node's config, falling back to localhost
fn endpoint_from_config(path: &Path) -> String {
    if !path.exists() {
        return DEFAULT_ENDPOINT.to_string();
    }
    match HostbookConfig::from_file(path) {
        Ok(config) => {
            let addr = config.api.bind_address;
            match addr.strip_prefix("0.0.0.0:") {
                Some(port) => format!("http://127.0.0.1:{}", port),
                None => format!("http://{}", addr),
            }
        }
        Err(_) => DEFAULT_ENDPOINT.to_string(),
    }
}

/// Turn a non-success response into an error carrying the API's message
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ErrorResponse>().await {
        Ok(err) => bail!("{} ({})", err.error, err.code),
        Err(_) => bail!("API error: {}", status),
    }
}

// ============ Commands ============

async fn show_status(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client
        .get(format!("{}/status", endpoint))
        .send()
        .await
        .with_context(|| format!("cannot reach {}", endpoint))?;
    let status: NodeStatus = check(response).await?.json().await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Node:         {}", status.node_id);
    println!("Role:         {}", status.role);
    println!("Master:       {}", status.master.as_deref().unwrap_or("NONE"));
    println!("Epoch:        {}", status.epoch);
    if status.manual_master {
        println!("Manual:       yes");
    }
    if let Some(forced) = &status.override_master {
        println!("Override:     {}", forced);
    }
    println!("Active Peers: {}", status.active_peers.join(", "));
    println!("Servers:      {}", status.servers);
    println!("Pending:      {}", status.pending_requests);
    println!("Queued:       {}", status.queued_requests);
    if let Some(ts) = status.last_update {
        println!("Last Update:  {}", ts.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();

    Ok(())
}

async fn list_servers(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client.get(format!("{}/state", endpoint)).send().await?;
    let state: StateSnapshot = check(response).await?.json().await?;

    println!();
    println!("{:<20} {:<16} {:<10} {:<12} {:<16} {}", "HOST", "IP", "ENV", "STATUS", "RESERVED BY", "COMMENT");
    println!("{}", "-".repeat(90));

    for server in &state.registry.servers {
        // Pad before adding color codes
        let status_padded = format!("{:<12}", if server.available { "available" } else { "reserved" });
        let status_colored = if server.available {
            format!("\x1b[32m{}\x1b[0m", status_padded)
        } else {
            format!("\x1b[33m{}\x1b[0m", status_padded)
        };
        println!(
            "{:<20} {:<16} {:<10} {} {:<16} {}",
            server.host, server.ip, server.env, status_colored, server.reservation, server.comment
        );
    }
    println!();

    println!("Cluster:");
    for node in state.cluster_view.nodes() {
        println!("  {:<16} {}", node.peer_id, node.role);
    }
    println!();

    Ok(())
}

async fn submit(client: &reqwest::Client, endpoint: &str, request: ReservationRequest) -> Result<()> {
    let verb = match request.action {
        ReservationAction::Reserve => "Reservation",
        ReservationAction::Release => "Release",
    };
    let host = request.host.clone();

    let response = client
        .post(format!("{}/requests", endpoint))
        .json(&request)
        .send()
        .await?;
    let result: SubmitResponse = check(response).await?.json().await?;

    match result.outcome {
        Submitted::Applied => println!("{} of {} applied", verb, host),
        Submitted::Forwarded => println!("{} of {} forwarded to the master", verb, host),
    }
    Ok(())
}

fn print_requests(requests: &[UserRequest]) {
    if requests.is_empty() {
        println!("No pending requests");
        return;
    }
    println!("{:<20} {:<20} {:<8} {:<16} {}", "TIME", "HOST", "ACTION", "USER", "FROM");
    println!("{}", "-".repeat(80));
    for req in requests {
        println!(
            "{:<20} {:<20} {:<8} {:<16} {}",
            req.timestamp.format("%Y-%m-%d %H:%M:%S"),
            req.host,
            if req.desired_available { "release" } else { "reserve" },
            req.user,
            req.node_ip
        );
    }
}

async fn list_requests(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client.get(format!("{}/requests", endpoint)).send().await?;
    let requests: Vec<UserRequest> = check(response).await?.json().await?;
    print_requests(&requests);
    Ok(())
}

async fn resolve(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client.delete(format!("{}/requests", endpoint)).send().await?;
    let resolved: Vec<UserRequest> = check(response).await?.json().await?;
    println!("Resolved {} request(s)", resolved.len());
    print_requests(&resolved);
    Ok(())
}

async fn promote(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client.post(format!("{}/admin/promote", endpoint)).send().await?;
    let result: ActionResponse = check(response).await?.json().await?;

    if result.success {
        println!("Promotion requested successfully");
    } else {
        println!("Promotion failed");
    }
    if let Some(msg) = result.message {
        println!("{}", msg);
    }
    Ok(())
}
