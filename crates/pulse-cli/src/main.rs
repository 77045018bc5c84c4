use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use pulse_client::{
    ClientTransport, HttpActionSender, HttpStreamConnector, OfflineActionQueue, QueueOptions,
    SqliteStorage, TransportOptions,
};
use pulse_gateway::{config, Gateway};
use pulse_types::action::ActionEndpoint;
use pulse_types::config::PulseConfig;
use pulse_types::event::{EventName, Scope};

#[derive(Parser)]
#[command(name = "pulse", version, about = "Pulse — realtime updates and offline writes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the realtime gateway. Lines on stdin of the form
    /// `<event> <scope> [json payload]` are published to the bus.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Follow a realtime stream and print transport state changes
    Watch {
        /// Stream endpoint; repeat for failover candidates
        #[arg(long = "endpoint")]
        endpoints: Vec<String>,
        /// Comma-separated scopes (tasks, monitor, all)
        #[arg(long)]
        scopes: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Inspect and drive the offline action queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Show current status
    Status,
}

#[derive(Subcommand)]
enum QueueCommand {
    /// List pending and failed actions
    List,
    /// Queue an action without sending it
    Enqueue {
        endpoint: ActionEndpoint,
        /// JSON object sent as the request body
        #[arg(long)]
        body: Option<String>,
    },
    /// Deliver every due action now
    Sync,
    /// Move failed actions back to the queue
    Retry { id: Option<String> },
    /// Drop a failed action
    Discard { id: String },
    /// Drop every failed action
    ClearFailed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.gateway.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { host, port } => serve(cfg, host, port).await,
        Commands::Watch {
            endpoints,
            scopes,
            token,
        } => watch(cfg, endpoints, scopes, token).await,
        Commands::Queue { command } => queue(cfg, command).await,
        Commands::Status => {
            println!("Pulse v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Gateway: {}:{} (heartbeat {}s, {} token(s))",
                cfg.gateway.host,
                cfg.gateway.port,
                cfg.gateway.heartbeat_secs,
                cfg.gateway.tokens.len()
            );
            println!("Stream endpoints: {}", cfg.client.endpoints.join(", "));
            let queue = open_queue(&cfg)?;
            let status = queue.status();
            println!("Offline queue: {} pending, {} failed", status.pending, status.failed);
            println!("Config: {}", config::config_path()?.display());
            println!("Database: {}", config::client_db_path()?.display());
            Ok(())
        }
    }
}

async fn serve(mut cfg: PulseConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        cfg.gateway.host = host;
    }
    if let Some(port) = port {
        cfg.gateway.port = port;
    }
    let gateway = Arc::new(Gateway::new(cfg.gateway));

    let publisher = Arc::clone(&gateway);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_publish(line) {
                Ok((name, scope, payload)) => {
                    let event = publisher.publish(name, scope, payload);
                    info!(id = event.id, "Published {} to {}", event.name, event.scope);
                }
                Err(e) => warn!("Ignoring input line: {e:#}"),
            }
        }
    });

    gateway.serve().await
}

fn parse_publish(line: &str) -> Result<(EventName, Scope, Option<Map<String, Value>>)> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let name: EventName = parts.next().unwrap_or_default().parse()?;
    let scope: Scope = parts
        .next()
        .context("expected `<event> <scope> [json]`")?
        .parse()?;
    let payload = match parts.next().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(parse_object(raw)?),
        None => None,
    };
    Ok((name, scope, payload))
}

fn parse_object(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("invalid JSON")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("expected a JSON object"),
    }
}

async fn watch(
    cfg: PulseConfig,
    endpoints: Vec<String>,
    scopes: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let mut options = TransportOptions::from(&cfg.client);
    if !endpoints.is_empty() {
        options.endpoints = endpoints;
    }
    if let Some(scopes) = scopes {
        options.scopes = scopes
            .split(',')
            .map(|s| s.trim().parse())
            .collect::<Result<Vec<Scope>>>()?;
    }
    let connector = HttpStreamConnector::new(token.or(cfg.client.token.clone()));
    let transport = ClientTransport::new(options, Arc::new(connector), || {
        println!("invalidate: refetch requested");
    })?;
    transport.start();

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = transport.snapshot();
                let line = serde_json::to_string(&snapshot)?;
                if last.as_ref() != Some(&line) {
                    println!("{line}");
                    last = Some(line);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    transport.shutdown();
    Ok(())
}

fn open_queue(cfg: &PulseConfig) -> Result<OfflineActionQueue> {
    let storage = SqliteStorage::open(&config::client_db_path()?)?;
    let sender = HttpActionSender::new(&cfg.queue);
    OfflineActionQueue::open(
        Arc::new(storage),
        Arc::new(sender),
        QueueOptions::from(&cfg.queue),
    )
}

async fn queue(cfg: PulseConfig, command: QueueCommand) -> Result<()> {
    let queue = open_queue(&cfg)?;

    match command {
        QueueCommand::List => {
            let listing = serde_json::json!({
                "pending": queue.pending(),
                "failed": queue.failed(),
            });
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        QueueCommand::Enqueue { endpoint, body } => {
            let body = match body {
                Some(raw) => parse_object(&raw)?,
                None => Map::new(),
            };
            queue.set_online(false);
            let action = queue.enqueue(endpoint, body)?;
            println!("Queued {} ({})", action.id, action.endpoint);
        }
        QueueCommand::Sync => {
            queue.sync().await?;
            let status = queue.status();
            println!("{} pending, {} failed", status.pending, status.failed);
        }
        QueueCommand::Retry { id } => {
            queue.set_online(false);
            let moved = queue.retry_failed(id.as_deref())?;
            println!("Moved {moved} action(s) back to the queue");
        }
        QueueCommand::Discard { id } => {
            if queue.discard_failed(&id)? {
                println!("Discarded {id}");
            } else {
                println!("No failed action with id {id}");
            }
        }
        QueueCommand::ClearFailed => {
            let cleared = queue.clear_failed()?;
            println!("Cleared {cleared} failed action(s)");
        }
    }
    Ok(())
}
