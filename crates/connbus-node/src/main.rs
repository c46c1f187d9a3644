//! connbus node - run a single bus participant from the command line.
//!
//! Starts a connection manager, optionally listens, dials the given peers,
//! sends the given messages, then prints everything that arrives on the
//! watched queue until Ctrl-C.

use anyhow::{bail, Context, Result};
use clap::Parser;
use connbus_core::{BusConfig, ConnectionManager, ManagerConfig, Message};
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "connbus-node")]
#[command(about = "Peer-to-peer message bus node")]
struct Args {
    /// Name this node announces to its peers (random if omitted)
    #[arg(short, long)]
    name: Option<String>,

    /// Accept inbound connections
    #[arg(short, long)]
    listen: bool,

    /// Host to bind the listener to
    #[arg(long, default_value = BusConfig::DEFAULT_LISTEN_HOST)]
    host: String,

    /// Port to bind the listener to (0 = auto-assign)
    #[arg(short, long, default_value_t = BusConfig::DEFAULT_LISTEN_PORT)]
    port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = BusConfig::DEFAULT_BACKLOG)]
    backlog: u32,

    /// Poll timeout of the internal loops, in milliseconds
    #[arg(long, default_value_t = BusConfig::DEFAULT_POLL_TIMEOUT.as_millis() as u64)]
    poll_ms: u64,

    /// Longest a single message write may take, in milliseconds
    #[arg(long, default_value_t = BusConfig::DEFAULT_WRITE_TIMEOUT.as_millis() as u64)]
    write_timeout_ms: u64,

    /// Peer to dial, as HOST:PORT (repeatable)
    #[arg(short, long, value_parser = parse_peer)]
    connect: Vec<(String, u16)>,

    /// Message to send once connected, as TARGET=TEXT (repeatable).
    /// TEXT is sent as JSON when it parses, otherwise as a string.
    #[arg(short, long, value_parser = parse_send)]
    send: Vec<(String, String)>,

    /// Local queue to print incoming messages from
    #[arg(short, long, default_value = BusConfig::DEFAULT_QUEUE_NAME)]
    queue: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_peer(value: &str) -> Result<(String, u16)> {
    let Some((host, port)) = value.rsplit_once(':') else {
        bail!("expected HOST:PORT, got '{}'", value);
    };
    // IPv6 literals are written bracketed, [::1]:80
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        bail!("missing host in '{}'", value);
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in '{}'", value))?;
    Ok((host.to_string(), port))
}

fn parse_send(value: &str) -> Result<(String, String)> {
    match value.split_once('=') {
        Some((target, text)) if !target.is_empty() => Ok((target.to_string(), text.to_string())),
        _ => bail!("expected TARGET=TEXT, got '{}'", value),
    }
}

fn payload(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}

fn manager_config(args: &Args) -> ManagerConfig {
    let config = match &args.name {
        Some(name) => ManagerConfig::new(name.clone()),
        None => ManagerConfig::default(),
    };
    config
        .enable_listener(args.listen)
        .listen_host(args.host.clone())
        .listen_port(args.port)
        .listen_backlog(args.backlog)
        .poll_timeout(Duration::from_millis(args.poll_ms))
        .write_timeout(Duration::from_millis(args.write_timeout_ms))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let manager = ConnectionManager::new(manager_config(&args))?;
    info!("Starting connbus node '{}'", manager.name());
    manager.start().await?;

    if let Some(addr) = manager.local_addr() {
        // Intentional stdout so scripts can pick up an auto-assigned port
        println!("LISTENING={}", addr);
    }

    for (host, port) in &args.connect {
        match manager.connect(host, *port).await {
            Ok(conn) => info!(
                "Connected to '{}' at {}:{}",
                conn.peer_name().unwrap_or_default(),
                host,
                port
            ),
            Err(e) => error!("Could not connect to {}:{}: {}", host, port, e),
        }
    }

    for (target, text) in &args.send {
        manager.send(Message::new(target.clone(), payload(text)))?;
    }

    let queue = manager.get_queue(&args.queue);
    info!("Watching queue '{}', press Ctrl-C to exit", args.queue);

    loop {
        tokio::select! {
            message = queue.recv() => {
                println!(
                    "[{}] {} -> {}: {}",
                    message.id(),
                    message.source.as_deref().unwrap_or("?"),
                    message.target_qname,
                    message.data
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received, stopping");
                break;
            }
        }
    }

    manager.stop().await;
    let stats = manager.stats();
    info!(
        sent = stats.messages_sent,
        received = stats.messages_received,
        routing_failures = stats.routing_failures,
        "Node stopped"
    );

    Ok(())
}
