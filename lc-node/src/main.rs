//! LC Node - OCPP local controller
//!
//! Relays OCPP traffic between charge points (and downstream networking
//! nodes) and a CSMS.
//!
//! # Usage
//!
//! ```bash
//! # Listen for charge points, forward to a CSMS
//! lc-node --node-id LC1 --csms-url ws://localhost:8180/ocpp --csms-id CSMS1
//!
//! # Downstream overlay neighbour and a static route through it
//! lc-node --node-id LC1 --csms-url ws://localhost:8180/ocpp \
//!     --overlay-peer NN1 --route CP42=NN1
//!
//! # Answer Heartbeats locally, print lifecycle events as JSON lines
//! lc-node --node-id LC1 --answer-heartbeats --events-json
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use lc_adapter_ws::{DownstreamListener, UpstreamClient, WsConfig};
use lc_core::ocpp::ActionCatalog;
use lc_core::{LifecycleEvent, NetworkingMode, NetworkingNode, NodeConfig, Phase};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// OCPP local controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// NodeId of this controller
    #[arg(short, long)]
    node_id: String,

    /// Address to accept charge points on
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,

    /// CSMS WebSocket URL (this node's id is appended)
    #[arg(long)]
    csms_url: Option<String>,

    /// NodeId of the CSMS
    #[arg(long, default_value = "CSMS")]
    csms_id: String,

    /// Use overlay framing on the CSMS link
    #[arg(long)]
    uplink_overlay: bool,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,

    /// Downstream peers speaking overlay framing (can be repeated)
    #[arg(long)]
    overlay_peer: Vec<String>,

    /// Downstream peers sending CBOR (can be repeated)
    #[arg(long)]
    cbor_peer: Vec<String>,

    /// Static route DEST=VIA (can be repeated)
    #[arg(long)]
    route: Vec<String>,

    /// Answer Heartbeat locally instead of forwarding it
    #[arg(long)]
    answer_heartbeats: bool,

    /// Print every lifecycle event as a JSON line on stdout
    #[arg(long)]
    events_json: bool,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              LC Node - OCPP Local Controller                 ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.node_id);
    println!("║  Listen:   {:<50} ║", args.listen);
    println!(
        "║  CSMS:     {:<50} ║",
        truncate(args.csms_url.as_deref().unwrap_or("(none)"), 50)
    );
    println!("║  Timeout:  {:<50} ║", format!("{}s", args.request_timeout_secs));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut node_config = NodeConfig::new(args.node_id.as_str())
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs));
    let mut ws_config = WsConfig::new(args.listen);

    if let Some(url) = &args.csms_url {
        node_config = node_config.with_upstream(args.csms_id.as_str());
        ws_config = ws_config.with_csms(url.as_str(), args.csms_id.as_str());
    }
    if args.uplink_overlay {
        ws_config = ws_config.with_uplink_mode(NetworkingMode::OverlayNetwork);
    }
    for peer in &args.overlay_peer {
        ws_config = ws_config.with_overlay_peer(peer.as_str());
    }
    for peer in &args.cbor_peer {
        ws_config = ws_config.with_cbor_peer(peer.as_str());
    }

    // Add static routes
    for route in &args.route {
        match parse_route(route) {
            Some((destination, via)) => {
                node_config = node_config.with_route(destination, via);
                info!("Added static route: {} via {}", destination, via);
            }
            None => eprintln!("Invalid route (expected DEST=VIA): {}", route),
        }
    }

    let mut catalog = ActionCatalog::ocpp201();
    if args.answer_heartbeats {
        catalog = catalog.with_handler("Heartbeat", |_, _| {
            Ok(json!({ "currentTime": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true) }))
        });
    }

    let node = Arc::new(NetworkingNode::builder(node_config).catalog(catalog).build());

    let events = tokio::spawn(log_events(node.clone(), args.events_json));
    let housekeeping = node.spawn_housekeeping();

    let listener = DownstreamListener::bind(node.clone(), ws_config.clone()).await?;
    let server = tokio::spawn(listener.run());
    let uplink = tokio::spawn(UpstreamClient::new(node.clone(), ws_config).run());

    info!("Starting local controller...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        result = server => match result {
            Ok(Err(e)) => error!("Listener stopped: {}", e),
            Ok(Ok(())) => {}
            Err(e) => error!("Listener task failed: {}", e),
        },
    }

    uplink.abort();
    node.shutdown();
    housekeeping.abort();
    events.abort();

    Ok(())
}

/// Mirror lifecycle events into the log, optionally as JSON lines
async fn log_events(node: Arc<NetworkingNode>, as_json: bool) {
    let mut events = node.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                if as_json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Unprintable event: {}", e),
                    }
                }
                log_event(&event);
            }
            Err(RecvError::Lagged(missed)) => warn!("Event log lagged, {} event(s) missed", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &LifecycleEvent) {
    let action = event.action.as_deref().unwrap_or("-");
    let sender = event.sender.as_ref().map(|s| s.as_str()).unwrap_or("-");
    let detail = event.detail.as_deref().unwrap_or("");

    match event.phase {
        Phase::Timeout
        | Phase::ConnectionLost
        | Phase::TransmissionFailed
        | Phase::UnknownDestination
        | Phase::MessageLoop
        | Phase::DirectionViolation
        | Phase::DecodeFailed => {
            warn!("{:?} {} from {} {}", event.phase, action, sender, detail);
        }
        _ => match event.runtime {
            Some(runtime) => debug!("{:?} {} from {} in {:?}", event.phase, action, sender, runtime),
            None => debug!("{:?} {} from {}", event.phase, action, sender),
        },
    }
}

/// Parse `DEST=VIA`
fn parse_route(route: &str) -> Option<(&str, &str)> {
    let (destination, via) = route.split_once('=')?;
    let (destination, via) = (destination.trim(), via.trim());
    if destination.is_empty() || via.is_empty() {
        return None;
    }
    Some((destination, via))
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
