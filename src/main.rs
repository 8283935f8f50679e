//! ws-hub echo server binary.
//!
//! Runs the server with an optional TOML config file and CLI overrides,
//! echoing every received message back to its sender.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use ws_hub::{ServerConfig, ServerEvent, WsServer};

#[derive(Parser, Debug)]
#[command(name = "ws-hub", about = "WebSocket echo server")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind host, overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overrides the config file.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ws_hub::observability::logging::init("ws_hub=info");

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ws_hub::config::load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let server = Arc::new(WsServer::new(config)?);

    let echo = Arc::clone(&server);
    server.subscribe(move |event| {
        if let ServerEvent::MessageReceived {
            identity,
            payload,
            kind,
        } = event
        {
            let server = Arc::clone(&echo);
            let identity = identity.clone();
            let payload = payload.clone();
            let kind = *kind;
            tokio::spawn(async move {
                let _ = server.send(&identity, payload, kind, None).await;
            });
        }
    });

    server.start().await?;
    tracing::info!(
        address = ?server.local_addr(),
        scheme = server.scheme(),
        "echo server running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.shutdown();

    let stats = server.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
