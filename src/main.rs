//! Multiport Honeypot - a multi-protocol network decoy
//!
//! Listens on several well-known ports from one single-threaded reactor:
//! - Accept-time admission (allow-list, per-IP rate window)
//! - Protocol emulation (FTP, SSH, Telnet, SMTP, POP3, HTTP)
//! - Payload capture with signature analysis

mod access;
mod capture;
mod config;
mod handlers;
mod multiplexer;
mod telemetry;

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::access::AccessGate;
use crate::capture::PayloadCapture;
use crate::handlers::HandlerRegistry;
use crate::multiplexer::{Core, Multiplexer};
use crate::telemetry::SECURITY;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Load configuration
    let config = match config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            telemetry::init_fallback();
            error!(target: SECURITY, "Failed to load configuration: {:#}", e);
            return Err(e);
        }
    };

    // Initialize logging; the guard flushes the log files on the way out
    let _log_guard = telemetry::init(&config.logging)?;
    info!("Starting Honeypot...");
    info!("Configuration loaded");

    if let Err(e) = serve(&config).await {
        error!(target: SECURITY, "Failed to start honeypot: {:#}", e);
        return Err(e);
    }

    info!("Honeypot stopped");
    Ok(())
}

async fn serve(config: &config::Config) -> Result<()> {
    let gate = AccessGate::from_config(&config.access).context("Invalid access configuration")?;
    let registry = HandlerRegistry::from_config(&config.server.ports, &config.handlers, &config.emulation)?;
    if registry.is_empty() {
        warn!("No handlers bound; every connection will be refused");
    } else {
        info!("{} handlers bound", registry.len());
    }
    let capture = PayloadCapture::from_config(&config.capture).context("Cannot prepare capture storage")?;
    info!(
        "Capturing payloads to {} (metadata in {})",
        capture.payload_dir().display(),
        capture.session_dir().display()
    );

    let core = Core::new(gate, registry, capture)
        .with_max_connections_per_ip(config.access.max_connections_per_ip)
        .with_read_buffer_bytes(config.server.read_buffer_bytes);

    let mut multiplexer = Multiplexer::new(
        core,
        &config.server.host,
        config.server.backlog,
        Duration::from_secs(config.access.eviction_interval_secs),
    );

    for port in &config.server.ports {
        multiplexer
            .listen(*port)
            .with_context(|| format!("Failed to listen on port {}", port))?;
    }

    tokio::select! {
        result = multiplexer.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
