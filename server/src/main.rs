#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # relaygate
//!
//! Rendezvous gateway for backends behind NAT. Backends dial out and register;
//! clients connect to the same gateway and are relayed to them after a
//! per-backend api key handshake. One-shot HTTP callers can reach a backend
//! through the bridge without holding a relay connection.
//!
//! ## Subcommands
//!
//! - `relaygate serve` (default): run the gateway
//! - `relaygate connect`: run a backend tunnel client
//!
//! ## API surface
//!
//! | Method | Path                                | Auth                        | Description          |
//! |--------|-------------------------------------|-----------------------------|----------------------|
//! | GET    | `/api/health`                       | No                          | Liveness probe       |
//! | GET    | `/ws`                               | In-band (first frame)       | Relay connection     |
//! | ANY    | `/api/proxy/{backendId}/{*subpath}` | `Bearer <secret>:<api_key>` | HTTP bridge          |
//!
//! ## Architecture
//!
//! ```text
//! main.rs         : entry point, clap subcommands, graceful shutdown
//! config.rs       : TOML + env-var configuration
//! auth.rs         : shared-secret and bridge credential checks
//! registry.rs     : device id → backend id, persisted as JSON
//! identity.rs     : backend's own device id
//! routes/
//!   health.rs     : GET /api/health
//! tunnel/
//!   protocol.rs   : relay message types
//!   table.rs      : live connections, roles, authorizations
//!   hub.rs        : single-owner reactor
//!   bridge.rs     : HTTP-over-tunnel
//!   relay.rs      : /ws connection task, router
//!   client.rs     : backend tunnel client
//!   socks.rs      : SOCKS5 dialer
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

use relaygate::config::{Config, DEFAULT_SECRET};
use relaygate::identity::DeviceIdentity;
use relaygate::registry::{Registry, REGISTRY_FILE};
use relaygate::tunnel::relay::gateway_router;
use relaygate::{
    ApiKeyValidator, GatewayState, Hub, HubSettings, LocalHttpForwarder, MessageHandler,
    TunnelClient, TunnelStatus,
};

/// Rendezvous gateway relaying clients to NAT-bound backends.
#[derive(Parser)]
#[command(name = "relaygate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Connect to a gateway as a backend (needs a `[backend]` section).
    Connect {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Connect { config }) => run_backend(config.as_deref()).await,
        Some(Commands::Serve { config }) => run_gateway(config.as_deref()).await,
        None => run_gateway(None).await,
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    let config = Config::load(path).context("failed to load configuration")?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    Ok(config)
}

async fn run_gateway(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = Arc::new(load_config(config_path)?);

    info!("relaygate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.gateway.secret == DEFAULT_SECRET {
        warn!("Using default gateway secret; set RELAYGATE_SECRET or update config");
    }

    let data_dir = config.server.data_path();
    let registry = Registry::open(&data_dir.join(REGISTRY_FILE))
        .await
        .context("failed to open backend registry")?;

    let (hub, handle) = Hub::new(HubSettings::from(&config.gateway), registry);
    let hub_task = hub.spawn();

    let state = GatewayState::new(config.clone(), handle.clone());
    let app = gateway_router(state);

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // Cleanup
    info!("Shutting down...");
    handle.shutdown().await;
    let _ = hub_task.await;
    info!("Goodbye");
    Ok(())
}

/// Echoes every client message back, wrapped with the sender's id.
struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, client_id: String, message: Value) -> Result<Value, String> {
        Ok(json!({"clientId": client_id, "echo": message}))
    }
}

async fn run_backend(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let backend = config
        .backend
        .clone()
        .context("`relaygate connect` needs a [backend] config section")?;

    let identity = DeviceIdentity::in_dir(&config.server.data_path())
        .await
        .context("failed to load device identity")?;
    info!("relaygate v{} connecting as backend", env!("CARGO_PKG_VERSION"));

    let mut builder = TunnelClient::builder(backend.clone(), identity.device_id)
        .validator(ApiKeyValidator::new(backend.api_key.clone()))
        .handler(EchoHandler);
    if let Some(local) = &backend.local_url {
        info!("Bridged HTTP requests go to {local}");
        builder = builder.proxy_handler(LocalHttpForwarder::new(local.clone()));
    }
    let handle = builder.build().context("invalid backend configuration")?.spawn();

    let mut status = handle.subscribe();
    let finished = async {
        loop {
            if status.borrow_and_update().is_terminal() {
                break;
            }
            if status.changed().await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        () = finished => {}
        () = shutdown_signal() => {}
    }

    let last = handle.status();
    handle.shutdown().await;
    match last {
        TunnelStatus::GaveUp => anyhow::bail!("gave up reconnecting to the gateway"),
        TunnelStatus::Rejected { reason } => anyhow::bail!("gateway rejected registration: {reason}"),
        _ => {
            info!("Goodbye");
            Ok(())
        }
    }
}

// Graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
