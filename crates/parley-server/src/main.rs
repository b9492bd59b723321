//! # Parley Server
//!
//! Main binary wiring the real-time core together:
//! - Pub/sub bus (in-process, or Redis when `PARLEY__REDIS__URL` is set)
//! - Store (PostgreSQL, or in-memory standalone mode without a database)
//! - Call plane (P2P rooms + SFU)
//! - WebSocket gateway
//!
//! Everything is created once at startup with dependencies injected, and
//! torn down explicitly on shutdown: connections first, then peer
//! connections, then the bus.

use clap::Parser;
use parley_bus::memory::MemoryBus;
use parley_bus::redis::RedisBus;
use parley_bus::EventBus;
use parley_common::auth::JwtVerifier;
use parley_gateway::hub::Hub;
use parley_gateway::GatewayState;
use parley_store::memory::MemoryStore;
use parley_store::postgres::PgStore;
use parley_store::Store;
use parley_voice::{CallSettings, VoiceState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Real-time messaging and call server")]
struct Cli {
    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parley_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=info".into()),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    tracing::info!("Starting Parley v{}", env!("CARGO_PKG_VERSION"));

    // === Pub/sub bus ===
    let bus: Arc<dyn EventBus> = match &config.redis.url {
        Some(url) => {
            tracing::info!("Using Redis bus at {url}");
            RedisBus::connect(url).await?
        }
        None => {
            tracing::info!("Using in-process bus");
            MemoryBus::new()
        }
    };

    // === Store ===
    let store: Arc<dyn Store> = if config.database.url.is_empty() {
        tracing::warn!("No database configured — running with the in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            PgStore::connect(
                &config.database.url,
                config.database.max_connections,
                config.database.min_connections,
            )
            .await?,
        )
    };

    // === Call plane (P2P rooms + SFU) ===
    let settings = CallSettings::from_config(config);
    tracing::info!(
        sfu_enabled = settings.sfu_enabled,
        ice_servers = settings.ice_servers.len(),
        "Call plane ready"
    );
    let voice = VoiceState::new(Arc::clone(&store), Arc::clone(&bus), settings)?;

    // === Gateway ===
    let hub = Hub::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        voice.clone(),
        config.server.outbound_queue,
    );
    let gateway = GatewayState {
        hub: Arc::clone(&hub),
        verifier: Arc::new(JwtVerifier::new(config.auth.jwt_secret.clone())),
        handshake_timeout: Duration::from_secs(config.server.handshake_timeout_secs),
    };
    let router = parley_gateway::build_router(gateway)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let port = cli.port.unwrap_or(config.server.port);
    let addr = SocketAddr::new(config.server.host.parse()?, port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on ws://{addr}/ws");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    hub.shutdown().await;
    voice.shutdown().await;
    if let Err(e) = bus.close().await {
        tracing::warn!(error = %e, "bus close failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
