use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chorus_core::AppState;
use chorus_store::MemoryStore;
use clap::Parser;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod maintenance;

const STORE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chorus=info,tower_http=info,wire=info"));
    let json = std::env::var("CHORUS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node": state.config.node_id,
        "connections": state.registry.connection_count(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = cli::Args::parse();
    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    let node_id = config.node_id();
    let app_config = config.app_config(node_id.clone());
    let authenticator = config.authenticator();
    if authenticator.is_empty() && !app_config.guests_enabled {
        tracing::warn!("No auth tokens configured and guests are disabled; every connection will be rejected");
    }

    let store = Arc::new(MemoryStore::new());
    store.spawn_sweeper(STORE_SWEEP_INTERVAL);

    let state = AppState::new(app_config, store, Arc::new(authenticator));
    let _fanout = state.start_fanout().await?;
    state.bootstrap_default_rooms().await?;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let maintenance = maintenance::spawn_maintenance(
        state.clone(),
        config.cleanup_interval(),
        config.room_idle(),
        Arc::clone(&shutdown),
    );

    let app = Router::new()
        .route("/health", get(health))
        .merge(chorus_ws::gateway_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        node = %node_id,
        bind = %config.server.bind_address,
        "chorus server listening"
    );

    let shutdown_signal = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutting down (ctrl-c)..."),
            Err(e) => {
                tracing::warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    shutdown.notify_one();
    let _ = maintenance.await;
    Ok(())
}
