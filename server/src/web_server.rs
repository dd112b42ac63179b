//! Server Host (C6, spec.md §4.6): axum WebSocket upgrade at a configured
//! path, wiring the Session Manager, Permission Gate, and Connection
//! Handler together; shutdown sequencing on SIGINT/SIGTERM.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tracing::info;

use gateway_core::config::ServerConfig;
use gateway_core::permission::{ConnectionMetadata, PermissionPolicy};
use gateway_core::session::SessionManager;

use crate::connection::{handle_connection, AppState};

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_server(
    addr: SocketAddr,
    config: Arc<ServerConfig>,
    policy: Arc<dyn PermissionPolicy>,
) -> anyhow::Result<()> {
    let session_manager = SessionManager::new(config.clone());
    let sweeper = session_manager.spawn_idle_sweeper(IDLE_SWEEP_INTERVAL);
    let state = AppState { session_manager: session_manager.clone(), config, policy };

    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    let shutdown = shutdown_signal();
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    sweeper.abort();
    session_manager.cleanup().await;
    info!("gateway shut down");
    Ok(())
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let meta = ConnectionMetadata {
        headers: headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
            .collect(),
        query,
    };
    ws.on_upgrade(move |socket| handle_connection(socket, meta, state))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        sig.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
