//! HTTP and websocket handlers for the Breaker server.
//!
//! Every websocket connection is registered with the shared hub and the
//! handler task then waits until the hub is done with the client. Payloads
//! `POST`ed to the broadcast endpoint go through the same hub.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{ensure, Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use breaker_core::{config::log_error, Hub, HubError};
use breaker_transport::AxumConnection;
use bytes::Bytes;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The broadcast hub.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Start a hub for the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub settings are invalid.
    pub fn new(config: Config) -> Result<Self> {
        let hub = Hub::new(config.hub_config().with_error_handler(report_hub_error))
            .context("Invalid hub configuration")?;
        Ok(Self { hub, config })
    }
}

/// Hub error handler: log, then count.
fn report_hub_error(err: &HubError) {
    log_error(err);
    metrics::record_error(err);
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;
    Router::new()
        .route(&transport.websocket_path, get(ws_handler))
        .route(&transport.broadcast_path, post(broadcast_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    ensure!(
        config.metrics.sample_interval_ms > 0,
        "metrics.sample_interval_ms must be > 0"
    );

    let state = Arc::new(AppState::new(config.clone())?);
    let hub = state.hub.clone();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Failed to start metrics server");
        }
        let every = Duration::from_millis(config.metrics.sample_interval_ms);
        tokio::spawn(sample_hub_stats(hub.clone(), every));
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(%addr, "Breaker server listening");
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub.clone()))
        .await
        .context("Server error")?;

    hub.shutdown().await;
    info!("Breaker server stopped");
    Ok(())
}

/// Resolve on ctrl-c, after the hub has released every client.
async fn shutdown_signal(hub: Hub) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
        return;
    }
    info!("Shutting down");
    hub.shutdown().await;
}

async fn sample_hub_stats(hub: Hub, every: Duration) {
    let mut ticker = time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !hub.is_closed() {
        ticker.tick().await;
        metrics::record_hub_stats(&hub.stats());
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = if state.hub.is_closed() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "stats": state.hub.stats(),
    }))
}

/// Broadcast the request body to every connected client.
async fn broadcast_handler(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let len = body.len();
    match state.hub.broadcast(body).await {
        Ok(()) => {
            metrics::record_published(len);
            debug!(bytes = len, "Published over HTTP");
            StatusCode::ACCEPTED
        }
        Err(HubError::InvalidArgument(reason)) => {
            debug!(reason, "Rejected broadcast");
            StatusCode::BAD_REQUEST
        }
        Err(HubError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
        Err(e) => {
            warn!(error = %e, "Broadcast failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// WebSocket upgrade handler.
///
/// The hub's read limit is handed to the protocol layer, so an oversize
/// frame is refused from its header instead of being buffered first.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let limit = state.hub.max_read_limit();
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_websocket(socket, addr, state))
}

/// Hand an upgraded socket to the hub and hold it until the hub lets go.
async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let conn = Arc::new(AxumConnection::new(socket, Some(addr)));
    let client = match state.hub.register(conn).await {
        Ok(client) => client,
        Err(e) => {
            warn!(%addr, error = %e, "Failed to register websocket");
            return;
        }
    };

    debug!(%addr, client = %client.id(), connection = %client.connection_id(), "WebSocket connected");
    client.closed().await;
    debug!(%addr, client = %client.id(), "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use breaker_core::memory;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()).unwrap())
    }

    #[tokio::test]
    async fn test_broadcast_endpoint_reaches_clients() {
        let state = state();
        let (conn, mut peer) = memory::pair();
        let _client = state.hub.register(conn).await.unwrap();

        let status = broadcast_handler(State(Arc::clone(&state)), Bytes::from_static(b"news"))
            .await
            .into_response()
            .status();
        assert_eq!(status, StatusCode::ACCEPTED);

        let received = time::timeout(Duration::from_secs(1), peer.recv_data())
            .await
            .unwrap();
        assert_eq!(received.unwrap(), "news");
    }

    #[tokio::test]
    async fn test_empty_broadcast_is_rejected() {
        let state = state();
        let status = broadcast_handler(State(state), Bytes::new())
            .await
            .into_response()
            .status();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_broadcast_after_shutdown() {
        let state = state();
        state.hub.shutdown().await;

        let status = broadcast_handler(State(Arc::clone(&state)), Bytes::from_static(b"late"))
            .await
            .into_response()
            .status();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health["status"], "shutting_down");
    }

    #[tokio::test]
    async fn test_health_reports_stats() {
        let state = state();
        let (conn, _peer) = memory::pair();
        let _client = state.hub.register(conn).await.unwrap();

        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(health["stats"]["clients"], 1);
    }

    #[tokio::test]
    async fn test_invalid_hub_settings_fail_startup() {
        let mut config = Config::default();
        config.hub.broadcast_capacity = 0;
        assert!(AppState::new(config).is_err());
    }

    #[tokio::test]
    async fn test_router_builds_with_custom_paths() {
        let mut config = Config::default();
        config.transport.websocket_path = "/socket".into();
        config.transport.broadcast_path = "/publish".into();
        let _router = router(Arc::new(AppState::new(config).unwrap()));
    }
}
