//! Axum routes that claim pending connections and serve their WebSockets.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, Path, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tagwire_core::keys::key_value;
use tagwire_core::{TagwireError, WireMessage};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::connection::{Connection, InitialRequest};
use crate::state::GatewayState;
use crate::ws;

/// The gateway's own routes, with state applied.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/tagwire/.ping", get(ping_handler))
        .route("/tagwire/{key}", get(ws_handler))
        .route("/tagwire/{key}/noscript", get(noscript_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Start the gateway: the tagwire routes merged with the application's
/// `app` routes, plus the maintenance loop. Returns once shut down by
/// Ctrl-C or by closing the hub.
pub async fn start_gateway(state: Arc<GatewayState>, app: Router) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_addr(), state.config.gateway_port());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    let maintenance = tokio::spawn(state.clone().serve());
    let app = router(state.clone())
        .merge(app)
        .layer(TraceLayer::new_for_http());

    let hub = state.hub.clone();
    let shutdown = hub.shutdown_token();
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = shutdown.cancelled() => {}
        }
        // ends the open websockets so the server can drain
        hub.close();
    })
    .await;

    state.close();
    let _ = maintenance.await;
    result?;
    Ok(())
}

/// Describe the page request for a new connection.
///
/// `secure` follows `X-Forwarded-Proto` when a proxy sets it, else the URI
/// scheme.
pub fn initial_request(headers: &HeaderMap, uri: &Uri, remote: SocketAddr) -> InitialRequest {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let secure = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|proto| proto.eq_ignore_ascii_case("https"))
        .unwrap_or_else(|| uri.scheme_str() == Some("https"));
    InitialRequest {
        remote_ip: Some(remote.ip()),
        host,
        secure,
        uri: uri.to_string(),
    }
}

async fn ping_handler(State(state): State<Arc<GatewayState>>) -> StatusCode {
    if state.hub.is_done() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    axum::Json(json!({
        "status": if state.hub.is_done() { "closed" } else { "ok" },
        "version": version,
        "pending": state.pending_count(),
        "subscribers": state.hub.subscriber_count(),
        "sessions": state.sessions.session_count(),
    }))
}

async fn noscript_handler(
    State(state): State<Arc<GatewayState>>,
    Path(key): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> StatusCode {
    let Some(conn) = state.use_connection(key_value(&key), Some(addr.ip())) else {
        return StatusCode::NOT_FOUND;
    };
    conn.cancel(Some(TagwireError::JavascriptDisabled));
    state.recycle(conn);
    StatusCode::NO_CONTENT
}

async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    Path(key): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(conn) = state.use_connection(key_value(&key), Some(addr.ip())) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(conn = %conn.key_string(), %rejection, "not a websocket request");
            conn.cancel(Some(anyhow::anyhow!("not a websocket request: {rejection}").into()));
            state.recycle(conn);
            return rejection.into_response();
        }
    };
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if let Err(err) = conn.validate_origin(origin) {
        warn!(conn = %conn.key_string(), ?origin, error = %err, "websocket origin rejected");
        conn.cancel(Some(err));
        state.recycle(conn);
        return StatusCode::FORBIDDEN.into_response();
    }
    upgrade.on_upgrade(move |socket| serve_connection(state, conn, socket))
}

/// Run a claimed connection over `socket` until either side ends it.
async fn serve_connection(state: Arc<GatewayState>, conn: Arc<Connection>, socket: WebSocket) {
    if !conn.start_serve() {
        warn!(conn = %conn.key_string(), "connection already serving");
        state.recycle(conn);
        return;
    }
    crate::metrics::record_ws_connect();
    info!(conn = %conn.key_string(), ip = ?conn.remote_ip(), "websocket connected");
    let (mut ws_tx, ws_rx) = socket.split();

    if let Err(err) = conn.on_connect() {
        warn!(conn = %conn.key_string(), error = %err, "connect hook failed");
        let alert = WireMessage::alert_error(&err).encode();
        let _ = ws_tx.send(WsMessage::Text(alert.into())).await;
        let _ = ws_tx.send(WsMessage::Close(None)).await;
        conn.cancel(Some(err));
        finish(&state, conn);
        return;
    }

    let capacity = state.queue_capacity(&conn);
    let Some(broadcasts) = state.hub.subscribe(&conn, capacity) else {
        debug!(conn = %conn.key_string(), "hub closed before subscribe");
        let _ = ws_tx.send(WsMessage::Close(None)).await;
        finish(&state, conn);
        return;
    };
    let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let reader = tokio::spawn(ws::read_loop(conn.clone(), ws_rx, incoming_tx));
    let writer = tokio::spawn(ws::write_loop(conn.clone(), ws_tx, outbound_rx));

    conn.clone().process(broadcasts, incoming_rx, outbound_tx).await;

    let _ = reader.await;
    let _ = writer.await;
    finish(&state, conn);
}

fn finish(state: &GatewayState, conn: Arc<Connection>) {
    crate::metrics::record_ws_disconnect();
    match conn.cancel_cause() {
        Some(cause) => info!(conn = %conn.key_string(), cause = %cause, "websocket closed"),
        None => info!(conn = %conn.key_string(), "websocket closed"),
    }
    state.recycle(conn);
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
