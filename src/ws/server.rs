//! Hub WebSocket server + REST endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{Method, header},
    response::IntoResponse,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::router::{HubRouter, HubSession};
use crate::task::NodeInfo;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct HubState {
    pub router: Arc<HubRouter>,
}

/// Build the Axum router with the hub WebSocket and REST routes.
pub fn hub_routes(router: Arc<HubRouter>) -> Router {
    Router::new()
        .route("/hub/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/register", post(register))
        .layer(cors_layer())
        .with_state(HubState { router })
}

/// Serve the hub on an already bound listener until the process stops.
pub async fn serve(listener: TcpListener, router: Arc<HubRouter>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, hub_id = %router.hub_id(), "Hub listening");
    }
    axum::serve(listener, hub_routes(router)).await
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}

// ── REST ────────────────────────────────────────────────────────────────

async fn health(State(state): State<HubState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskflow-hub",
        "hubId": state.router.hub_id(),
    }))
}

/// HTTP announcement ahead of the WebSocket. Membership is only recorded
/// once the node registers over its socket.
async fn register(State(state): State<HubState>, Json(info): Json<NodeInfo>) -> impl IntoResponse {
    info!(
        node_id = %info.node_id,
        role = %info.role,
        node_type = %info.node_type,
        environment = %info.environment,
        commands = info.commands_accepted.len(),
        "Node announced over HTTP"
    );
    Json(serde_json::json!({ "hubId": state.router.hub_id() }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    debug!("Node connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.router))
}

async fn handle_socket(mut socket: WebSocket, router: Arc<HubRouter>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut session = HubSession::new(tx);

    loop {
        tokio::select! {
            // Frames queued for this node by any handler
            Some(frame) = rx.recv() => {
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    debug!(node_id = ?session.node_id, "Node disconnected during send");
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = router.handle_frame(&mut session, text.as_str()).await {
                            debug!(node_id = ?session.node_id, error = %e, "Frame rejected");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(node_id = ?session.node_id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(node_id) = &session.node_id {
        router.runtime().connections.remove(node_id).await;
    }
    info!(node_id = ?session.node_id, "WebSocket connection closed");
}
