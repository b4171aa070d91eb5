//! HTTP front-end: tunnel upgrade endpoint and a JSON call endpoint.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fdxtunnel_shared::protocol::CHANNEL_PATH;
use fdxtunnel_shared::Error;
use futures_util::{future, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use crate::controller::ServerController;

/// Body of `POST /api/call/:target_id`
#[derive(Debug, Deserialize)]
pub struct CallRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

pub fn router(ctrl: ServerController) -> Router {
    Router::new()
        .route(&format!("{}/:target_id", CHANNEL_PATH), get(channel_handler))
        .route("/api/call/:target_id", post(call_handler))
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .with_state(ctrl)
}

async fn channel_handler(
    ws: WebSocketUpgrade,
    Path(target_id): Path<String>,
    State(ctrl): State<ServerController>,
) -> Response {
    if ctrl.is_registered(&target_id) {
        warn!("Tunnel for {} already exists, rejecting upgrade", target_id);
        return (
            StatusCode::CONFLICT,
            format!("tunnel for {} already exists", target_id),
        )
            .into_response();
    }

    info!("websocket upgrade for {}", target_id);
    ws.on_upgrade(move |socket| async move { attach_socket(&ctrl, &target_id, socket) })
}

/// Adapt the websocket to text frames and hand it to the controller.
fn attach_socket(ctrl: &ServerController, target_id: &str, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));
    let stream = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => Some(Ok(String::from_utf8_lossy(&data).into_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    // On rejection the socket halves are dropped, closing the connection
    if let Err(e) = ctrl.register(target_id, sink, stream) {
        warn!("register {}: {}", target_id, e);
    }
}

async fn call_handler(
    State(ctrl): State<ServerController>,
    Path(target_id): Path<String>,
    Json(req): Json<CallRequest>,
) -> Response {
    match ctrl
        .call_api(&target_id, &req.method, &req.url, req.headers, req.body)
        .await
    {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            let code = match e {
                Error::TargetNotFound(_) => StatusCode::NOT_FOUND,
                Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                Error::ConnectionClosed(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let body = serde_json::json!({"status": e.status(), "error": e.to_string()});
            (code, Json(body)).into_response()
        }
    }
}

async fn metrics_handler(State(ctrl): State<ServerController>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctrl.metrics().to_prometheus().await,
    )
}
