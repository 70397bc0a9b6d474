use crate::dispatch;
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracy_core::{NewRequest, NewTracerEvent};
use tracy_tracer::{ErrorEnvelope, TracerError, TracerService};

const MAX_FRAME_BYTES: usize = 256 * 1024;
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    r#type: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct TracerIdPayload {
    tracer_id: i64,
}

#[derive(Debug, Deserialize)]
struct GeneratePayload {
    tracer_string: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct AddEventPayload {
    tracer_id: i64,
    event: NewTracerEvent,
}

/// Route layer for `/ws`: peers outside the loopback range get 403 before
/// the upgrade is attempted.
pub async fn loopback_only(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !addr.ip().is_loopback() {
        warn!(event = "ws_rejected", remote = %addr);
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(service): State<Arc<TracerService>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(service, socket, addr).await;
    })
}

async fn handle_socket(service: Arc<TracerService>, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            if tokio::time::timeout(WRITE_TIMEOUT, send).await.is_err() {
                return;
            }
        }
    });

    info!(event = "ws_connected", remote = %remote);
    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "ws_read_error", remote = %remote, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "ws_client_close", remote = %remote);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        let Some(reply) = handle_frame(&service, remote, &data).await else {
            continue;
        };
        if tx.send(Message::Text(reply)).await.is_err() {
            break;
        }
    }

    drop(tx);
    let _ = write_task.await;
}

/// Decodes one frame, runs the operation it names and encodes the reply.
/// Frames over `MAX_FRAME_BYTES` are dropped without a reply.
async fn handle_frame(
    service: &Arc<TracerService>,
    remote: SocketAddr,
    data: &[u8],
) -> Option<String> {
    if data.len() > MAX_FRAME_BYTES {
        warn!(event = "ws_frame_too_large", remote = %remote, size = data.len());
        return None;
    }
    debug!(event = "ws_frame", remote = %remote, size = data.len());

    let frame: Frame = match serde_json::from_slice(data) {
        Ok(value) => value,
        Err(err) => {
            let envelope = dispatch::reject(&TracerError::Decode(err.to_string()));
            return Some(error_reply(None, &envelope));
        }
    };

    let result = match run_frame(service, &frame).await {
        Ok(body) => serde_json::from_slice::<Value>(&body)
            .map_err(|err| dispatch::reject(&TracerError::Serialization(err.to_string()))),
        Err(envelope) => Err(envelope),
    };
    let reply = match result {
        Ok(payload) => serde_json::json!({
            "type": "result",
            "request_id": frame.request_id,
            "payload": payload,
        })
        .to_string(),
        Err(envelope) => error_reply(frame.request_id.as_deref(), &envelope),
    };
    Some(reply)
}

async fn run_frame(service: &Arc<TracerService>, frame: &Frame) -> Result<Vec<u8>, ErrorEnvelope> {
    match frame.r#type.as_str() {
        "add_tracer" => {
            let request: NewRequest = decode_payload(&frame.payload)?;
            dispatch::call(service, move |svc| svc.add_tracer(request)).await
        }
        "get_tracer" => {
            let TracerIdPayload { tracer_id } = decode_payload(&frame.payload)?;
            dispatch::call(service, move |svc| svc.get_tracer(tracer_id)).await
        }
        "get_tracers" => dispatch::call(service, |svc| svc.get_tracers()).await,
        "generate_tracer" => {
            let GeneratePayload { tracer_string, url } = decode_payload(&frame.payload)?;
            dispatch::call(service, move |svc| svc.generate_tracer(&tracer_string, &url)).await
        }
        "add_event" => {
            let AddEventPayload { tracer_id, event } = decode_payload(&frame.payload)?;
            dispatch::call(service, move |svc| svc.add_event(tracer_id, event)).await
        }
        "get_events" => {
            let TracerIdPayload { tracer_id } = decode_payload(&frame.payload)?;
            dispatch::call(service, move |svc| svc.get_events(tracer_id)).await
        }
        other => Err(dispatch::reject(&TracerError::Decode(format!(
            "unknown message type {other:?}"
        )))),
    }
}

fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &Value) -> Result<T, ErrorEnvelope> {
    serde_json::from_value(payload.clone())
        .map_err(|err| dispatch::reject(&TracerError::Decode(err.to_string())))
}

fn error_reply(request_id: Option<&str>, envelope: &ErrorEnvelope) -> String {
    serde_json::json!({
        "type": "error",
        "request_id": request_id,
        "payload": envelope,
    })
    .to_string()
}
