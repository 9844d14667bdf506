//! ws.rs
//! WebSocket subscriber transport. One axum upgrade per client; registers
//! with the fan-out hub (C6) for the lifetime of the socket and forwards
//! whatever the hub pushes into the client's outbox straight out over the
//! wire. `sensor_id = 0` in the path subscribes to every sensor.

use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::pipeline::Pipeline;

pub async fn subscribe(
    ws: WebSocketUpgrade,
    Path(sensor_id): Path<i64>,
    State(pipeline): State<Arc<Pipeline>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, pipeline, sensor_id))
}

async fn handle_socket(socket: WebSocket, pipeline: Arc<Pipeline>, sensor_id: i64) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let sub_id = Uuid::new_v4();

    if let Err(e) = pipeline.hub.connect(sub_id, sensor_id, tx).await {
        log::warn!("subscriber {sub_id} failed to connect: {e}");
        return;
    }

    let mut outbound = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("failed to encode outbound message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut outbound => break,
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(text.as_str()) {
                            let pong = json!({"type": "pong", "timestamp": Utc::now().to_rfc3339()});
                            let _ = pipeline.hub.send_personal(sub_id, pong).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("subscriber {sub_id} socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    outbound.abort();
    pipeline.hub.disconnect(sub_id).await;
}

fn is_ping(text: &str) -> bool {
    if text.trim() == "ping" {
        return true;
    }
    matches!(
        serde_json::from_str::<Value>(text),
        Ok(Value::Object(ref m)) if m.get("type").and_then(Value::as_str) == Some("ping")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_ping_matches_bare_and_json_forms() {
        assert!(is_ping("ping"));
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(!is_ping(r#"{"type":"pong"}"#));
        assert!(!is_ping("hello"));
    }
}
