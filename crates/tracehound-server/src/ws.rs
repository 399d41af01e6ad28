//! Ingestion gateway: trace producers stream event batches over a WebSocket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::StreamExt;
use serde_json::Value;
use tracehound_core::TraceEvent;
use tracing::{debug, info, warn};

use crate::ServerState;

pub async fn ingest_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    info!("Trace producer connected");

    while let Some(msg) = socket.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Ingest socket error: {}", e);
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let events = match decode_frame(&text) {
            Ok(events) => events,
            Err(e) => {
                warn!(bytes = text.len(), "Dropped undecodable trace batch: {}", e);
                continue;
            }
        };

        let outcome = state.recorder.apply_batch(events).await;
        debug!(
            applied = outcome.applied,
            failed = outcome.failed,
            anomalies = outcome.anomalies.len(),
            "Trace batch applied"
        );
        for anomaly in &outcome.anomalies {
            info!(
                trace_id = %anomaly.trace_id,
                kind = anomaly.anomaly_type.as_str(),
                severity = anomaly.severity.as_str(),
                "{}",
                anomaly.message
            );
        }
    }

    info!("Trace producer disconnected");
}

/// Decodes one frame: a JSON array of events, or a single event object.
/// Any undecodable event rejects the whole frame.
pub fn decode_frame(text: &str) -> Result<Vec<TraceEvent>, serde_json::Error> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}
