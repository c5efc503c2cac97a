//! One websocket subscriber. The protocol is push-only: the hub writes block messages, and
//! anything the client sends is read and discarded.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::routes::AppState;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let subscriber_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound, mut queue) = mpsc::channel::<String>(state.subscriber_buffer);

    state.hub.attach(subscriber_id, outbound);
    counter!("lookout_subscribers_connected_total", 1);
    info!(subscriber_id = %subscriber_id, "subscriber connected");

    let writer = tokio::spawn(async move {
        while let Some(payload) = queue.recv().await {
            if ws_tx.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        debug!(subscriber_id = %subscriber_id, "writer task finished");
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Close(frame)) => {
                info!(
                    subscriber_id = %subscriber_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "subscriber closed websocket"
                );
                break;
            }
            Ok(Message::Text(text)) => {
                debug!(
                    subscriber_id = %subscriber_id,
                    bytes = text.len(),
                    "ignoring inbound text frame"
                );
            }
            Ok(Message::Binary(data)) => {
                debug!(
                    subscriber_id = %subscriber_id,
                    bytes = data.len(),
                    "ignoring inbound binary frame"
                );
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    subscriber_id = %subscriber_id,
                    error = %err,
                    "error receiving from subscriber"
                );
                break;
            }
        }
    }

    state.hub.detach(subscriber_id);
    writer.abort();
    info!(subscriber_id = %subscriber_id, "subscriber disconnected");
}
