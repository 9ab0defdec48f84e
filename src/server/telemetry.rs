// Telemetry plane — one WebSocket per observer, fed from the broadcaster.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::core::broadcaster::Observer;
use crate::core::coordinator::Coordinator;

/// GET /telemetry — upgrade and stream every published message as a JSON text frame.
pub async fn telemetry_handler(ws: WebSocketUpgrade, State(coordinator): State<Coordinator>) -> Response {
    // Subscribe before the upgrade completes so nothing published after the request is missed.
    let observer = coordinator.subscribe();
    ws.on_upgrade(move |socket| serve_observer(socket, observer))
}

async fn serve_observer(socket: WebSocket, mut observer: Observer) {
    let (mut sink, mut incoming) = socket.split();
    debug!("telemetry observer connected");

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match observer.recv().await {
                Ok(e) => e,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "telemetry observer fell behind");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!("telemetry encode failed: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are ignored; this only notices the peer going away.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = incoming.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!("telemetry observer disconnected");
}
