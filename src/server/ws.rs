use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::api::SharedState;
use crate::lifecycle::LifecycleEvent;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let rx = state.orchestrator.subscribe();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, shutdown))
}

async fn handle_socket(
    socket: WebSocket,
    rx: broadcast::Receiver<LifecycleEvent>,
    shutdown: CancellationToken,
) {
    let (sender, receiver) = socket.split();
    tracing::debug!("websocket subscriber connected");
    run_socket_loop(sender, receiver, rx, shutdown).await;
    tracing::debug!("websocket subscriber disconnected");
}

/// Serialize an event into the text frame sent to subscribers.
pub fn encode_event(event: &LifecycleEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize lifecycle event");
            None
        }
    }
}

/// Forward lifecycle events to one client until it goes away.
///
/// A client that misses [`PONG_TIMEOUT`] worth of pongs is dropped. A
/// subscriber that falls behind the channel skips the events it missed
/// and carries on from the newest.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<LifecycleEvent>,
    shutdown: CancellationToken,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket subscriber missed pong deadline");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let Some(json) = encode_event(&event) else { continue };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "websocket subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
