use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::api::SharedState;
use crate::workspace::Workspace;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Streams the resolved workspace's job events as JSON text frames.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Extension(workspace): Extension<Workspace>,
) -> impl IntoResponse {
    let rx = state.events.subscribe();
    let workspace_id = workspace.id.to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, workspace_id))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<String>, workspace_id: String) {
    let (sender, receiver) = socket.split();
    tracing::debug!(workspace = %workspace_id, "Event stream opened");
    run_socket_loop(sender, receiver, rx, &workspace_id).await;
    tracing::debug!(workspace = %workspace_id, "Event stream closed");
}

#[derive(Deserialize)]
struct EventScope<'a> {
    workspace_id: &'a str,
}

/// Whether a serialized event belongs to `workspace_id`.
fn belongs_to(json: &str, workspace_id: &str) -> bool {
    serde_json::from_str::<EventScope>(json).is_ok_and(|scope| scope.workspace_id == workspace_id)
}

async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    workspace_id: &str,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if !belongs_to(&msg, workspace_id) {
                            continue;
                        }
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(workspace = %workspace_id, skipped, "Event stream lagged");
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

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_common::{JobEvent, JobEventKind, JobId};

    #[test]
    fn test_events_are_filtered_by_workspace() {
        let event = JobEvent::new("acme", JobId::new(), JobEventKind::Created);
        let json = serde_json::to_string(&event).unwrap();
        assert!(belongs_to(&json, "acme"));
        assert!(!belongs_to(&json, "globex"));
    }

    #[test]
    fn test_malformed_messages_are_dropped() {
        assert!(!belongs_to("not json", "acme"));
        assert!(!belongs_to(r#"{"type":"other"}"#, "acme"));
    }
}
