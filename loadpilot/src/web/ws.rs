//! WebSocket subscription to a run's event stream
//!
//! A client connects with `?after=N` to replay the persisted log from
//! sequence N+1 and then receive live events. The backlog and the live
//! receiver are taken atomically, so the switch is exactly-once. A
//! client that falls behind the bounded channel is disconnected and
//! expected to reconnect with a replay from its last acknowledged seq.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::events::StreamEvent;

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    /// Last sequence number the client has already seen
    #[serde(default)]
    pub after: u64,
}

/// WS /ws/runs/:run_id?after=N
pub async fn run_events_handler(
    ws: WebSocketUpgrade,
    Path(run_id): Path<String>,
    Query(query): Query<SubscribeQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, run_id, query.after, state))
}

async fn handle_socket(socket: WebSocket, run_id: String, after: u64, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    if state.db.get_run(&run_id).ok().flatten().is_none() {
        let _ = sender
            .send(Message::Text(
                r#"{"error":"run not found"}"#.to_string().into(),
            ))
            .await;
        return;
    }

    let (backlog, mut rx) = match state.door.subscribe(&run_id, after) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Failed to subscribe");
            return;
        }
    };

    for event in backlog {
        if send_event(&mut sender, &event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id = %run_id, skipped, "Subscriber lagged, dropping connection");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Err(RecvError::Closed) => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(run_id = %run_id, "WebSocket closed by client");
                    break;
                }
                Some(Err(_)) => break,
                _ => {}
            },
        }
    }
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &StreamEvent,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize event");
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}
