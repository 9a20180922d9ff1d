//! Live presence over WebSocket
//!
//! The server pushes [`PresenceEvent`]s as JSON text frames. A text `ping`
//! from the client is a heartbeat and is answered with `pong`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Extension;
use coedit_core::{PresenceEvent, ResourceId, UserId};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::routes::{parse_resource_id, AppState};

pub async fn presence_socket(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let resource = parse_resource_id(&id)?;
    // Reject unknown resources before upgrading
    state.coordinator.resource(&resource).await?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, resource, user)))
}

async fn handle_socket(socket: WebSocket, state: AppState, resource: ResourceId, user: UserId) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<PresenceEvent>();
    let hub = state.hub().clone();

    let connection = match hub.subscribe(&resource, &user, Arc::new(events_tx)).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(resource = %resource, user = %user, error = %e, "Presence subscription failed");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if text.as_str().trim() != "ping" {
                        tracing::debug!(resource = %resource, user = %user, "Ignoring client text frame");
                        continue;
                    }
                    if let Err(e) = hub.heartbeat(&resource, &user).await {
                        tracing::warn!(resource = %resource, user = %user, error = %e, "Heartbeat not recorded");
                    }
                    if ws_tx.send(Message::Text("pong".into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(resource = %resource, user = %user, error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            event = events_rx.recv() => {
                // A closed channel means this connection was replaced
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(resource = %resource, error = %e, "Could not encode presence event");
                    }
                }
            }
        }
    }

    hub.disconnect(&resource, &user, connection).await;
    tracing::debug!(resource = %resource, user = %user, %connection, "WebSocket closed");
}
