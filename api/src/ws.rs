//! Live metrics WebSocket.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{Sink, SinkExt, StreamExt};
use roadwatch_pipeline::hub::{HubEvent, SubscriberId, Subscription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AppState;

const REPLY_QUEUE: usize = 32;

/// GET /ws/metrics
pub async fn metrics_socket(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn to_text(event: &HubEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!(error = %e, "metrics event not serializable");
            None
        }
    }
}

/// Single writer for one socket. Every write must finish within `deadline`;
/// a peer that stops reading ends the connection instead of parking it.
async fn write_events<S>(
    mut sender: S,
    mut events: mpsc::Receiver<HubEvent>,
    mut replies: mpsc::Receiver<Message>,
    deadline: Duration,
    id: SubscriberId,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let message = tokio::select! {
            event = events.recv() => match event {
                Some(event) => match to_text(&event) {
                    Some(m) => m,
                    None => continue,
                },
                // Hub shut down or dropped this observer.
                None => break,
            },
            reply = replies.recv() => match reply {
                Some(m) => m,
                None => break,
            },
        };
        match tokio::time::timeout(deadline, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(subscriber = id, error = %e, "metrics socket send failed");
                break;
            }
            Err(_) => {
                warn!(subscriber = id, deadline_ms = deadline.as_millis() as u64, "metrics socket write stalled, closing");
                break;
            }
        }
    }
    let _ = tokio::time::timeout(deadline, sender.close()).await;
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let Subscription { id, receiver } = state.hub.subscribe();
    info!(subscriber = id, "metrics socket connected");

    let (sender, mut inbound) = socket.split();
    // Replies generated by the receive side (pong, heartbeat) share the
    // single writer with hub events.
    let (reply_tx, reply_rx) = mpsc::channel::<Message>(REPLY_QUEUE);

    let heartbeat = Duration::from_secs(state.config.hub.heartbeat_secs.max(1));
    let mut send_task = tokio::spawn(write_events(sender, receiver, reply_rx, heartbeat, id));

    let mut recv_task = tokio::spawn(async move {
        loop {
            let message = match tokio::time::timeout(heartbeat, inbound.next()).await {
                Err(_) => match to_text(&HubEvent::Heartbeat) {
                    Some(m) => m,
                    None => continue,
                },
                Ok(Some(Ok(Message::Text(text)))) if text.trim() == "ping" => {
                    Message::Text("pong".into())
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => {
                    debug!(subscriber = id, error = %e, "metrics socket receive failed");
                    break;
                }
            };
            if reply_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unsubscribe(id);
    info!(subscriber = id, "metrics socket disconnected");
}
