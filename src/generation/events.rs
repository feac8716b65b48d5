use std::collections::HashSet;
use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use super::db::DbHandle;
use super::models::ProgressEvent;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const CHANNEL_CAPACITY: usize = 256;

/// A progress event tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub event: ProgressEvent,
}

// ── Publisher ────────────────────────────────────────────────────────

/// Broadcasts progress events and appends them to the per-session log.
/// Publishing never fails the caller: a log write error is only logged.
#[derive(Clone)]
pub struct EventPublisher {
    db: DbHandle,
    tx: broadcast::Sender<SessionEvent>,
}

impl EventPublisher {
    pub fn new(db: DbHandle) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { db, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub async fn publish(&self, session_id: &str, event: ProgressEvent) {
        let key = session_id.to_string();
        let logged = event.clone();
        if let Err(e) = self
            .db
            .call(move |db| db.append_event(&key, &logged))
            .await
        {
            tracing::warn!(session_id, error = %e, "failed to append progress event to session log");
        }

        tracing::debug!(
            session_id,
            event_type = event.event_type.as_str(),
            "publishing progress event"
        );
        // No receivers is fine.
        let _ = self.tx.send(SessionEvent {
            session_id: session_id.to_string(),
            event,
        });
    }

    /// Durable catch-up read of everything published for a session.
    pub async fn history(&self, session_id: &str) -> anyhow::Result<Vec<ProgressEvent>> {
        let key = session_id.to_string();
        self.db.call(move |db| db.list_events(&key, None)).await
    }
}

/// Wait for the next event of one session. `None` once the channel closes.
pub async fn next_session_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    session_id: &str,
) -> Option<ProgressEvent> {
    loop {
        match rx.recv().await {
            Ok(envelope) if envelope.session_id == session_id => return Some(envelope.event),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(session_id, skipped, "progress stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn session_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let events = state.events.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, events, session_id))
}

async fn handle_socket(socket: WebSocket, events: EventPublisher, session_id: String) {
    let (mut sender, receiver) = socket.split();
    // Subscribe before reading the backlog so nothing falls in between.
    let rx = events.subscribe();

    let backlog = match events.history(&session_id).await {
        Ok(backlog) => backlog,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "failed to load event backlog");
            Vec::new()
        }
    };

    let mut seen = HashSet::new();
    for event in backlog {
        let terminal = event.event_type.is_terminal();
        if send_event(&mut sender, &event).await.is_err() {
            return;
        }
        seen.insert(event.id);
        if terminal {
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    }

    run_socket_loop(sender, receiver, rx, &session_id, seen).await;
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ProgressEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize progress event");
            Ok(())
        }
    }
}

/// Forward one session's events with ping/pong keepalive until a terminal
/// event is sent, the client goes away, or no Pong arrives within
/// [`PONG_TIMEOUT`].
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<SessionEvent>,
    session_id: &str,
    seen: HashSet<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(envelope) => {
                        if envelope.session_id != session_id || seen.contains(&envelope.event.id) {
                            continue;
                        }
                        if send_event(&mut sender, &envelope.event).await.is_err() {
                            break;
                        }
                        if envelope.event.event_type.is_terminal() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
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

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::db::GenerationDb;
    use crate::generation::models::EventType;

    fn publisher() -> anyhow::Result<EventPublisher> {
        Ok(EventPublisher::new(DbHandle::new(GenerationDb::new_in_memory()?)))
    }

    #[tokio::test]
    async fn test_publish_broadcasts_and_logs() -> anyhow::Result<()> {
        let events = publisher()?;
        let mut rx = events.subscribe();

        events.publish("s-1", ProgressEvent::bot_info("Profile ready")).await;

        let received = rx.recv().await?;
        assert_eq!(received.session_id, "s-1");
        assert_eq!(received.event.text, "Profile ready");

        let history = events.history("s-1").await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], received.event);
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_still_logs() -> anyhow::Result<()> {
        let events = publisher()?;
        events.publish("s-1", ProgressEvent::done("Done")).await;
        let history = events.history("s-1").await?;
        assert_eq!(history[0].event_type, EventType::CourseGenerationDone);
        Ok(())
    }

    #[tokio::test]
    async fn test_next_session_event_filters_other_sessions() -> anyhow::Result<()> {
        let events = publisher()?;
        let mut rx = events.subscribe();
        events.publish("other", ProgressEvent::system("not mine")).await;
        events.publish("s-1", ProgressEvent::system("mine")).await;

        let event = next_session_event(&mut rx, "s-1").await.unwrap();
        assert_eq!(event.text, "mine");
        Ok(())
    }

    #[test]
    fn test_session_event_serialization() {
        let envelope = SessionEvent {
            session_id: "s-1".to_string(),
            event: ProgressEvent::error("boom"),
        };
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["session_id"], "s-1");
        assert_eq!(json["event"]["type"], "course_generation_error");
        assert_eq!(json["event"]["who"], "system");
    }

    #[test]
    fn test_keepalive_constants() {
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}
