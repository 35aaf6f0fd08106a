//! Server-sent event stream
//!
//! `GET /api/events` multiplexes supervisor lifecycle events, master-side
//! node state changes and a periodic `heartbeat` event onto one SSE
//! stream. A keepalive comment goes out every 15 seconds; the `heartbeat`
//! event every 30.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use tracing::debug;

use crate::cluster::NodeEvent;
use crate::supervisor::ProcessEvent;

use super::state::AppState;

/// Keepalive comment cadence
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `heartbeat` event cadence
const HEARTBEAT_EVENT_INTERVAL: Duration = Duration::from_secs(30);

/// GET /api/events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded::<Event>();

    // Supervisor lifecycle events.
    {
        let mut events = state.node.supervisor().events();
        let mut tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if tx.send(process_event(event)).await.is_err() {
                    return;
                }
            }
        });
    }

    // Master-side node state changes.
    if let Some(manager) = state.node.manager() {
        let mut events = manager.subscribe_events();
        let mut tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if tx.send(node_event(event)).await.is_err() {
                    return;
                }
            }
        });
    }

    // Periodic heartbeat event.
    {
        let node = state.node.clone();
        let mut tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_EVENT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let info = node.info().await;
                let event = Event::default().event("heartbeat").data(
                    serde_json::json!({
                        "nodeId": info.id,
                        "state": info.state,
                        "timestamp": Utc::now(),
                    })
                    .to_string(),
                );
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
    }

    debug!("SSE subscriber attached");
    Sse::new(rx.map(Ok::<_, Infallible>))
        .keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
}

fn process_event(event: ProcessEvent) -> Event {
    match event {
        ProcessEvent::Started {
            model_id,
            pid,
            port,
        } => Event::default().event("modelLoadStart").data(
            serde_json::json!({ "modelId": model_id, "pid": pid, "port": port }).to_string(),
        ),
        ProcessEvent::Ready { model_id, port } => Event::default()
            .event("modelLoad")
            .data(serde_json::json!({ "modelId": model_id, "port": port }).to_string()),
        ProcessEvent::Exited {
            model_id,
            exit_code,
            expected,
        } => Event::default().event("modelStop").data(
            serde_json::json!({
                "modelId": model_id,
                "exitCode": exit_code,
                "expected": expected,
            })
            .to_string(),
        ),
    }
}

fn node_event(event: NodeEvent) -> Event {
    Event::default()
        .event("systemStatus")
        .data(serde_json::to_string(&event).unwrap_or_default())
}
