//! Server-sent event feed bridging the in-process bus to clients.
//!
//! Delivery is best-effort: the bus does not buffer, and a feed that falls
//! away simply stops receiving. Clients pick a channel (`global`,
//! `workflow:<id>`, `agent:<id>`); events not on that channel are skipped.

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub channel: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/events", get(event_stream))
}

async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<UnboundedReceiverStream<Result<SseEvent, std::convert::Infallible>>> {
    let channel = query.channel.unwrap_or_else(|| "global".to_string());
    let (tx, rx) = mpsc::unbounded_channel();

    let hello = SseEvent::default().event("connected").data(
        json!({ "channel": channel, "server": env!("CARGO_PKG_NAME") }).to_string(),
    );
    let _ = tx.send(Ok(hello));

    // The subscription stays registered on the bus for the process
    // lifetime; once the client goes away the send fails and the closure
    // becomes a no-op.
    state.store.events().subscribe(move |event| {
        if !event.channels().contains(&channel) {
            return;
        }
        let payload = json!({
            "type": event.event_type.as_str(),
            "data": event.data,
        });
        let _ = tx.send(Ok(SseEvent::default()
            .event(event.event_type.as_str())
            .data(payload.to_string())));
    });

    Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}
