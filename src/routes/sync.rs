use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream};
use serde_json::json;
use tokio::sync::mpsc;

use crate::events::{Subscription, SyncEvent};
use crate::models::QueueStats;
use crate::state::SharedState;

pub async fn trigger(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let online = state.service.is_online();
    let report = state.service.trigger_drain().await;

    Json(json!({
        "online": online,
        "coalesced": online && report.is_none(),
        "report": report,
    }))
}

pub async fn status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let scheduled: Vec<serde_json::Value> = state
        .service
        .scheduler()
        .pending()
        .into_iter()
        .map(|(id, at)| json!({ "id": id, "retryAt": at }))
        .collect();

    Json(json!({
        "online": state.service.is_online(),
        "draining": state.service.is_draining(),
        "stats": state.service.stats().await,
        "scheduledRetries": scheduled,
    }))
}

pub async fn stats(State(state): State<SharedState>) -> Json<QueueStats> {
    Json(state.service.stats().await)
}

/// Removes the listener once the client goes away.
struct ListenerGuard(Option<Subscription>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            subscription.unsubscribe();
        }
    }
}

pub async fn events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<SyncEvent>();
    let subscription = state.service.add_listener(move |event| {
        let _ = tx.send(event.clone());
    });

    let stream = stream::unfold(
        (rx, ListenerGuard(Some(subscription))),
        |(mut rx, guard)| async move {
            let event = rx.recv().await?;
            let sse = Event::default()
                .event(event.name())
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().event(event.name()));
            Some((Ok(sse), (rx, guard)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}
