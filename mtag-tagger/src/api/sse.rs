//! Server-Sent Events stream of scheduler activity

use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;

use crate::AppState;

/// GET /events
///
/// Streams every `TagEvent` (batches, per-item outcomes, rate limits, job
/// tracking) with a 15s heartbeat.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    mtag_common::sse::event_bus_sse_stream(&state.event_bus, "mtag-tagger")
}
