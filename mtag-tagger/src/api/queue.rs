//! Queue inspection and control
//!
//! GET /queue, POST /queue/clear

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::{scheduler::QueueSnapshot, AppState};

/// POST /queue/clear response
#[derive(Debug, Serialize)]
pub struct ClearQueueResponse {
    pub cleared: usize,
}

/// GET /queue
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.scheduler.snapshot())
}

/// POST /queue/clear
///
/// Abandons unflushed items. In-flight batches, scheduled retries and
/// tracked jobs continue.
pub async fn clear_queue(State(state): State<AppState>) -> Json<ClearQueueResponse> {
    let cleared = state.scheduler.clear_pending();
    Json(ClearQueueResponse { cleared })
}

/// Build queue routes
pub fn queue_routes() -> Router<AppState> {
    Router::new()
        .route("/queue", get(queue_status))
        .route("/queue/clear", post(clear_queue))
}
