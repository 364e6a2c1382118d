//! Item API handlers
//!
//! POST /items/:item_id/tag, GET /items/:item_id

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    types::ItemStatus,
    AppState,
};

/// POST /items/:item_id/tag request
#[derive(Debug, Deserialize)]
pub struct TagItemRequest {
    pub payload_ref: String,
}

/// POST /items/:item_id/tag response
#[derive(Debug, Serialize)]
pub struct TagItemResponse {
    pub item_id: String,
    pub status: ItemStatus,
    /// Queue length right after this item was appended
    pub queue_position: usize,
}

/// GET /items/:item_id response
#[derive(Debug, Serialize)]
pub struct ItemStatusResponse {
    pub item_id: String,
    pub status: ItemStatus,
    pub tags: Vec<String>,
}

/// POST /items/:item_id/tag
///
/// Queue an item for tagging. Returns 202 Accepted; progress is reported
/// on the event stream. An item already queued, in flight, waiting to retry
/// or riding on a tracked job is rejected with 409.
pub async fn tag_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Json(request): Json<TagItemRequest>,
) -> ApiResult<(StatusCode, Json<TagItemResponse>)> {
    let payload_ref = request.payload_ref.trim();
    if payload_ref.is_empty() {
        return Err(ApiError::BadRequest("payload_ref must not be empty".to_string()));
    }

    let Some(queue_position) = state
        .scheduler
        .enqueue_detached(&item_id, payload_ref)
        .await
    else {
        return Err(ApiError::Conflict(format!(
            "Item {} is already being tagged",
            item_id
        )));
    };

    tracing::info!(item_id = %item_id, queue_position, "Item queued for tagging");

    Ok((
        StatusCode::ACCEPTED,
        Json(TagItemResponse {
            item_id,
            status: ItemStatus::Pending,
            queue_position,
        }),
    ))
}

/// GET /items/:item_id
pub async fn get_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
) -> ApiResult<Json<ItemStatusResponse>> {
    let Some(status) = state.store.status(&item_id).await? else {
        return Err(ApiError::NotFound(format!("Item {}", item_id)));
    };
    let tags = state.store.tags(&item_id).await?.unwrap_or_default();

    Ok(Json(ItemStatusResponse {
        item_id,
        status,
        tags,
    }))
}

/// Build item routes
pub fn item_routes() -> Router<AppState> {
    Router::new()
        .route("/items/:item_id", get(get_item))
        .route("/items/:item_id/tag", post(tag_item))
}
