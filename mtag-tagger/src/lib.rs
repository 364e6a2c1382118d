//! mtag-tagger library interface
//!
//! Exposes the scheduler stack and HTTP router for the binary and for
//! integration testing.

pub mod api;
pub mod config;
pub mod error;
pub mod invoker;
pub mod poller;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use mtag_common::events::EventBus;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::scheduler::TagScheduler;
use crate::store::ItemStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: TagScheduler,
    pub store: Arc<dyn ItemStore>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(scheduler: TagScheduler, store: Arc<dyn ItemStore>, event_bus: EventBus) -> Self {
        Self {
            scheduler,
            store,
            event_bus,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::item_routes())
        .merge(api::queue_routes())
        .route("/events", get(api::event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
