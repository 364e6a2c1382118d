//! HTTP API handlers for mtag-tagger

pub mod health;
pub mod items;
pub mod queue;
pub mod sse;

pub use health::health_routes;
pub use items::item_routes;
pub use queue::queue_routes;
pub use sse::event_stream;
