//! Integration tests for the mtag-tagger HTTP API

mod helpers;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

use helpers::{harness, Harness};
use mtag_tagger::store::ItemStore;
use mtag_tagger::AppState;

fn create_test_app() -> (Router, Harness) {
    let h = harness();
    let store: Arc<dyn ItemStore> = h.store.clone();
    let state = AppState::new(h.scheduler.clone(), store, h.events.clone());
    (mtag_tagger::build_router(state), h)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _h) = create_test_app();
    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "mtag-tagger");
    assert_eq!(body["sse_clients"], 0);
}

#[tokio::test]
async fn test_tag_item_accepted_with_queue_position() {
    let (app, h) = create_test_app();

    let (status, body) = send(
        &app,
        post_json("/items/img-1/tag", json!({"payload_ref": "https://img/1.jpg"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["item_id"], "img-1");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["queue_position"], 1);

    let (_, body) = send(
        &app,
        post_json("/items/img-2/tag", json!({"payload_ref": "https://img/2.jpg"})),
    )
    .await;
    assert_eq!(body["queue_position"], 2);
    assert_eq!(h.scheduler.pending_len(), 2);
}

#[tokio::test]
async fn test_tag_item_rejects_empty_payload_ref() {
    let (app, h) = create_test_app();

    let (status, body) = send(
        &app,
        post_json("/items/img-1/tag", json!({"payload_ref": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    assert_eq!(h.scheduler.pending_len(), 0);
}

#[tokio::test]
async fn test_item_status_lookup() {
    let (app, _h) = create_test_app();

    let (status, body) = send(&app, get("/items/unknown")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    send(
        &app,
        post_json("/items/img-7/tag", json!({"payload_ref": "https://img/7.jpg"})),
    )
    .await;
    let (status, body) = send(&app, get("/items/img-7")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["tags"], json!([]));
}

#[tokio::test]
async fn test_tag_item_already_queued_is_conflict() {
    let (app, h) = create_test_app();
    let request = || post_json("/items/img-1/tag", json!({"payload_ref": "https://img/1.jpg"}));

    let (status, _) = send(&app, request()).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&app, request()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
    assert_eq!(h.scheduler.pending_len(), 1);
}

#[tokio::test]
async fn test_queue_snapshot_and_clear() {
    let (app, h) = create_test_app();
    for i in 0..3 {
        send(
            &app,
            post_json(
                &format!("/items/q{}/tag", i),
                json!({"payload_ref": format!("https://img/{}.jpg", i)}),
            ),
        )
        .await;
    }

    let (status, body) = send(&app, get("/queue")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], 3);
    assert_eq!(body["flushing"], false);
    assert_eq!(body["rate_limit_remaining_secs"], Value::Null);
    assert_eq!(body["tracked_jobs"], json!([]));

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/queue/clear")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 3);
    assert_eq!(h.scheduler.pending_len(), 0);
}
