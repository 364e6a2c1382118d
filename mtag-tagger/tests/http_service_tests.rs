//! `HttpTagService` against a throwaway local HTTP server

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mtag_tagger::config::ServiceConfig;
use mtag_tagger::error::SubmitErrorKind;
use mtag_tagger::invoker::{HttpTagService, JobStatus, TagService};
use mtag_tagger::types::{AssetRef, SubmissionMode};

/// Last request seen by the fake service
#[derive(Clone, Default)]
struct Captured {
    inner: Arc<Mutex<Option<(String, Value)>>>,
}

async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client_for(base: &str) -> HttpTagService {
    HttpTagService::new(&ServiceConfig {
        endpoint: Some(format!("{}/tag", base)),
        api_key: Some("secret-key".to_string()),
        requests_per_second: 100,
        ..Default::default()
    })
    .unwrap()
}

fn assets() -> Vec<AssetRef> {
    vec![
        AssetRef {
            asset_id: "a".to_string(),
            image_url: "https://img/a.jpg".to_string(),
        },
        AssetRef {
            asset_id: "b".to_string(),
            image_url: "https://img/b.jpg".to_string(),
        },
    ]
}

async fn fixed(
    status: StatusCode,
    headers: Vec<(&'static str, &'static str)>,
    body: Value,
) -> String {
    let app = Router::new().route(
        "/tag",
        post(move || {
            let headers = headers.clone();
            let body = body.clone();
            async move {
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.insert(name, value.parse().unwrap());
                }
                (status, map, Json(body))
            }
        }),
    );
    spawn_server(app).await
}

#[tokio::test]
async fn test_sync_submit_sends_assets_and_reads_inline_results() {
    let captured = Captured::default();

    async fn handler(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        *captured.inner.lock().unwrap() = Some((auth, body));
        Json(json!({
            "results": [
                {"assetId": "a", "tags": ["dog", "park"]},
                {"assetId": "b", "tags": []}
            ]
        }))
    }

    let app = Router::new()
        .route("/tag", post(handler))
        .with_state(captured.clone());
    let base = spawn_server(app).await;

    let response = client_for(&base)
        .submit(&assets(), SubmissionMode::Sync)
        .await
        .unwrap();
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].tags, vec!["dog".to_string(), "park".to_string()]);
    assert!(response.job_ids.is_empty());

    let (auth, body) = captured.inner.lock().unwrap().clone().unwrap();
    assert_eq!(auth, "Bearer secret-key");
    assert_eq!(body["mode"], "sync");
    assert_eq!(body["assets"][0]["assetId"], "a");
    assert_eq!(body["assets"][1]["imageUrl"], "https://img/b.jpg");
}

#[tokio::test]
async fn test_bulk_submit_returns_job_id() {
    let base = fixed(StatusCode::ACCEPTED, vec![], json!({"batchId": "job-42"})).await;
    let response = client_for(&base)
        .submit(&assets(), SubmissionMode::Bulk)
        .await
        .unwrap();
    assert_eq!(response.job_ids, vec!["job-42".to_string()]);
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after_hint() {
    let base = fixed(
        StatusCode::TOO_MANY_REQUESTS,
        vec![("retry-after", "42")],
        json!({"message": "slow down"}),
    )
    .await;
    let err = client_for(&base)
        .submit(&assets(), SubmissionMode::Sync)
        .await
        .unwrap_err();
    assert_eq!(
        err.kind,
        SubmitErrorKind::RateLimited {
            retry_after: Some(Duration::from_secs(42))
        }
    );
    assert_eq!(err.message, "slow down");
}

#[tokio::test]
async fn test_failure_statuses_are_classified() {
    let cases = [
        (StatusCode::SERVICE_UNAVAILABLE, json!({}), SubmitErrorKind::TransientServer),
        (StatusCode::NOT_FOUND, json!({}), SubmitErrorKind::NotFound),
        (
            StatusCode::BAD_REQUEST,
            json!({"code": "invalid_image"}),
            SubmitErrorKind::NonRetryable,
        ),
        (
            StatusCode::BAD_REQUEST,
            json!({"code": "rate_limit_exceeded"}),
            SubmitErrorKind::RateLimited { retry_after: None },
        ),
    ];

    for (status, body, expected) in cases {
        let base = fixed(status, vec![], body).await;
        let err = client_for(&base)
            .submit(&assets(), SubmissionMode::Sync)
            .await
            .unwrap_err();
        assert_eq!(err.kind, expected, "status {}", status);
    }
}

#[tokio::test]
async fn test_unreadable_success_body_is_malformed() {
    let base = fixed(StatusCode::OK, vec![], json!({"unexpected": true})).await;
    let err = client_for(&base)
        .submit(&assets(), SubmissionMode::Sync)
        .await
        .unwrap_err();
    assert_eq!(err.kind, SubmitErrorKind::MalformedResponse);
}

#[tokio::test]
async fn test_unreachable_service_is_network_error() {
    // Grab a free port, then close it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client_for(&format!("http://{}", addr))
        .submit(&assets(), SubmissionMode::Sync)
        .await
        .unwrap_err();
    assert_eq!(err.kind, SubmitErrorKind::Network);
    assert!(err.kind.is_retryable());
}

#[tokio::test]
async fn test_status_checks() {
    async fn status(Path(job_id): Path<String>) -> axum::response::Response {
        match job_id.as_str() {
            "done" => Json(json!({"success": true})).into_response(),
            "busy" => {
                Json(json!({"success": false, "error": "still processing"})).into_response()
            }
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    let app = Router::new().route("/tag/status/:job_id", get(status));
    let base = spawn_server(app).await;
    let client = client_for(&base);

    assert_eq!(client.check_status("done").await.unwrap(), JobStatus::Completed);
    assert_eq!(client.check_status("missing").await.unwrap(), JobStatus::NotFound);
    assert!(matches!(
        client.check_status("busy").await.unwrap(),
        JobStatus::Pending { detail: Some(_) }
    ));
}
