//! Remote invoker for the tag inference service
//!
//! One network call per batch. Responses are turned into a `SubmitResponse`
//! on success or a classified `SubmitError` on failure; `reconcile` then maps
//! a response back onto the batch's requests.

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{SubmitError, SubmitErrorKind};
use crate::types::{AssetRef, Batch, SubmissionMode, TagRequest};

const USER_AGENT: &str = concat!("mtag-tagger/", env!("CARGO_PKG_VERSION"));

/// Tags computed for one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemTags {
    pub asset_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Successful submit response
///
/// Sync submissions carry inline `results`; bulk submissions carry one or
/// more job ids, possibly alongside partial inline results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitResponse {
    pub results: Vec<ItemTags>,
    pub job_ids: Vec<String>,
}

/// Wire shape of a submit response body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    #[serde(default)]
    results: Option<Vec<ItemTags>>,
    #[serde(default)]
    batch_id: Option<String>,
    #[serde(default)]
    batch_ids: Option<Vec<String>>,
}

/// Wire shape of a failure body
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Wire shape of a status-check body
#[derive(Debug, Default, Deserialize)]
struct StatusBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Request body of a submit call
#[derive(Debug, Serialize)]
struct SubmitRequestBody<'a> {
    assets: &'a [AssetRef],
    mode: SubmissionMode,
}

/// Result of one status check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    NotFound,
    /// Still running, or the service reported a problem; check again later
    Pending { detail: Option<String> },
}

/// Seam between the scheduler and the inference service
#[async_trait]
pub trait TagService: Send + Sync {
    /// Submit one batch, preserving asset order
    async fn submit(
        &self,
        assets: &[AssetRef],
        mode: SubmissionMode,
    ) -> Result<SubmitResponse, SubmitError>;

    /// Check an asynchronous job once
    async fn check_status(&self, job_id: &str) -> Result<JobStatus, SubmitError>;
}

/// Parse a 2xx submit body
pub fn parse_submit_body(body: &[u8]) -> Result<SubmitResponse, SubmitError> {
    let parsed: SubmitBody = serde_json::from_slice(body)
        .map_err(|e| SubmitError::malformed(format!("Unreadable submit response: {}", e)))?;

    let mut job_ids = parsed.batch_ids.unwrap_or_default();
    if let Some(id) = parsed.batch_id {
        if !job_ids.contains(&id) {
            job_ids.insert(0, id);
        }
    }

    let results = match parsed.results {
        Some(results) => results,
        None if job_ids.is_empty() => {
            return Err(SubmitError::malformed(
                "Submit response has neither results nor batch ids",
            ))
        }
        None => Vec::new(),
    };

    Ok(SubmitResponse { results, job_ids })
}

/// Classify a non-2xx response
///
/// Decided from the HTTP status, the optional structured `code` and the
/// optional `Retry-After` hint.
pub fn classify_failure(
    status: u16,
    code: Option<&str>,
    retry_after: Option<Duration>,
) -> SubmitErrorKind {
    let code = code.map(|c| c.to_ascii_lowercase());
    let code = code.as_deref();

    let rate_limit_code = matches!(
        code,
        Some(c) if c.contains("rate_limit") || c == "too_many_requests"
    );
    if status == 429 || rate_limit_code {
        return SubmitErrorKind::RateLimited { retry_after };
    }
    if status == 404 || code == Some("not_found") {
        return SubmitErrorKind::NotFound;
    }
    if matches!(code, Some("transient" | "overloaded" | "unavailable" | "timeout")) {
        return SubmitErrorKind::TransientServer;
    }
    match status {
        408 | 500 | 502 | 503 | 504 => SubmitErrorKind::TransientServer,
        s if s >= 500 && s != 501 => SubmitErrorKind::TransientServer,
        _ => SubmitErrorKind::NonRetryable,
    }
}

/// `Retry-After` in whole seconds; HTTP-date forms are ignored
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// A response mapped back onto the batch
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Requests resolved inline, with their tags
    pub tagged: Vec<(TagRequest, Vec<String>)>,
    /// Requests now riding on asynchronous jobs
    pub awaiting_jobs: Vec<TagRequest>,
    pub job_ids: Vec<String>,
}

/// Match response results to requests by asset id
///
/// Without job ids, a request missing from the results counts as a success
/// with no tags (logged as an anomaly). With job ids, missing requests are
/// expected and ride on the jobs.
pub fn reconcile(batch: Batch, response: SubmitResponse) -> Reconciliation {
    let mut by_id: HashMap<String, Vec<String>> = response
        .results
        .into_iter()
        .map(|r| (r.asset_id, r.tags))
        .collect();

    let has_jobs = !response.job_ids.is_empty();
    let mut out = Reconciliation {
        job_ids: response.job_ids,
        ..Default::default()
    };

    for request in batch.requests {
        match by_id.remove(&request.item_id) {
            Some(tags) => out.tagged.push((request, tags)),
            None if has_jobs => out.awaiting_jobs.push(request),
            None => {
                warn!(
                    item_id = %request.item_id,
                    "Item missing from inline results, treating as tagged with no tags"
                );
                out.tagged.push((request, Vec::new()));
            }
        }
    }

    for stray in by_id.keys() {
        debug!(asset_id = %stray, "Ignoring result for asset not in batch");
    }

    out
}

/// reqwest implementation of `TagService`
pub struct HttpTagService {
    http_client: reqwest::Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    endpoint: String,
    status_endpoint: String,
    api_key: String,
}

impl HttpTagService {
    /// Build the client
    ///
    /// A missing endpoint or API key is a configuration error: fatal, surfaced
    /// once at startup.
    pub fn new(config: &ServiceConfig) -> mtag_common::Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                mtag_common::Error::Config(format!(
                    "Inference endpoint not configured. Set [service] endpoint or {}",
                    crate::config::ENDPOINT_ENV
                ))
            })?
            .trim_end_matches('/')
            .to_string();

        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                mtag_common::Error::Config(format!(
                    "Inference API key not configured. Set [service] api_key or {}",
                    crate::config::API_KEY_ENV
                ))
            })?
            .to_string();

        let status_endpoint = config
            .status_endpoint
            .as_deref()
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("{}/status", endpoint));

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()
            .map_err(|e| mtag_common::Error::Config(format!("HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            http_client,
            rate_limiter,
            endpoint,
            status_endpoint,
            api_key,
        })
    }

    async fn failure_from(response: reqwest::Response) -> SubmitError {
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response.bytes().await.unwrap_or_default();
        let error_body: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();

        let kind = classify_failure(status, error_body.code.as_deref(), retry_after);
        let message = error_body
            .message
            .or_else(|| error_body.error.map(|e| e.to_string()))
            .unwrap_or_else(|| format!("HTTP {}", status));

        SubmitError::new(kind, message)
    }
}

#[async_trait]
impl TagService for HttpTagService {
    async fn submit(
        &self,
        assets: &[AssetRef],
        mode: SubmissionMode,
    ) -> Result<SubmitResponse, SubmitError> {
        self.rate_limiter.until_ready().await;

        debug!(batch_size = assets.len(), %mode, "Submitting batch to inference service");

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&SubmitRequestBody { assets, mode })
            .send()
            .await
            .map_err(|e| SubmitError::network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::failure_from(response).await);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SubmitError::network(e.to_string()))?;
        let parsed = parse_submit_body(&body)?;

        info!(
            batch_size = assets.len(),
            results = parsed.results.len(),
            jobs = parsed.job_ids.len(),
            "Inference service accepted batch"
        );
        Ok(parsed)
    }

    async fn check_status(&self, job_id: &str) -> Result<JobStatus, SubmitError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/{}", self.status_endpoint, job_id);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| SubmitError::network(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Ok(JobStatus::NotFound);
        }
        if !response.status().is_success() {
            return Err(Self::failure_from(response).await);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SubmitError::network(e.to_string()))?;
        let status: StatusBody = serde_json::from_slice(&body)
            .map_err(|e| SubmitError::malformed(format!("Unreadable status response: {}", e)))?;

        if status.success {
            Ok(JobStatus::Completed)
        } else {
            Ok(JobStatus::Pending {
                detail: status.error.map(|e| e.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_by_status() {
        assert_eq!(
            classify_failure(429, None, Some(Duration::from_secs(60))),
            SubmitErrorKind::RateLimited {
                retry_after: Some(Duration::from_secs(60))
            }
        );
        assert_eq!(classify_failure(404, None, None), SubmitErrorKind::NotFound);
        assert_eq!(classify_failure(503, None, None), SubmitErrorKind::TransientServer);
        assert_eq!(classify_failure(408, None, None), SubmitErrorKind::TransientServer);
        assert_eq!(classify_failure(501, None, None), SubmitErrorKind::NonRetryable);
        assert_eq!(classify_failure(400, None, None), SubmitErrorKind::NonRetryable);
        assert_eq!(classify_failure(401, None, None), SubmitErrorKind::NonRetryable);
    }

    #[test]
    fn test_structured_code_takes_precedence() {
        assert_eq!(
            classify_failure(400, Some("RATE_LIMIT_EXCEEDED"), None),
            SubmitErrorKind::RateLimited { retry_after: None }
        );
        assert_eq!(
            classify_failure(400, Some("overloaded"), None),
            SubmitErrorKind::TransientServer
        );
        assert_eq!(
            classify_failure(422, Some("not_found"), None),
            SubmitErrorKind::NotFound
        );
    }

    #[test]
    fn test_retry_after_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("45"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(45)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_parse_sync_and_bulk_bodies() {
        let sync = parse_submit_body(br#"{"results":[{"assetId":"a","tags":["dog"]}]}"#).unwrap();
        assert_eq!(sync.results.len(), 1);
        assert!(sync.job_ids.is_empty());

        let bulk = parse_submit_body(br#"{"batchId":"job-1"}"#).unwrap();
        assert_eq!(bulk.job_ids, vec!["job-1".to_string()]);
        assert!(bulk.results.is_empty());

        let multi =
            parse_submit_body(br#"{"batchIds":["j1","j2"],"results":[{"assetId":"x"}]}"#).unwrap();
        assert_eq!(multi.job_ids, vec!["j1".to_string(), "j2".to_string()]);
        assert_eq!(multi.results[0].tags, Vec::<String>::new());
    }

    #[test]
    fn test_unreadable_body_is_malformed() {
        let err = parse_submit_body(b"<html>oops</html>").unwrap_err();
        assert_eq!(err.kind, SubmitErrorKind::MalformedResponse);

        let err = parse_submit_body(b"{}").unwrap_err();
        assert_eq!(err.kind, SubmitErrorKind::MalformedResponse);
    }

    fn batch_of(ids: &[&str]) -> Batch {
        Batch {
            mode: SubmissionMode::Sync,
            requests: ids
                .iter()
                .map(|id| TagRequest::detached(*id, format!("https://img/{}", id)))
                .collect(),
        }
    }

    #[test]
    fn test_reconcile_missing_item_defaults_to_empty_tags() {
        let response = SubmitResponse {
            results: vec![ItemTags {
                asset_id: "a".to_string(),
                tags: vec!["cat".to_string()],
            }],
            job_ids: vec![],
        };
        let out = reconcile(batch_of(&["a", "b"]), response);

        assert_eq!(out.tagged.len(), 2);
        assert_eq!(out.tagged[0].0.item_id, "a");
        assert_eq!(out.tagged[0].1, vec!["cat".to_string()]);
        assert_eq!(out.tagged[1].0.item_id, "b");
        assert!(out.tagged[1].1.is_empty());
        assert!(out.awaiting_jobs.is_empty());
    }

    #[test]
    fn test_reconcile_with_jobs_routes_missing_items_to_jobs() {
        let response = SubmitResponse {
            results: vec![ItemTags {
                asset_id: "b".to_string(),
                tags: vec!["tree".to_string()],
            }],
            job_ids: vec!["job-9".to_string()],
        };
        let out = reconcile(batch_of(&["a", "b", "c"]), response);

        assert_eq!(out.tagged.len(), 1);
        assert_eq!(out.tagged[0].0.item_id, "b");
        let waiting: Vec<_> = out.awaiting_jobs.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(waiting, vec!["a", "c"]);
        assert_eq!(out.job_ids, vec!["job-9".to_string()]);
    }

    #[test]
    fn test_missing_configuration_is_fatal() {
        let config = ServiceConfig::default();
        assert!(matches!(
            HttpTagService::new(&config),
            Err(mtag_common::Error::Config(_))
        ));

        let config = ServiceConfig {
            endpoint: Some("http://127.0.0.1:9/tag".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            HttpTagService::new(&config),
            Err(mtag_common::Error::Config(_))
        ));
    }
}
