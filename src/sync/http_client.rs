//! Quota-aware HTTP client for the activity API
//!
//! [`ResilientClient`] wraps every request in a retry loop driven by a
//! [`RetryPolicy`]. Each response, whatever its status, updates the shared
//! [`QuotaTracker`] before it is classified. All waits race the shared
//! cancellation token.

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, enabled, info, trace, warn, Level};

use crate::config::SourceConfig;
use crate::error::SyncError;
use crate::models::{ActivitySummary, ActivityZone};
use crate::otel::SyncMetrics;
use crate::sync::quota::{QuotaSnapshot, QuotaTracker};
use crate::sync::retry::{AttemptOutcome, RetryDecision, RetryPolicy, RetryState};
use crate::sync::wait::cancellable_sleep;

const REDACTED_HEADERS: [&str; 3] = ["authorization", "cookie", "set-cookie"];

/// Parameters for one list page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number
    pub page: u32,
    /// Only activities starting after this Unix timestamp
    pub after: Option<i64>,
}

impl PageRequest {
    pub fn new(page: u32) -> Self {
        Self { page, after: None }
    }

    pub fn after(mut self, epoch_secs: i64) -> Self {
        self.after = Some(epoch_secs);
        self
    }
}

/// A successfully fetched list page
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub items: Vec<ActivitySummary>,
    pub quota: QuotaSnapshot,
    /// Retries spent before the final response
    pub retries: u32,
}

/// Final response of a request after retries
#[derive(Debug)]
struct FinalResponse {
    status: u16,
    retry_after: Option<u64>,
    body: Bytes,
    quota: QuotaSnapshot,
    retries: u32,
}

enum Attempt {
    Responded {
        response: Response,
        retry_after: Option<u64>,
        quota: QuotaSnapshot,
    },
    Failed(SyncError),
}

impl Attempt {
    fn outcome(&self) -> AttemptOutcome {
        match self {
            Attempt::Responded {
                response,
                retry_after,
                ..
            } => AttemptOutcome::Response {
                status: response.status().as_u16(),
                retry_after: *retry_after,
            },
            Attempt::Failed(err) => AttemptOutcome::Transport(err.clone()),
        }
    }
}

/// HTTP client with quota tracking and policy-driven retries
///
/// One instance is shared by every background task; requests are issued one
/// at a time per task.
pub struct ResilientClient {
    client: Client,
    base_url: String,
    page_size: u32,
    quota: Arc<QuotaTracker>,
    policy: Arc<dyn RetryPolicy>,
    metrics: Option<SyncMetrics>,
}

impl ResilientClient {
    /// Create a client from the source configuration
    pub fn new(
        config: &SourceConfig,
        quota: Arc<QuotaTracker>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(
            client,
            &config.base_url,
            config.page_size,
            quota,
            policy,
        ))
    }

    /// Create a client around an existing reqwest Client
    pub fn with_client(
        client: Client,
        base_url: &str,
        page_size: u32,
        quota: Arc<QuotaTracker>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size,
            quota,
            policy,
            metrics: None,
        }
    }

    /// Record request metrics
    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shared quota tracker
    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch one page of the athlete's activities
    ///
    /// A 404 is treated as an empty page.
    pub async fn fetch_page(
        &self,
        request: &PageRequest,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedPage, SyncError> {
        let mut url = format!(
            "{}/athlete/activities?page={}&per_page={}",
            self.base_url, request.page, self.page_size
        );
        if let Some(after) = request.after {
            url.push_str(&format!("&after={}", after));
        }

        let response = self.get_with_retry(&url, token, cancel).await?;
        let items = match response.status {
            404 => Vec::new(),
            _ => decode_success(&response)?,
        };

        Ok(FetchedPage {
            items,
            quota: response.quota,
            retries: response.retries,
        })
    }

    /// Fetch zone distributions for one activity
    ///
    /// A 404 means the activity has no zone data and yields an empty list.
    pub async fn fetch_zones(
        &self,
        activity_id: i64,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ActivityZone>, SyncError> {
        let url = format!("{}/activities/{}/zones", self.base_url, activity_id);

        let response = self.get_with_retry(&url, token, cancel).await?;
        match response.status {
            404 => Ok(Vec::new()),
            _ => decode_success(&response),
        }
    }

    async fn get_with_retry(
        &self,
        url: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<FinalResponse, SyncError> {
        let mut state = RetryState::new();

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            if state.attempt > 0 {
                info!(url = url, attempt = state.attempt + 1, "Retrying request");
            }

            let attempt = self.send_once(url, token, cancel).await?;
            let outcome = attempt.outcome();
            let decision = self.policy.classify(&outcome, cancel.is_cancelled());
            state.record(decision);

            match decision {
                RetryDecision::Cancel => return Err(SyncError::Cancelled),
                RetryDecision::Retry if !state.exhausted(self.policy.max_retries()) => {
                    let quota = self.quota.current().await;
                    let wait = self.policy.backoff(state.attempt, &outcome, &quota);
                    info!(
                        url = url,
                        attempt = state.attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        status = outcome.status(),
                        "Backing off before retry"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry();
                    }
                    cancellable_sleep(wait, cancel).await?;
                    state.advance();
                    continue;
                }
                RetryDecision::Retry => {
                    warn!(
                        url = url,
                        attempts = state.attempt + 1,
                        max_retries = self.policy.max_retries(),
                        "Max retries exhausted"
                    );
                }
                RetryDecision::Stop => {}
            }

            return match attempt {
                Attempt::Failed(err) => Err(err),
                Attempt::Responded {
                    response,
                    retry_after,
                    quota,
                } => {
                    let status = response.status().as_u16();
                    let body = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        body = response.bytes() => body.map_err(|e| SyncError::Network(e.to_string()))?,
                    };
                    debug!(url = url, status, body_size = body.len(), "Received response");

                    Ok(FinalResponse {
                        status,
                        retry_after,
                        body,
                        quota,
                        retries: state.attempt,
                    })
                }
            };
        }
    }

    async fn send_once(
        &self,
        url: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Attempt, SyncError> {
        let request = self.client.get(url).bearer_auth(token);

        if enabled!(Level::TRACE) {
            if let Some(headers) = request
                .try_clone()
                .and_then(|r| r.build().ok())
                .map(|r| r.headers().clone())
            {
                trace!(method = "GET", url = url, headers = %format_headers(&headers), "Request headers");
            }
        }

        let started = Instant::now();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            sent = request.send() => sent,
        };
        let elapsed = started.elapsed();

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                let err = map_transport_error(&e);
                warn!(url = url, error = %err, "Request failed");
                return Ok(Attempt::Failed(err));
            }
        };

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let quota = self
            .quota
            .update(response.headers(), status == 429, Utc::now())
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_request(elapsed, status);
        }

        trace!(
            status,
            url = url,
            headers = %format_headers(response.headers()),
            "Response headers"
        );

        if status == 429 {
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limited();
            }
            warn!(
                status,
                url = url,
                short_usage = %quota.short,
                daily_usage = %quota.daily,
                wait_for_reset_ms = quota.time_until_short_reset.as_millis() as u64,
                "Rate limited by API"
            );
        }

        Ok(Attempt::Responded {
            response,
            retry_after,
            quota,
        })
    }
}

fn decode_success<T: DeserializeOwned>(response: &FinalResponse) -> Result<T, SyncError> {
    match response.status {
        200..=299 => serde_json::from_slice(&response.body)
            .map_err(|e| SyncError::InvalidData(format!("Failed to decode response: {}", e))),
        status => Err(status_error(status, response.retry_after)),
    }
}

/// Map a final non-success status to its error
pub fn status_error(status: u16, retry_after: Option<u64>) -> SyncError {
    match status {
        401 | 403 => SyncError::Unauthorized,
        402 => SyncError::FeatureUnavailable,
        429 => SyncError::RateLimited(retry_after),
        s if s >= 500 => SyncError::ServerError(s),
        s => SyncError::UnexpectedStatus(s),
    }
}

fn map_transport_error(e: &reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::NetworkTimeout
    } else if e.is_connect() {
        SyncError::ConnectionRefused
    } else {
        SyncError::Network(e.to_string())
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Render headers for trace logs with credentials redacted
pub fn format_headers(headers: &HeaderMap) -> String {
    if headers.is_empty() {
        return "{}".to_string();
    }

    let mut keys: Vec<&str> = headers.keys().map(|k| k.as_str()).collect();
    keys.sort_unstable();
    keys.dedup();

    let rendered: Vec<String> = keys
        .into_iter()
        .map(|key| {
            let value = if REDACTED_HEADERS.contains(&key) {
                "[REDACTED]".to_string()
            } else {
                headers
                    .get_all(key)
                    .iter()
                    .map(|v| v.to_str().unwrap_or("<binary>"))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!("{}: {:?}", key, value)
        })
        .collect();

    format!("{{{}}}", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::retry::{MockRetryPolicy, QuotaAwarePolicy};
    use reqwest::header::HeaderValue;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn fast_policy(max_retries: u32) -> Arc<dyn RetryPolicy> {
        Arc::new(QuotaAwarePolicy::new(max_retries, Duration::ZERO, Duration::ZERO))
    }

    fn client_for(server: &MockServer, policy: Arc<dyn RetryPolicy>) -> ResilientClient {
        ResilientClient::with_client(
            Client::builder().timeout(TEST_TIMEOUT).build().unwrap(),
            &server.uri(),
            200,
            Arc::new(QuotaTracker::default()),
            policy,
        )
    }

    fn activities_body() -> serde_json::Value {
        serde_json::json!([
            {"id": 1, "name": "Run", "type": "Run", "start_date": "2024-01-01T08:00:00Z"},
            {"id": 2, "name": "Ride", "type": "Ride", "start_date": "2024-01-02T08:00:00Z"}
        ])
    }

    // Test 1: Page fetch sends paging params and bearer token
    #[tokio::test]
    async fn test_fetch_page_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .and(query_param("page", "1"))
            .and(query_param("per_page", "200"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(activities_body())
                    .insert_header("X-RateLimit-Limit", "200,2000")
                    .insert_header("X-RateLimit-Usage", "3,40"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(3));
        let page = client
            .fetch_page(&PageRequest::new(1), "tok", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].id, 2);
        assert_eq!(page.retries, 0);
        assert_eq!(page.quota.short.usage, 3);
        assert_eq!(client.quota().current().await.daily.limit, 2000);
    }

    // Test 2: Delta fetch adds the after parameter
    #[tokio::test]
    async fn test_fetch_page_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .and(query_param("after", "1704096000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(3));
        let page = client
            .fetch_page(
                &PageRequest::new(1).after(1704096000),
                "tok",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(page.items.is_empty());
    }

    // Test 3: 429, 429, 200 succeeds after exactly two retries
    #[tokio::test]
    async fn test_rate_limited_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(activities_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(5));
        let page = client
            .fetch_page(&PageRequest::new(1), "tok", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(page.retries, 2);
        assert_eq!(page.items.len(), 2);
    }

    // Test 4: 404 is neither retried nor an error
    #[tokio::test]
    async fn test_not_found_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activities/42/zones"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(5));
        let zones = client
            .fetch_zones(42, "tok", &CancellationToken::new())
            .await
            .unwrap();

        assert!(zones.is_empty());
    }

    // Test 5: 402 is never retried and maps to FeatureUnavailable
    #[tokio::test]
    async fn test_payment_required_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activities/42/zones"))
            .respond_with(ResponseTemplate::new(402))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(5));
        let result = client.fetch_zones(42, "tok", &CancellationToken::new()).await;

        assert_eq!(result.unwrap_err(), SyncError::FeatureUnavailable);
    }

    // Test 6: 5xx retried until exhausted, then surfaced
    #[tokio::test]
    async fn test_server_error_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(2));
        let result = client
            .fetch_page(&PageRequest::new(1), "tok", &CancellationToken::new())
            .await;

        assert_eq!(result.unwrap_err(), SyncError::ServerError(503));
    }

    // Test 7: Exhausted 429 surfaces RateLimited with the server hint
    #[tokio::test]
    async fn test_rate_limit_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activities/7/zones"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(1));
        let result = client.fetch_zones(7, "tok", &CancellationToken::new()).await;

        assert_eq!(result.unwrap_err(), SyncError::RateLimited(Some(0)));
        assert!(client.quota().current().await.is_rate_limited);
    }

    // Test 8: 401 and other 4xx stop immediately
    #[tokio::test]
    async fn test_client_errors_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activities/1/zones"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/activities/2/zones"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(5));
        let cancel = CancellationToken::new();

        assert_eq!(
            client.fetch_zones(1, "tok", &cancel).await.unwrap_err(),
            SyncError::Unauthorized
        );
        assert_eq!(
            client.fetch_zones(2, "tok", &cancel).await.unwrap_err(),
            SyncError::UnexpectedStatus(400)
        );
    }

    // Test 9: Every response updates the tracker, including errors
    #[tokio::test]
    async fn test_error_response_updates_quota() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activities/3/zones"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header("X-ReadRateLimit-Limit", "100,1000")
                    .insert_header("X-ReadRateLimit-Usage", "97,300"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(5));
        let _ = client.fetch_zones(3, "tok", &CancellationToken::new()).await;

        let snapshot = client.quota().current().await;
        assert_eq!(snapshot.short.usage, 97);
        assert!(snapshot.is_approaching_short());
    }

    // Test 10: Cancellation before sending returns Cancelled without a request
    #[tokio::test]
    async fn test_cancelled_before_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client.fetch_page(&PageRequest::new(1), "tok", &cancel).await;
        assert_eq!(result.unwrap_err(), SyncError::Cancelled);
    }

    // Test 11: Cancellation interrupts a long backoff
    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let policy = Arc::new(QuotaAwarePolicy::new(
            5,
            Duration::from_secs(600),
            Duration::from_secs(600),
        ));
        let client = client_for(&server, policy);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = client.fetch_page(&PageRequest::new(1), "tok", &cancel).await;

        assert_eq!(result.unwrap_err(), SyncError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    // Test 12: Connection failures are retried then surfaced
    #[tokio::test]
    async fn test_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ResilientClient::with_client(
            Client::builder().timeout(TEST_TIMEOUT).build().unwrap(),
            &format!("http://{}", addr),
            200,
            Arc::new(QuotaTracker::default()),
            fast_policy(1),
        );

        let result = client
            .fetch_page(&PageRequest::new(1), "tok", &CancellationToken::new())
            .await;

        assert_eq!(result.unwrap_err(), SyncError::ConnectionRefused);
    }

    // Test 13: Injected policy decides; a Stop policy never retries
    #[tokio::test]
    async fn test_injected_policy_controls_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let mut policy = MockRetryPolicy::new();
        policy
            .expect_classify()
            .times(1)
            .returning(|_, _| RetryDecision::Stop);
        policy.expect_max_retries().return_const(5u32);
        policy.expect_backoff().never();

        let client = client_for(&server, Arc::new(policy));
        let result = client
            .fetch_page(&PageRequest::new(1), "tok", &CancellationToken::new())
            .await;

        assert_eq!(result.unwrap_err(), SyncError::ServerError(503));
    }

    // Test 14: Malformed body is InvalidData
    #[tokio::test]
    async fn test_invalid_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = client_for(&server, fast_policy(0));
        let result = client
            .fetch_page(&PageRequest::new(1), "tok", &CancellationToken::new())
            .await;

        assert!(matches!(result.unwrap_err(), SyncError::InvalidData(_)));
    }

    #[test]
    fn test_format_headers_redacts_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("set-cookie", HeaderValue::from_static("session=abc"));
        headers.insert("x-ratelimit-usage", HeaderValue::from_static("1,2"));

        let rendered = format_headers(&headers);

        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("session"));
        assert!(rendered.contains("authorization: \"[REDACTED]\""));
        assert!(rendered.contains("x-ratelimit-usage: \"1,2\""));
        assert_eq!(format_headers(&HeaderMap::new()), "{}");
    }

    #[test]
    fn test_status_error_mapping() {
        assert_eq!(status_error(401, None), SyncError::Unauthorized);
        assert_eq!(status_error(403, None), SyncError::Unauthorized);
        assert_eq!(status_error(402, None), SyncError::FeatureUnavailable);
        assert_eq!(status_error(429, Some(9)), SyncError::RateLimited(Some(9)));
        assert_eq!(status_error(502, None), SyncError::ServerError(502));
        assert_eq!(status_error(418, None), SyncError::UnexpectedStatus(418));
    }
}
