//! Request pipeline for the endpoint-protection API.
//!
//! [`ApiClient::execute`] is the single path every API call takes. Each
//! attempt runs:
//!
//! 1. rate-limiter admission,
//! 2. credential attach (refreshing through the session if needed),
//! 3. transport send,
//! 4. classification: 2xx → success, 429 → `RateLimited`, anything else →
//!    `Api` with the body preserved.
//!
//! The retry executor wraps the whole attempt, so a 429 or 5xx repeats
//! admission and credential checks too. A 401 drops the cached credential
//! so the following request re-authenticates; the 401 itself is returned
//! to the caller like any other client error.
//!
//! All mutable state (bucket, credential cache) is owned by the client
//! instance; share it across tasks with `Arc` or by reference.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::audit::{AuditEvent, AuditLogger};
use crate::auth::{ClientCredentials, SessionManager};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{EppError, Result};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};

/// One logical API call, relative to the client's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the base URL, without a leading slash.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// GET `path`.
    pub fn get(path: impl Into<String>) -> Self {
        ApiRequest {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// POST `path` with an optional JSON body.
    pub fn post(path: impl Into<String>, body: Option<serde_json::Value>) -> Self {
        ApiRequest {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body,
        }
    }

    /// Appends a query parameter.
    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

/// Authenticated, rate-limited, retrying client.
pub struct ApiClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    session: SessionManager,
    limiter: RateLimiter,
    retry: RetryPolicy,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
}

impl ApiClient {
    /// Starts a builder for a client rooted at `base_url`.
    pub fn builder(base_url: &str) -> ApiClientBuilder {
        ApiClientBuilder::new(base_url)
    }

    /// Builds a production client from validated configuration.
    pub fn from_config(config: &Config, secret_override: Option<&str>) -> Result<Self> {
        let credentials = config.client_credentials(secret_override)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let client_id = &config.credentials.client_id;
        let audit = AuditLogger::from_config(&config.audit, client_id, clock.clone())?;
        ApiClient::builder(&config.base_url())
            .credentials(credentials)
            .rate_limit(config.rate_limit.clone())
            .retry((&config.retry).into())
            .audit(audit)
            .clock(clock)
            .build()
    }

    /// Runs `request` through admission, auth, transport and retry.
    pub async fn execute(&self, request: &ApiRequest) -> Result<TransportResponse> {
        let url = self.url_for(request)?;
        let body = match &request.body {
            Some(value) => Some(Bytes::from(serde_json::to_vec(value)?)),
            None => None,
        };
        execute_with_retry(&self.retry, &self.limiter, self.clock.as_ref(), |_| {
            self.attempt(&request.method, &url, body.clone())
        })
        .await
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        body: Option<Bytes>,
    ) -> Result<TransportResponse> {
        self.limiter.acquire(1.0).await;
        let credential = self
            .session
            .ensure_valid_credential(self.transport.as_ref())
            .await?;

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.access_token()))
            .map_err(|e| EppError::Auth {
                message: "access token is not a valid header value".to_string(),
                source: Some(Box::new(e)),
            })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let response = self
            .transport
            .send(TransportRequest {
                method: method.clone(),
                url: url.to_string(),
                headers,
                body,
            })
            .await?;

        if response.status == StatusCode::UNAUTHORIZED {
            self.session.invalidate_token(credential.access_token()).await;
        }
        classify(response)
    }

    /// Executes `request` and deserializes the JSON response.
    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let response = self.execute(request).await?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// GET `path` and deserialize the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(&ApiRequest::get(path)).await
    }

    /// POST a JSON body to `path` and deserialize the JSON response.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)?;
        self.send_json(&ApiRequest::post(path, Some(body))).await
    }

    /// Writes an audit entry for a finished operation.
    pub fn audit_result<T>(&self, event: AuditEvent, result: &Result<T>) {
        let event = match result {
            Ok(_) => event,
            Err(err) => event.failed(err),
        };
        self.audit.record(event);
    }

    /// The audit logger shared by this client.
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// The client's clock.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The client's rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The client's session.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    fn url_for(&self, request: &ApiRequest) -> Result<String> {
        let raw = format!("{}{}", self.base_url, request.path.trim_start_matches('/'));
        let mut url = Url::parse(&raw)
            .map_err(|e| EppError::InvalidInput(format!("invalid request URL {raw}: {e}")))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url.into())
    }
}

/// Maps a raw response onto success, `RateLimited` or `Api`.
fn classify(response: TransportResponse) -> Result<TransportResponse> {
    if response.status.is_success() {
        return Ok(response);
    }
    let body = response.text();
    if response.status == StatusCode::TOO_MANY_REQUESTS {
        return Err(EppError::RateLimited {
            retry_after: retry_after(&response.headers),
            body,
        });
    }
    Err(EppError::Api {
        status: response.status,
        code: error_code(&body),
        body,
    })
}

/// Longest server-supplied wait the pipeline will honor.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parses a `Retry-After` header given in seconds, capped at
/// [`MAX_RETRY_AFTER`].
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| !secs.is_nan() && *secs >= 0.0)?;
    Some(Duration::try_from_secs_f64(secs).map_or(MAX_RETRY_AFTER, |d| d.min(MAX_RETRY_AFTER)))
}

/// Extracts `error.code` or a top-level `code` from a JSON error body.
fn error_code(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/code")
        .or_else(|| value.get("code"))
        .and_then(|code| match code {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Assembles an [`ApiClient`]. Unset parts fall back to production
/// defaults: reqwest transport, system clock, disabled audit.
pub struct ApiClientBuilder {
    base_url: String,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<ClientCredentials>,
    bearer_token: Option<String>,
    rate_limit: RateLimitConfig,
    retry: RetryPolicy,
    audit: Option<AuditLogger>,
    clock: Arc<dyn Clock>,
}

impl ApiClientBuilder {
    fn new(base_url: &str) -> Self {
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        ApiClientBuilder {
            base_url,
            transport: None,
            credentials: None,
            bearer_token: None,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            audit: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Client identity for credential exchanges.
    pub fn credentials(mut self, credentials: ClientCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Fixed bearer token; skips the credential exchange.
    pub fn bearer_token(mut self, token: &str) -> Self {
        self.bearer_token = Some(token.to_string());
        self
    }

    /// Custom transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Rate-limit parameters.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// Retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Audit logger.
    pub fn audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Clock shared by every component.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Finishes the client. Needs either credentials or a bearer token.
    pub fn build(self) -> Result<ApiClient> {
        let clock = self.clock;
        let audit = Arc::new(
            self.audit
                .unwrap_or_else(|| AuditLogger::disabled(clock.clone())),
        );
        let session = match (self.bearer_token, self.credentials) {
            (Some(token), _) => SessionManager::with_token(&token, clock.clone(), audit.clone()),
            (None, Some(credentials)) => {
                SessionManager::new(credentials, clock.clone(), audit.clone())
            }
            (None, None) => {
                return Err(EppError::Config(
                    "client needs credentials or a bearer token".into(),
                ));
            }
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        Ok(ApiClient {
            base_url: self.base_url,
            transport,
            session,
            limiter: RateLimiter::new(&self.rate_limit, clock.clone()),
            retry: self.retry,
            audit,
            clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: StatusCode, body: &str) -> TransportResponse {
        TransportResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn classify_passes_success_through() {
        assert!(classify(response(StatusCode::CREATED, "{}")).is_ok());
    }

    #[test]
    fn classify_rate_limit_reads_retry_after() {
        let mut resp = response(StatusCode::TOO_MANY_REQUESTS, "slow down");
        resp.headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        match classify(resp) {
            Err(EppError::RateLimited { retry_after, body }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(12)));
                assert_eq!(body, "slow down");
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    fn rate_limited_with(header: &'static str) -> Option<Duration> {
        let mut resp = response(StatusCode::TOO_MANY_REQUESTS, "");
        resp.headers.insert(RETRY_AFTER, HeaderValue::from_static(header));
        match classify(resp) {
            Err(EppError::RateLimited { retry_after, .. }) => retry_after,
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn classify_caps_oversized_retry_after() {
        assert_eq!(rate_limited_with("1e20"), Some(MAX_RETRY_AFTER));
        assert_eq!(rate_limited_with("inf"), Some(MAX_RETRY_AFTER));
        assert_eq!(rate_limited_with("7200"), Some(MAX_RETRY_AFTER));
        assert_eq!(rate_limited_with("1.5"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn classify_ignores_unusable_retry_after() {
        assert_eq!(rate_limited_with("soon"), None);
        assert_eq!(rate_limited_with("NaN"), None);
        assert_eq!(rate_limited_with("-3"), None);
        assert_eq!(rate_limited_with("Wed, 21 Oct 2026 07:28:00 GMT"), None);
    }

    #[test]
    fn classify_rate_limit_without_header() {
        let err = classify(response(StatusCode::TOO_MANY_REQUESTS, "")).unwrap_err();
        assert!(matches!(err, EppError::RateLimited { retry_after: None, .. }));
    }

    #[test]
    fn classify_api_error_keeps_body_and_code() {
        let body = r#"{"error":{"code":"DeviceNotFound","message":"no such device"}}"#;
        match classify(response(StatusCode::NOT_FOUND, body)) {
            Err(EppError::Api { status, code, body: kept }) => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(code.as_deref(), Some("DeviceNotFound"));
                assert_eq!(kept, body);
            }
            other => panic!("expected Api, got {other:?}"),
        }
    }

    #[test]
    fn error_code_variants() {
        assert_eq!(error_code(r#"{"code":"Throttled"}"#).as_deref(), Some("Throttled"));
        assert_eq!(error_code(r#"{"error":{"code":4031}}"#).as_deref(), Some("4031"));
        assert_eq!(error_code("<html>bad gateway</html>"), None);
    }

    #[test]
    fn url_building_joins_path_and_query() {
        let client = ApiClient::builder("https://epp.example.com")
            .bearer_token("t")
            .build()
            .unwrap();
        let url = client
            .url_for(&ApiRequest::get("/api/v1/devices").query("page", 2).query("pageSize", 50))
            .unwrap();
        assert_eq!(url, "https://epp.example.com/api/v1/devices?page=2&pageSize=50");
    }

    #[test]
    fn builder_requires_identity() {
        assert!(matches!(
            ApiClient::builder("https://epp.example.com").build(),
            Err(EppError::Config(_))
        ));
    }
}
