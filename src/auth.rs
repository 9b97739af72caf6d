//! OAuth2 client-credentials session management.
//!
//! [`SessionManager`] caches one bearer credential and exchanges the client
//! identity for a new one when the cached credential is missing or within
//! [`SAFETY_MARGIN`] of expiry. The cache lock is held across the exchange,
//! so concurrent callers share a single refresh.
//!
//! The exchange itself goes straight to the transport: it is not subject to
//! rate-limit admission or retry.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::{AuditCategory, AuditEvent, AuditLogger};
use crate::clock::Clock;
use crate::error::{EppError, Result};
use crate::transport::{Transport, TransportRequest};

/// Buffer before expiry at which a credential stops being handed out.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Form body sent to the token endpoint.
#[derive(Serialize)]
pub struct TokenRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<&'a str>,
}

/// Fields of the token response we use; others are ignored.
#[derive(Deserialize)]
pub struct TokenResponse {
    /// Bearer value.
    pub access_token: String,
    /// Usually `Bearer`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Client identity used for the credential exchange.
#[derive(Clone)]
pub struct ClientCredentials {
    /// Absolute token endpoint URL.
    pub token_url: String,
    /// Client id.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Optional scope.
    pub scope: Option<String>,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

/// A bearer credential and its lifetime.
///
/// Replaced wholesale on refresh; never mutated.
#[derive(Clone)]
pub struct CredentialToken {
    access_token: String,
    token_type: String,
    lifetime: Duration,
    acquired_at: Instant,
}

impl CredentialToken {
    /// Wraps a token acquired at `acquired_at`.
    pub fn new(access_token: &str, lifetime: Duration, acquired_at: Instant) -> Self {
        CredentialToken {
            access_token: access_token.to_string(),
            token_type: default_token_type(),
            lifetime,
            acquired_at,
        }
    }

    /// The bearer value.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Token type reported by the issuer.
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Issuer-assigned lifetime.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// `now < acquired_at + lifetime - SAFETY_MARGIN`.
    pub fn is_usable(&self, now: Instant) -> bool {
        let usable_for = self.lifetime.saturating_sub(SAFETY_MARGIN);
        now.saturating_duration_since(self.acquired_at) < usable_for
    }
}

impl fmt::Debug for CredentialToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialToken")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Caches a credential and refreshes it before expiry.
///
/// Invariants:
/// - `cached` is `None` until the first successful exchange (or a preset).
/// - A failed exchange leaves `cached` untouched.
pub struct SessionManager {
    credentials: Option<ClientCredentials>,
    cached: Mutex<Option<CredentialToken>>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLogger>,
}

impl SessionManager {
    /// Session that exchanges `credentials` on demand.
    pub fn new(
        credentials: ClientCredentials,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        SessionManager {
            credentials: Some(credentials),
            cached: Mutex::new(None),
            clock,
            audit,
        }
    }

    /// Session seeded with a fixed token valid for an hour and no client
    /// identity to refresh with. Used by tests and for externally issued
    /// tokens.
    pub fn with_token(token: &str, clock: Arc<dyn Clock>, audit: Arc<AuditLogger>) -> Self {
        let preset = CredentialToken::new(token, Duration::from_secs(3600), clock.now());
        SessionManager {
            credentials: None,
            cached: Mutex::new(Some(preset)),
            clock,
            audit,
        }
    }

    /// Returns a usable credential, exchanging the client identity for a
    /// new one when needed.
    pub async fn ensure_valid_credential(
        &self,
        transport: &dyn Transport,
    ) -> Result<CredentialToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_usable(self.clock.now()) {
                return Ok(token.clone());
            }
        }

        let credentials = self.credentials.as_ref().ok_or_else(|| EppError::Auth {
            message: "credential expired and no client identity is configured".to_string(),
            source: None,
        })?;

        match self.exchange(credentials, transport).await {
            Ok(token) => {
                info!(expires_in = token.lifetime.as_secs(), "acquired access token");
                self.audit.record(
                    exchange_event(credentials).detail("expires_in", token.lifetime.as_secs()),
                );
                *cached = Some(token.clone());
                Ok(token)
            }
            Err(err) => {
                warn!(error = %err, "credential exchange failed");
                self.audit.record(exchange_event(credentials).failed(&err));
                Err(err)
            }
        }
    }

    /// Drops the cached credential so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    /// Drops the cached credential only if it is still `rejected`.
    pub async fn invalidate_token(&self, rejected: &str) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref().is_some_and(|token| token.access_token() == rejected) {
            debug!("dropping rejected access token");
            *cached = None;
        }
    }

    /// Client id used for auditing, if the session has one.
    pub fn client_id(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.client_id.as_str())
    }

    /// Performs one client-credentials exchange.
    ///
    /// The body is read before the status check so the issuer's error
    /// description survives into the `Auth` error.
    async fn exchange(
        &self,
        credentials: &ClientCredentials,
        transport: &dyn Transport,
    ) -> Result<CredentialToken> {
        let form = TokenRequest {
            grant_type: "client_credentials",
            client_id: &credentials.client_id,
            client_secret: &credentials.client_secret,
            scope: credentials.scope.as_deref(),
        };
        let encoded = serde_urlencoded::to_string(&form).map_err(|e| EppError::Auth {
            message: "failed to encode token request".to_string(),
            source: Some(Box::new(e)),
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let response = transport
            .send(TransportRequest {
                method: Method::POST,
                url: credentials.token_url.clone(),
                headers,
                body: Some(Bytes::from(encoded)),
            })
            .await
            .map_err(|e| EppError::Auth {
                message: "token endpoint unreachable".to_string(),
                source: Some(Box::new(e)),
            })?;

        if !response.status.is_success() {
            return Err(EppError::Auth {
                message: format!("token request failed ({}): {}", response.status, response.text()),
                source: None,
            });
        }

        let parsed: TokenResponse =
            serde_json::from_slice(&response.body).map_err(|e| EppError::Auth {
                message: "failed to parse token response".to_string(),
                source: Some(Box::new(e)),
            })?;

        Ok(CredentialToken {
            access_token: parsed.access_token,
            token_type: parsed.token_type,
            lifetime: Duration::from_secs(parsed.expires_in),
            acquired_at: self.clock.now(),
        })
    }
}

fn exchange_event(credentials: &ClientCredentials) -> AuditEvent {
    AuditEvent::new(AuditCategory::Authentication, "credential_exchange", "credential")
        .resource(credentials.client_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use reqwest::StatusCode;

    use crate::clock::MockClock;
    use crate::transport::TransportResponse;

    /// Token endpoint double that counts exchanges.
    struct FakeIssuer {
        calls: AtomicUsize,
        status: StatusCode,
        expires_in: u64,
    }

    impl FakeIssuer {
        fn ok(expires_in: u64) -> Self {
            FakeIssuer {
                calls: AtomicUsize::new(0),
                status: StatusCode::OK,
                expires_in,
            }
        }
    }

    #[async_trait]
    impl Transport for FakeIssuer {
        async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let body = String::from_utf8(request.body.unwrap().to_vec()).unwrap();
            assert!(body.contains("grant_type=client_credentials"));
            let payload = if self.status.is_success() {
                format!(
                    r#"{{"access_token":"tok-{n}","token_type":"Bearer","expires_in":{}}}"#,
                    self.expires_in
                )
            } else {
                r#"{"error":"invalid_client"}"#.to_string()
            };
            Ok(TransportResponse {
                status: self.status,
                headers: HeaderMap::new(),
                body: Bytes::from(payload),
            })
        }
    }

    fn credentials() -> ClientCredentials {
        ClientCredentials {
            token_url: "http://issuer.test/oauth/token".to_string(),
            client_id: "cid".to_string(),
            client_secret: "very-secret".to_string(),
            scope: Some("api".to_string()),
        }
    }

    fn session(clock: &MockClock) -> SessionManager {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        SessionManager::new(
            credentials(),
            clock.clone(),
            Arc::new(AuditLogger::disabled(clock)),
        )
    }

    #[test]
    fn token_request_serializes_as_form() {
        let req = TokenRequest {
            grant_type: "client_credentials",
            client_id: "cid",
            client_secret: "secret~value",
            scope: None,
        };
        let encoded = serde_urlencoded::to_string(&req).unwrap();
        assert!(encoded.contains("client_id=cid"));
        assert!(encoded.contains("grant_type=client_credentials"));
        assert!(!encoded.contains("scope"), "absent scope is omitted");
    }

    #[test]
    fn token_response_ignores_unknown_fields() {
        let json = r#"{
            "token_type": "Bearer",
            "expires_in": 3599,
            "ext_expires_in": 3599,
            "access_token": "tok"
        }"#;
        let resp: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.access_token, "tok");
        assert_eq!(resp.expires_in, 3599);
    }

    #[test]
    fn usability_respects_safety_margin() {
        let start = Instant::now();
        let token = CredentialToken::new("t", Duration::from_secs(90), start);
        assert!(token.is_usable(start + Duration::from_secs(10)));
        assert!(!token.is_usable(start + Duration::from_secs(30)));
        assert!(!token.is_usable(start + Duration::from_secs(31)));
    }

    #[test]
    fn short_lived_token_is_never_usable() {
        let start = Instant::now();
        let token = CredentialToken::new("t", Duration::from_secs(45), start);
        assert!(!token.is_usable(start));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let lifetime = Duration::from_secs(60);
        let token = CredentialToken::new("super-secret-token", lifetime, Instant::now());
        assert!(!format!("{token:?}").contains("super-secret-token"));
        assert!(!format!("{:?}", credentials()).contains("very-secret"));
    }

    #[tokio::test]
    async fn cached_credential_is_reused() {
        let clock = MockClock::new();
        let issuer = FakeIssuer::ok(3600);
        let session = session(&clock);

        let first = session.ensure_valid_credential(&issuer).await.unwrap();
        clock.advance(Duration::from_secs(120));
        let second = session.ensure_valid_credential(&issuer).await.unwrap();

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.access_token(), second.access_token());
    }

    #[tokio::test]
    async fn credential_is_refreshed_inside_safety_margin() {
        let clock = MockClock::new();
        let issuer = FakeIssuer::ok(3600);
        let session = session(&clock);

        session.ensure_valid_credential(&issuer).await.unwrap();
        clock.advance(Duration::from_secs(3600 - 30));
        let refreshed = session.ensure_valid_credential(&issuer).await.unwrap();

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed.access_token(), "tok-1");
    }

    #[tokio::test]
    async fn stale_rejection_keeps_refreshed_token() {
        let clock = MockClock::new();
        let issuer = FakeIssuer::ok(3600);
        let session = session(&clock);

        let stale = session.ensure_valid_credential(&issuer).await.unwrap();
        session.invalidate_token(stale.access_token()).await;
        let fresh = session.ensure_valid_credential(&issuer).await.unwrap();
        assert_eq!(fresh.access_token(), "tok-1");

        // A 401 for the old token arriving late must not drop the new one.
        session.invalidate_token(stale.access_token()).await;
        let reused = session.ensure_valid_credential(&issuer).await.unwrap();
        assert_eq!(reused.access_token(), "tok-1");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let clock = MockClock::new();
        let issuer = FakeIssuer::ok(3600);
        let session = session(&clock);

        let results = futures::future::join_all(
            (0..8).map(|_| session.ensure_valid_credential(&issuer)),
        )
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_exchange_is_auth_error_and_keeps_cache() {
        let clock = MockClock::new();
        let session = session(&clock);
        session.ensure_valid_credential(&FakeIssuer::ok(120)).await.unwrap();
        clock.advance(Duration::from_secs(90));

        let rejecting = FakeIssuer {
            calls: AtomicUsize::new(0),
            status: StatusCode::UNAUTHORIZED,
            expires_in: 0,
        };
        let err = session.ensure_valid_credential(&rejecting).await.unwrap_err();
        match err {
            EppError::Auth { message, .. } => assert!(message.contains("invalid_client")),
            other => panic!("expected Auth, got {other:?}"),
        }
        assert!(session.cached.lock().await.is_some(), "previous token kept");
    }

    #[tokio::test]
    async fn preset_token_without_identity_cannot_refresh() {
        let clock = MockClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let session = SessionManager::with_token(
            "preset",
            shared.clone(),
            Arc::new(AuditLogger::disabled(shared)),
        );
        let issuer = FakeIssuer::ok(3600);
        assert_eq!(
            session.ensure_valid_credential(&issuer).await.unwrap().access_token(),
            "preset"
        );

        session.invalidate().await;
        assert!(matches!(
            session.ensure_valid_credential(&issuer).await,
            Err(EppError::Auth { .. })
        ));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }
}
