//! Transport collaborator contract and the reqwest-backed implementation.
//!
//! The request pipeline depends only on [`Transport`]: a request goes in, a
//! status/headers/body triple comes out, or a `Network` error. Status
//! classification happens in the pipeline, not here, so a transport never
//! turns a 4xx/5xx into an error.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};

use crate::error::{EppError, Result};

/// Connect timeout (TCP + TLS handshake).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whole-request timeout. API payloads are small JSON documents.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL including query string.
    pub url: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Raw body, if any.
    pub body: Option<Bytes>,
}

/// Raw HTTP response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Raw body.
    pub body: Bytes,
}

impl TransportResponse {
    /// Body as lossy UTF-8, for error messages.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends HTTP requests. Implementations must be shareable across tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and returns the raw response, whatever its status.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// [`Transport`] over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Builds a client with explicit connect and request timeouts.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(EppError::network)?;
        Ok(ReqwestTransport { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: Client) -> Self {
        ReqwestTransport { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(EppError::network)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(EppError::network)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn error_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let response = transport
            .send(TransportRequest {
                method: Method::GET,
                url: format!("{}/missing", server.uri()),
                headers: HeaderMap::new(),
                body: None,
            })
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.text(), "nope");
    }

    #[tokio::test]
    async fn headers_and_body_are_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(header("x-test", "1"))
            .respond_with(ResponseTemplate::new(200).insert_header("x-reply", "ok"))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("x-test", "1".parse().unwrap());
        let transport = ReqwestTransport::new().unwrap();
        let response = transport
            .send(TransportRequest {
                method: Method::POST,
                url: format!("{}/echo", server.uri()),
                headers,
                body: Some(Bytes::from_static(b"{}")),
            })
            .await
            .unwrap();

        assert!(response.status.is_success());
        assert_eq!(response.headers.get("x-reply").unwrap(), "ok");
    }

    #[tokio::test]
    async fn connection_failure_is_network_error() {
        let transport = ReqwestTransport::new().unwrap();
        let result = transport
            .send(TransportRequest {
                method: Method::GET,
                url: "http://127.0.0.1:9/".to_string(),
                headers: HeaderMap::new(),
                body: None,
            })
            .await;
        assert!(matches!(result, Err(EppError::Network { .. })));
    }
}
