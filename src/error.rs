//! Typed error hierarchy for the epp-ops crate.
//!
//! Every variant maps to a real failure boundary: the token endpoint
//! (`Auth`), the remote API (`RateLimited`, `Api`), the transport
//! (`Network`), task polling (`Timeout`, `TaskFailed`), the retry budget
//! (`Execution`), and local input (`Parse`, `Config`, `InvalidInput`, `Io`).
//!
//! Recovery policy lives in [`crate::retry`]: `RateLimited` and 5xx `Api`
//! errors are retried locally, everything else propagates unchanged.

use std::time::Duration;

use reqwest::StatusCode;

/// Unified error type for all epp-ops library operations.
#[derive(Debug, thiserror::Error)]
pub enum EppError {
    /// The credential exchange was rejected or could not complete.
    ///
    /// `message` carries the HTTP status and the token endpoint's error
    /// body when one was returned. Secret material is never included.
    #[error("authentication failed: {message}")]
    Auth {
        /// Human-readable description, including status and body.
        message: String,
        /// The underlying transport or parse error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The API answered 429. Recovered by the retry executor; only visible
    /// to callers that drive a single attempt themselves.
    #[error("rate limited (retry after {retry_after:?}): {body}")]
    RateLimited {
        /// Parsed `Retry-After` hint, if the response carried one.
        retry_after: Option<Duration>,
        /// Raw response body.
        body: String,
    },

    /// The API returned a non-success status other than 429.
    ///
    /// The body is preserved verbatim: the platform's diagnostic messages
    /// are the only useful context for permission and validation failures.
    #[error("API error {status}: {body}")]
    Api {
        /// HTTP status returned by the API.
        status: StatusCode,
        /// Error code extracted from the JSON body, when present.
        code: Option<String>,
        /// Raw response body text.
        body: String,
    },

    /// Transport-level failure (DNS, TCP, TLS, request timeout).
    #[error("network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
        /// The underlying transport error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Task polling exceeded its wall-clock budget. The remote task is left
    /// running.
    #[error("polling timed out after {elapsed:?} for task {task_id}")]
    Timeout {
        /// Elapsed time when the timeout was detected.
        elapsed: Duration,
        /// The task being polled.
        task_id: String,
    },

    /// A task reached a terminal state that the workflow cannot continue
    /// from (for example, a cancelled uninstall).
    #[error("task {task_id} reached terminal status: {status}")]
    TaskFailed {
        /// The terminal status that was reached.
        status: String,
        /// The task ID.
        task_id: String,
    },

    /// The retry budget ran out without a success or a propagating error.
    #[error("request did not succeed after {attempts} attempts")]
    Execution {
        /// Number of attempts made.
        attempts: u32,
    },

    /// JSON deserialization of a response body failed.
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Caller-supplied input is malformed (e.g. a zero batch size).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Local I/O failure (config file, audit sink).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EppError {
    /// Builds a `Network` error from any transport error.
    pub fn network<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EppError::Network {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    /// `true` for API responses in the 5xx class.
    pub fn is_server_error(&self) -> bool {
        matches!(self, EppError::Api { status, .. } if status.is_server_error())
    }

    /// `true` for 429 responses.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, EppError::RateLimited { .. })
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            EppError::Api { status, .. } => Some(*status),
            EppError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, EppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn auth_error_displays_message() {
        let err = EppError::Auth {
            message: "token request failed (401): invalid_client".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("invalid_client"));
        assert!(msg.contains("authentication failed"));
    }

    #[test]
    fn auth_error_with_source_chains_correctly() {
        let json_err: serde_json::Error = serde_json::from_str::<String>("not-json").unwrap_err();
        let err = EppError::Auth {
            message: "failed to parse token response".to_string(),
            source: Some(Box::new(json_err)),
        };
        assert!(err.source().is_some());
    }

    #[test]
    fn api_error_preserves_status_and_body() {
        let err = EppError::Api {
            status: StatusCode::FORBIDDEN,
            code: Some("Forbidden".to_string()),
            body: r#"{"error":{"code":"Forbidden","message":"Insufficient permissions"}}"#
                .to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("403"), "display should include status code");
        assert!(msg.contains("Insufficient permissions"));
        assert!(!err.is_server_error());
    }

    #[test]
    fn server_error_classification() {
        let err = EppError::Api {
            status: StatusCode::BAD_GATEWAY,
            code: None,
            body: String::new(),
        };
        assert!(err.is_server_error());
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn rate_limited_reports_429() {
        let err = EppError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
            body: String::new(),
        };
        assert!(err.is_rate_limited());
        assert_eq!(err.status(), Some(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn timeout_error_includes_duration_and_task_id() {
        let err = EppError::Timeout {
            elapsed: Duration::from_secs(605),
            task_id: "task-abc-123".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("task-abc-123"));
        assert!(msg.contains("605"));
    }

    #[test]
    fn execution_error_reports_attempts() {
        let err = EppError::Execution { attempts: 4 };
        assert!(err.to_string().contains("4 attempts"));
    }

    #[test]
    fn network_helper_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = EppError::network(io);
        assert!(err.to_string().contains("refused"));
        assert!(err.source().is_some());
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EppError>();
    }
}
