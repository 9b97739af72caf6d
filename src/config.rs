//! TOML configuration.
//!
//! Every section is optional and falls back to defaults; only `api.base_url`
//! and `credentials.client_id` have no usable default. The client secret may
//! be left out of the file and supplied through the CLI or the
//! `EPP_CLIENT_SECRET` environment variable instead.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::audit::AuditConfig;
use crate::auth::ClientCredentials;
use crate::batch::BatchOptions;
use crate::error::{EppError, Result};
use crate::health::Thresholds;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::tasks::PollConfig;

/// Default number of devices requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// `[api]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiConfig {
    /// API root, e.g. `https://epp.example.com/`.
    pub base_url: String,
    /// Token endpoint; defaults to `{base_url}oauth/token`.
    pub token_url: Option<String>,
    /// Scope requested in the credential exchange.
    pub scope: Option<String>,
    /// Devices per page when listing.
    pub page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: String::new(),
            token_url: None,
            scope: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// `[credentials]` section.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// `[tasks]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskConfig {
    /// Seconds between task status polls.
    pub poll_interval_secs: u64,
    /// Wall-clock budget for waiting on one task.
    pub timeout_minutes: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            poll_interval_secs: 10,
            timeout_minutes: 30,
        }
    }
}

impl TaskConfig {
    /// Polling parameters for [`crate::tasks::wait_for_task`].
    pub fn poll_config(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.timeout_minutes.saturating_mul(60)),
        )
    }
}

/// Full client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Endpoint settings.
    pub api: ApiConfig,
    /// Client identity.
    pub credentials: CredentialsConfig,
    /// Admission control.
    pub rate_limit: RateLimitConfig,
    /// Retry budget.
    pub retry: RetryConfig,
    /// Health policy.
    pub health: Thresholds,
    /// Batch fan-out.
    pub batch: BatchOptions,
    /// Task polling.
    pub tasks: TaskConfig,
    /// Audit log.
    pub audit: AuditConfig,
}

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| EppError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EppError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Rejects values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(EppError::Config("api.base_url must be set".into()));
        }
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(EppError::Config("api.base_url must be an http(s) URL".into()));
        }
        if self.api.page_size == 0 {
            return Err(EppError::Config("api.page_size must be greater than 0".into()));
        }
        if self.credentials.client_id.trim().is_empty() {
            return Err(EppError::Config("credentials.client_id must be set".into()));
        }
        if self.rate_limit.requests_per_minute == 0 {
            return Err(EppError::Config(
                "rate_limit.requests_per_minute must be greater than 0".into(),
            ));
        }
        if self.rate_limit.burst_size == 0 {
            return Err(EppError::Config("rate_limit.burst_size must be greater than 0".into()));
        }
        if self.tasks.poll_interval_secs == 0 {
            return Err(EppError::Config("tasks.poll_interval_secs must be greater than 0".into()));
        }
        self.batch.validate()?;
        Ok(())
    }

    /// Base URL with a guaranteed trailing slash.
    pub fn base_url(&self) -> String {
        let base = self.api.base_url.trim();
        if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        }
    }

    /// Token endpoint URL.
    pub fn token_url(&self) -> String {
        self.api
            .token_url
            .clone()
            .unwrap_or_else(|| format!("{}oauth/token", self.base_url()))
    }

    /// Client identity for the session; `secret_override` wins over the file.
    pub fn client_credentials(&self, secret_override: Option<&str>) -> Result<ClientCredentials> {
        let client_secret = secret_override
            .map(str::to_owned)
            .or_else(|| self.credentials.client_secret.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EppError::Config(
                    "client secret missing: set credentials.client_secret or EPP_CLIENT_SECRET"
                        .into(),
                )
            })?;
        Ok(ClientCredentials {
            token_url: self.token_url(),
            client_id: self.credentials.client_id.clone(),
            client_secret,
            scope: self.api.scope.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [api]
        base_url = "https://epp.example.com"

        [credentials]
        client_id = "cid"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.base_url(), "https://epp.example.com/");
        assert_eq!(config.token_url(), "https://epp.example.com/oauth/token");
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.batch.batch_size, 100);
        assert_eq!(config.batch.max_concurrency, 10);
        assert_eq!(config.health.offline_device_hours, 24);
        assert_eq!(config.tasks.poll_config().timeout, Duration::from_secs(30 * 60));
        assert!(config.audit.enabled);
    }

    #[test]
    fn full_config_overrides_every_section() {
        let toml = r#"
            [api]
            base_url = "https://epp.example.com/"
            token_url = "https://login.example.com/token"
            scope = "fleet"
            page_size = 25

            [credentials]
            client_id = "cid"
            client_secret = "s3cret"

            [rate_limit]
            requests_per_minute = 120
            burst_size = 20

            [retry]
            max_retries = 5
            base_delay_ms = 250

            [health]
            offline_device_hours = 48
            outdated_definition_days = 3
            threat_count_critical = 2
            module_error_threshold = 3

            [batch]
            batch_size = 50
            max_concurrency = 5

            [tasks]
            poll_interval_secs = 2
            timeout_minutes = 5

            [audit]
            enabled = false
            tamper_evidence = false
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.token_url(), "https://login.example.com/token");
        assert_eq!(config.api.page_size, 25);
        assert_eq!(config.rate_limit.requests_per_minute, 120);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.health.module_error_threshold, 3);
        assert_eq!(config.batch.max_concurrency, 5);
        assert_eq!(config.tasks.poll_config().interval, Duration::from_secs(2));
        assert!(!config.audit.enabled);

        let creds = config.client_credentials(None).unwrap();
        assert_eq!(creds.client_secret, "s3cret");
        assert_eq!(creds.scope.as_deref(), Some("fleet"));
    }

    #[test]
    fn secret_override_wins() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert!(matches!(config.client_credentials(None), Err(EppError::Config(_))));
        let creds = config.client_credentials(Some("from-env")).unwrap();
        assert_eq!(creds.client_secret, "from-env");
    }

    #[test]
    fn validation_rejects_bad_values() {
        for bad in [
            "[credentials]\nclient_id = \"cid\"",
            "[api]\nbase_url = \"ftp://x\"\n[credentials]\nclient_id = \"cid\"",
            "[api]\nbase_url = \"https://x\"",
            concat!(
                "[api]\nbase_url = \"https://x\"\n",
                "[credentials]\nclient_id = \"c\"\n",
                "[rate_limit]\nburst_size = 0",
            ),
            concat!(
                "[api]\nbase_url = \"https://x\"\n",
                "[credentials]\nclient_id = \"c\"\n",
                "[batch]\nmax_concurrency = 0",
            ),
        ] {
            let result = Config::from_toml_str(bad);
            assert!(
                matches!(result, Err(EppError::Config(_) | EppError::InvalidInput(_))),
                "should reject: {bad}"
            );
        }
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(matches!(Config::from_toml_str("[api"), Err(EppError::Config(_))));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epp.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        assert!(Config::load(&path).is_ok());
        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(EppError::Config(_))
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let config = Config::from_toml_str(concat!(
            "[api]\nbase_url = \"https://x\"\n",
            "[credentials]\nclient_id = \"c\"\nclient_secret = \"hunter2\"",
        ))
        .unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
