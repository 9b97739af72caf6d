//! Async Rust client for an endpoint-protection management API.
//!
//! Every remote call runs through one resilient pipeline: cached OAuth2
//! client-credential tokens, an adaptive token-bucket rate limiter, retry
//! with exponential backoff, and a tamper-evident JSON-lines audit log. On
//! top of it sit device/health reads, the remote task lifecycle, a bounded
//! batch orchestrator, the health policy evaluator and remediation
//! workflows.
//!
//! # Modules
//!
//! - [`audit`]: Audit entries with SHA-256 integrity digests, and log verification.
//! - [`auth`]: Session manager: credential exchange and token caching.
//! - [`batch`]: Batch-then-window fan-out with per-item outcomes.
//! - [`client`]: The request pipeline (`ApiClient`).
//! - [`clock`]: Injectable time source, with a virtual clock for tests.
//! - [`config`]: TOML configuration.
//! - [`devices`]: Device listing and health records.
//! - [`error`]: Typed error hierarchy (`EppError`).
//! - [`health`]: Health thresholds, issue rules and fleet reports.
//! - [`rate_limit`]: Adaptive token bucket.
//! - [`retry`]: Retry executor.
//! - [`tasks`]: Task create/read/approve/cancel and polling.
//! - [`transport`]: HTTP transport seam.
//! - [`workflows`]: Per-device fan-out and uninstall-then-reinstall.
//!
//! # Quick Start
//!
//! ```ignore
//! use epp_ops::client::ApiClient;
//! use epp_ops::config::Config;
//! use epp_ops::health::run_health_check;
//!
//! let config = Config::load("epp.toml".as_ref())?;
//! let client = ApiClient::from_config(&config, None)?;
//! let report = run_health_check(&client, &config.health, &config.batch, config.api.page_size).await?;
//! println!("{} issues", report.issues.len());
//! ```

#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod batch;
pub mod client;
pub mod clock;
pub mod config;
pub mod devices;
pub mod error;
pub mod health;
pub mod rate_limit;
pub mod retry;
pub mod tasks;
pub mod transport;
pub mod workflows;
