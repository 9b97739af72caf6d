//! Append-only, tamper-evident audit log.
//!
//! Each entry is written as one JSON line. When tamper evidence is enabled,
//! the entry carries a SHA-256 digest over its core fields (timestamp,
//! category, actor, action, resource type/id, outcome). The digest is
//! computed once when the entry is emitted and never recomputed.
//!
//! Digests are not chained: [`verify_log`] detects a modified entry but not
//! a deleted or reordered one.
//!
//! Sink failures never fail the operation being audited; they are reported
//! through `tracing` and dropped.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::clock::Clock;
use crate::error::Result;

/// What kind of operation an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Credential exchanges.
    Authentication,
    /// Device listing and health reads.
    DeviceQuery,
    /// Task create/approve/cancel/status.
    TaskManagement,
    /// Fleet health evaluations.
    HealthCheck,
    /// Multi-device batch runs and workflows.
    BatchOperation,
}

impl AuditCategory {
    fn as_str(self) -> &'static str {
        match self {
            AuditCategory::Authentication => "authentication",
            AuditCategory::DeviceQuery => "device_query",
            AuditCategory::TaskManagement => "task_management",
            AuditCategory::HealthCheck => "health_check",
            AuditCategory::BatchOperation => "batch_operation",
        }
    }
}

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The operation succeeded.
    Success,
    /// The operation failed.
    Failure,
}

impl AuditOutcome {
    fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// When the entry was emitted.
    pub timestamp: DateTime<Utc>,
    /// Event category.
    pub category: AuditCategory,
    /// Who performed the operation (usually the client id).
    pub actor: String,
    /// Operation name, e.g. `create_task`.
    pub action: String,
    /// Kind of resource touched, e.g. `device`.
    pub resource_type: String,
    /// Resource identifier, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Success or failure.
    pub outcome: AuditOutcome,
    /// Free-form context. Never holds secrets.
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Hex SHA-256 over the core fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

impl AuditEntry {
    /// Digest over the core fields. Detail values are excluded.
    pub fn compute_digest(&self) -> String {
        let mut hasher = Sha256::new();
        let fields = [
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.category.as_str().to_string(),
            self.actor.clone(),
            self.action.clone(),
            self.resource_type.clone(),
            self.resource_id.clone().unwrap_or_default(),
            self.outcome.as_str().to_string(),
        ];
        for field in &fields {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    /// `true` when the entry carries a digest that matches its fields.
    /// Entries without a digest cannot be verified and return `false`.
    pub fn verify(&self) -> bool {
        self.integrity
            .as_deref()
            .is_some_and(|digest| digest == self.compute_digest())
    }
}

/// Builder-style description of an event, completed by [`AuditLogger::record`].
#[derive(Debug, Clone)]
pub struct AuditEvent {
    category: AuditCategory,
    action: String,
    resource_type: String,
    resource_id: Option<String>,
    outcome: AuditOutcome,
    details: BTreeMap<String, serde_json::Value>,
}

impl AuditEvent {
    /// Starts an event; outcome defaults to success.
    pub fn new(category: AuditCategory, action: &str, resource_type: &str) -> Self {
        AuditEvent {
            category,
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: None,
            outcome: AuditOutcome::Success,
            details: BTreeMap::new(),
        }
    }

    /// Sets the resource id.
    pub fn resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    /// Sets the outcome.
    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Adds one detail value.
    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Marks the event as failed and records the error message.
    pub fn failed(self, error: &impl std::fmt::Display) -> Self {
        self.outcome(AuditOutcome::Failure)
            .detail("error", error.to_string())
    }
}

/// `[audit]` config section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Write audit entries at all.
    pub enabled: bool,
    /// File to append to. Without a path, entries go to stderr.
    pub path: Option<PathBuf>,
    /// Attach integrity digests.
    pub tamper_evidence: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            enabled: true,
            path: None,
            tamper_evidence: true,
        }
    }
}

type Sink = Box<dyn Write + Send>;

/// Writes audit entries to an append-only sink.
pub struct AuditLogger {
    sink: Option<Mutex<Sink>>,
    actor: String,
    tamper_evidence: bool,
    clock: Arc<dyn Clock>,
}

impl AuditLogger {
    /// Logger over an arbitrary sink.
    pub fn new(sink: Sink, actor: &str, clock: Arc<dyn Clock>) -> Self {
        AuditLogger {
            sink: Some(Mutex::new(sink)),
            actor: actor.to_string(),
            tamper_evidence: true,
            clock,
        }
    }

    /// Logger appending to `path`, creating it if needed.
    pub fn open(path: &Path, actor: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AuditLogger::new(Box::new(file), actor, clock))
    }

    /// Logger that drops every entry.
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        AuditLogger {
            sink: None,
            actor: String::new(),
            tamper_evidence: false,
            clock,
        }
    }

    /// Builds a logger from the `[audit]` section.
    pub fn from_config(config: &AuditConfig, actor: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        if !config.enabled {
            return Ok(AuditLogger::disabled(clock));
        }
        let logger = match &config.path {
            Some(path) => AuditLogger::open(path, actor, clock)?,
            None => AuditLogger::new(Box::new(std::io::stderr()), actor, clock),
        };
        Ok(logger.with_tamper_evidence(config.tamper_evidence))
    }

    /// Enables or disables digests.
    pub fn with_tamper_evidence(mut self, enabled: bool) -> Self {
        self.tamper_evidence = enabled;
        self
    }

    /// Whether entries are written at all.
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Completes `event` into an entry and appends it. Returns the entry
    /// that was written, or `None` when auditing is disabled.
    pub fn record(&self, event: AuditEvent) -> Option<AuditEntry> {
        let sink = self.sink.as_ref()?;
        let mut entry = AuditEntry {
            timestamp: self.clock.utc_now(),
            category: event.category,
            actor: self.actor.clone(),
            action: event.action,
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            outcome: event.outcome,
            details: event.details,
            integrity: None,
        };
        if self.tamper_evidence {
            entry.integrity = Some(entry.compute_digest());
        }

        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, action = %entry.action, "failed to serialize audit entry");
                return Some(entry);
            }
        };
        line.push(b'\n');

        let mut sink = sink.lock();
        if let Err(err) = sink.write_all(&line).and_then(|()| sink.flush()) {
            warn!(error = %err, action = %entry.action, "audit sink write failed");
        }
        Some(entry)
    }
}

/// Result of scanning an audit log.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Lines parsed as entries.
    pub entries: usize,
    /// 1-based line numbers whose digest is missing or wrong.
    pub tampered: Vec<usize>,
    /// 1-based line numbers that did not parse.
    pub malformed: Vec<usize>,
}

/// Re-checks every entry digest in a JSON-lines audit log.
pub fn verify_log(reader: impl BufRead) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(&line) {
            Ok(entry) => {
                report.entries += 1;
                if !entry.verify() {
                    report.tampered.push(index + 1);
                }
            }
            Err(_) => report.malformed.push(index + 1),
        }
    }
    Ok(report)
}
