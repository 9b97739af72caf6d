//! Health policy evaluation.
//!
//! [`evaluate_device`] is a pure function of a device snapshot, its health
//! record, the policy [`Thresholds`] and the evaluation instant. Every rule
//! is checked independently, so one device can raise several issues:
//!
//! | Rule | Fires when | Severity |
//! |------|------------|----------|
//! | `offline` | hours since last seen > `offline_device_hours` | critical |
//! | `outdated_definitions` | days since update > `outdated_definition_days` | critical above 2×, else warning |
//! | `threats_detected` | threat count ≥ `threat_count_critical` | critical |
//! | `protection_disabled` | antivirus disabled | critical |
//! | `module_errors` | modules in error ≥ `module_error_threshold` | warning |
//!
//! [`run_health_check`] drives the evaluation across the fleet. Devices whose
//! health read fails are left out of the issues and the tier tally and are
//! counted as unavailable instead. A device listed twice is evaluated once.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditCategory, AuditEvent};
use crate::batch::{BatchOptions, run_batch};
use crate::client::ApiClient;
use crate::devices::{DeviceHealth, DeviceSnapshot, HealthTier, get_device_health, list_devices};
use crate::error::Result;

/// `[health]` section: policy thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Thresholds {
    /// Hours without contact before a device counts as offline.
    pub offline_device_hours: u32,
    /// Days before definitions count as outdated.
    pub outdated_definition_days: u32,
    /// Threat count that makes a device critical.
    pub threat_count_critical: u32,
    /// Modules in error that raise a warning.
    pub module_error_threshold: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            offline_device_hours: 24,
            outdated_definition_days: 7,
            threat_count_critical: 1,
            module_error_threshold: 1,
        }
    }
}

/// Issue severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Degraded, not urgent.
    Warning,
    /// Needs attention.
    Critical,
}

/// Which rule raised an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// Not seen for too long.
    Offline,
    /// Signatures too old.
    OutdatedDefinitions,
    /// Active threats.
    ThreatsDetected,
    /// Antivirus turned off.
    ProtectionDisabled,
    /// Protection modules failing.
    ModuleErrors,
}

/// One rule violation on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    /// Device id.
    pub device_id: String,
    /// Device display name.
    pub device_name: String,
    /// Rule that fired.
    pub issue_type: IssueType,
    /// Severity.
    pub severity: Severity,
    /// Human-readable description.
    pub description: String,
    /// Evaluation instant.
    pub detected_at: DateTime<Utc>,
}

/// Devices tallied by their platform-reported tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    /// Healthy devices.
    pub healthy: usize,
    /// Devices in warning.
    pub warning: usize,
    /// Critical devices.
    pub critical: usize,
    /// Devices with an unrecognized tier.
    pub unknown: usize,
}

impl HealthSummary {
    fn count(&mut self, tier: HealthTier) {
        match tier {
            HealthTier::Healthy => self.healthy += 1,
            HealthTier::Warning => self.warning += 1,
            HealthTier::Critical => self.critical += 1,
            HealthTier::Unknown => self.unknown += 1,
        }
    }
}

/// A device as observed for one evaluation; `health` is `None` when the
/// health read failed.
#[derive(Debug, Clone)]
pub struct DeviceObservation {
    /// Listing data.
    pub snapshot: DeviceSnapshot,
    /// Health record, if it could be read.
    pub health: Option<DeviceHealth>,
}

/// Fleet evaluation result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Evaluation instant.
    pub generated_at: DateTime<Utc>,
    /// Devices listed.
    pub total_devices: usize,
    /// Devices with a health record.
    pub evaluated: usize,
    /// Devices whose health read failed.
    pub unavailable: usize,
    /// Tier tally over evaluated devices.
    pub summary: HealthSummary,
    /// Every issue raised.
    pub issues: Vec<HealthIssue>,
    /// Share of evaluated devices without a critical issue, in percent.
    pub compliance_percentage: f64,
}

impl HealthReport {
    /// Whether any issue is critical.
    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    /// Number of issues with the given severity.
    pub fn count_severity(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

/// Applies every rule to one device.
pub fn evaluate_device(
    snapshot: &DeviceSnapshot,
    health: &DeviceHealth,
    thresholds: &Thresholds,
    now: DateTime<Utc>,
) -> Vec<HealthIssue> {
    let mut issues = Vec::new();
    let mut raise = |issue_type, severity, description: String| {
        issues.push(HealthIssue {
            device_id: snapshot.id.clone(),
            device_name: snapshot.display_name().to_string(),
            issue_type,
            severity,
            description,
            detected_at: now,
        });
    };

    if let Some(last_seen) = snapshot.last_seen {
        let hours = (now - last_seen).num_hours();
        if hours > i64::from(thresholds.offline_device_hours) {
            raise(
                IssueType::Offline,
                Severity::Critical,
                format!("device not seen for {hours} hours"),
            );
        }
    }

    if let Some(updated) = health.antivirus.definitions_updated_at {
        let days = (now - updated).num_days();
        let limit = i64::from(thresholds.outdated_definition_days);
        if days > limit {
            let severity = if days > limit * 2 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            raise(
                IssueType::OutdatedDefinitions,
                severity,
                format!("definitions are {days} days old"),
            );
        }
    }

    if health.threats.count >= thresholds.threat_count_critical {
        let description = match &health.threats.highest_severity {
            Some(level) => format!("{} active threats (highest: {level})", health.threats.count),
            None => format!("{} active threats", health.threats.count),
        };
        raise(IssueType::ThreatsDetected, Severity::Critical, description);
    }

    if !health.antivirus.enabled {
        raise(
            IssueType::ProtectionDisabled,
            Severity::Critical,
            "antivirus protection is disabled".to_string(),
        );
    }

    let in_error = health.modules_in_error();
    if in_error >= thresholds.module_error_threshold as usize {
        raise(
            IssueType::ModuleErrors,
            Severity::Warning,
            format!("{in_error} protection modules report errors"),
        );
    }

    issues
}

/// Evaluates a whole fleet.
pub fn evaluate_fleet(
    observations: &[DeviceObservation],
    thresholds: &Thresholds,
    now: DateTime<Utc>,
) -> HealthReport {
    let mut summary = HealthSummary::default();
    let mut issues = Vec::new();
    let mut evaluated = 0usize;
    let mut compliant = 0usize;

    for observation in observations {
        let Some(health) = &observation.health else {
            continue;
        };
        evaluated += 1;
        summary.count(health.overall_health);
        let device_issues = evaluate_device(&observation.snapshot, health, thresholds, now);
        if !device_issues.iter().any(|i| i.severity == Severity::Critical) {
            compliant += 1;
        }
        issues.extend(device_issues);
    }

    let compliance_percentage = if evaluated == 0 {
        100.0
    } else {
        compliant as f64 * 100.0 / evaluated as f64
    };

    HealthReport {
        generated_at: now,
        total_devices: observations.len(),
        evaluated,
        unavailable: observations.len() - evaluated,
        summary,
        issues,
        compliance_percentage,
    }
}

/// Lists the fleet, reads every device's health with bounded concurrency,
/// and evaluates the result.
///
/// # Errors
///
/// Only the device listing and malformed batch options propagate; failed
/// health reads count as unavailable.
pub async fn run_health_check(
    client: &ApiClient,
    thresholds: &Thresholds,
    options: &BatchOptions,
    page_size: u32,
) -> Result<HealthReport> {
    let mut devices = list_devices(client, page_size).await?;
    let mut seen = HashSet::new();
    devices.retain(|d| {
        let first = seen.insert(d.id.clone());
        if !first {
            debug!(device_id = %d.id, "device listed more than once");
        }
        first
    });
    let ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();

    let batch = run_batch("health_check", &ids, options, client.clock(), |id| async move {
        get_device_health(client, &id).await
    })
    .await?;

    let records: HashMap<&str, &DeviceHealth> = batch.successes().collect();
    for (id, error) in batch.failures() {
        warn!(device_id = id, error, "health record unavailable");
    }

    let observations: Vec<DeviceObservation> = devices
        .into_iter()
        .map(|snapshot| {
            let health = records.get(snapshot.id.as_str()).map(|h| (*h).clone());
            DeviceObservation { snapshot, health }
        })
        .collect();

    let report = evaluate_fleet(&observations, thresholds, client.clock().utc_now());
    info!(
        devices = report.total_devices,
        issues = report.issues.len(),
        unavailable = report.unavailable,
        compliance = report.compliance_percentage,
        "health check finished"
    );

    client.audit().record(
        AuditEvent::new(AuditCategory::HealthCheck, "run_health_check", "fleet")
            .resource(batch.operation_id.to_string())
            .detail("devices", report.total_devices)
            .detail("issues", report.issues.len())
            .detail("critical", report.count_severity(Severity::Critical))
            .detail("unavailable", report.unavailable),
    );
    Ok(report)
}
