//! Device listing and health reads.
//!
//! - [`list_devices`] walks the paged `api/v1/devices` collection.
//! - [`get_device_health`] reads one device's protection/health record.
//!
//! Both calls go through the request pipeline and are audit-logged with
//! their outcome. Response types use `Option`/`#[serde(default)]` wherever
//! the platform may omit a field, and ignore unknown fields for forward
//! compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::{AuditCategory, AuditEvent};
use crate::client::{ApiClient, ApiRequest};
use crate::error::Result;

// ── Snapshot types ─────────────────────────────────────────────────────

/// Connectivity reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Agent is connected.
    Online,
    /// Agent is not connected.
    Offline,
    /// Any value this client does not recognize.
    #[serde(other)]
    Unknown,
}

/// Operating system descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    /// Platform name, e.g. `Windows 11`.
    #[serde(default)]
    pub name: Option<String>,
    /// Version string.
    #[serde(default)]
    pub version: Option<String>,
}

/// A managed device as listed by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Platform device id.
    pub id: String,
    /// Display name (usually the hostname).
    #[serde(default)]
    pub name: String,
    /// Operating system.
    #[serde(default)]
    pub os: OsInfo,
    /// Connectivity.
    #[serde(default = "unknown_status")]
    pub status: ConnectionStatus,
    /// Last time the agent checked in.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

fn unknown_status() -> ConnectionStatus {
    ConnectionStatus::Unknown
}

impl DeviceSnapshot {
    /// Name for reports; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// One page of the device collection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePage {
    /// Devices on this page.
    #[serde(default)]
    pub devices: Vec<DeviceSnapshot>,
    /// 1-based page number.
    #[serde(default)]
    pub page: Option<u32>,
    /// Total pages, when the platform reports it.
    #[serde(default)]
    pub total_pages: Option<u32>,
}

// ── Health types ───────────────────────────────────────────────────────

/// Platform-reported overall health tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTier {
    /// No problems.
    Healthy,
    /// Degraded.
    Warning,
    /// Needs attention.
    Critical,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

/// Antivirus protection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntivirusStatus {
    /// Real-time protection on.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// When signatures were last updated.
    #[serde(default)]
    pub definitions_updated_at: Option<DateTime<Utc>>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for AntivirusStatus {
    fn default() -> Self {
        AntivirusStatus {
            enabled: true,
            definitions_updated_at: None,
        }
    }
}

/// Active threats on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatSummary {
    /// Number of unresolved threats.
    #[serde(default)]
    pub count: u32,
    /// Highest severity among them, as reported.
    #[serde(default)]
    pub highest_severity: Option<String>,
}

/// Firewall state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallStatus {
    /// Firewall on.
    #[serde(default)]
    pub enabled: bool,
}

/// State of one protection module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Working.
    Ok,
    /// Failing.
    Error,
    /// Turned off.
    Disabled,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

/// One protection module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    /// Module name.
    pub name: String,
    /// Module state.
    pub status: ModuleState,
}

/// Health record for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealth {
    /// Device this record belongs to.
    pub device_id: String,
    /// Overall tier as computed by the platform.
    pub overall_health: HealthTier,
    /// Antivirus protection.
    #[serde(default)]
    pub antivirus: AntivirusStatus,
    /// Active threats.
    #[serde(default)]
    pub threats: ThreatSummary,
    /// Firewall.
    #[serde(default)]
    pub firewall: FirewallStatus,
    /// Protection modules.
    #[serde(default)]
    pub modules: Vec<ModuleStatus>,
}

impl DeviceHealth {
    /// Number of modules in the error state.
    pub fn modules_in_error(&self) -> usize {
        self.modules
            .iter()
            .filter(|m| m.status == ModuleState::Error)
            .count()
    }
}

// ── Endpoint functions ─────────────────────────────────────────────────

/// Lists every device, following pages until the collection is exhausted.
///
/// Paging stops at `totalPages` when reported, otherwise on the first page
/// shorter than `page_size`.
///
/// # Errors
///
/// Any pipeline error from a page request; partial results are discarded.
pub async fn list_devices(client: &ApiClient, page_size: u32) -> Result<Vec<DeviceSnapshot>> {
    let result = fetch_all_pages(client, page_size.max(1)).await;
    let event = AuditEvent::new(AuditCategory::DeviceQuery, "list_devices", "device");
    let event = match &result {
        Ok(devices) => event.detail("count", devices.len()),
        Err(_) => event,
    };
    client.audit_result(event, &result);
    result
}

async fn fetch_all_pages(client: &ApiClient, page_size: u32) -> Result<Vec<DeviceSnapshot>> {
    let mut devices = Vec::new();
    let mut page = 1u32;
    loop {
        let request = ApiRequest::get("api/v1/devices")
            .query("page", page)
            .query("pageSize", page_size);
        let response: DevicePage = client.send_json(&request).await?;
        let received = response.devices.len();
        devices.extend(response.devices);
        debug!(page, received, "fetched device page");

        let last_page = match response.total_pages {
            Some(total) => page >= total,
            None => received < page_size as usize,
        };
        if last_page || received == 0 {
            return Ok(devices);
        }
        page += 1;
    }
}

/// Reads the health record of one device.
///
/// # Errors
///
/// - `EppError::Api`: e.g. 404 for an unknown device.
/// - `EppError::Auth` / `EppError::Network`: auth or transport failure.
pub async fn get_device_health(client: &ApiClient, device_id: &str) -> Result<DeviceHealth> {
    let path = format!("api/v1/devices/{device_id}/health");
    let result = client.get(&path).await;
    let event = AuditEvent::new(AuditCategory::DeviceQuery, "get_device_health", "device")
        .resource(device_id);
    client.audit_result(event, &result);
    result
}
