//! Remote task lifecycle: create, read, approve, cancel, and wait.
//!
//! Tasks are remote-authoritative. The platform drives them through
//!
//! ```text
//! created → pending_approval → approved → running → completed | failed | cancelled
//! ```
//!
//! and this module only reads and polls them. `pending_approval` is entered
//! only when the task was created with `requireApproval`. Approve and
//! cancel against a terminal task are left to the platform to ignore; the
//! client does not re-validate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::{AuditCategory, AuditEvent};
use crate::client::ApiClient;
use crate::error::{EppError, Result};

// ── Task types ─────────────────────────────────────────────────────────

/// Lifecycle status of a remote task.
///
/// `Unknown` absorbs status strings this client does not recognize and is
/// treated as non-terminal while polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, not yet scheduled.
    Created,
    /// Waiting for an operator to approve.
    PendingApproval,
    /// Approved, waiting to run.
    Approved,
    /// Executing on the target devices.
    Running,
    /// Finished; per-device rows carry the individual outcomes.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled before it finished.
    Cancelled,
    /// Unrecognized status string.
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// Whether the platform will move this task any further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::PendingApproval => "pending_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a task performs on its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// On-demand malware scan.
    Scan,
    /// Signature/definition update.
    UpdateDefinitions,
    /// Install the protection agent.
    Install,
    /// Remove the protection agent.
    Uninstall,
    /// Network isolation.
    Isolate,
    /// Any task type this client does not recognize.
    #[serde(other)]
    Other,
}

impl TaskType {
    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Scan => "scan",
            TaskType::UpdateDefinitions => "update_definitions",
            TaskType::Install => "install",
            TaskType::Uninstall => "uninstall",
            TaskType::Isolate => "isolate",
            TaskType::Other => "other",
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = EppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scan" => Ok(TaskType::Scan),
            "update_definitions" => Ok(TaskType::UpdateDefinitions),
            "install" => Ok(TaskType::Install),
            "uninstall" => Ok(TaskType::Uninstall),
            "isolate" => Ok(TaskType::Isolate),
            other => Err(EppError::InvalidInput(format!("unknown task type: {other}"))),
        }
    }
}

/// Body of `POST api/v1/tasks`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    /// Human-readable task name.
    pub name: String,
    /// Kind of work.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Devices the task runs on.
    pub target_device_ids: Vec<String>,
    /// Task-type specific parameters, passed through untouched.
    pub parameters: serde_json::Value,
    /// Hold the task in `pending_approval` until approved.
    pub require_approval: bool,
}

impl CreateTaskRequest {
    /// A task with no parameters that does not need approval.
    pub fn new(name: impl Into<String>, task_type: TaskType, targets: Vec<String>) -> Self {
        CreateTaskRequest {
            name: name.into(),
            task_type,
            target_device_ids: targets,
            parameters: serde_json::Value::Object(Default::default()),
            require_approval: false,
        }
    }

    /// Sets the task parameters.
    pub fn parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the approval requirement.
    pub fn require_approval(mut self, require: bool) -> Self {
        self.require_approval = require;
        self
    }
}

/// Progress counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Number of target devices.
    #[serde(default)]
    pub total: u32,
    /// Devices that finished successfully.
    #[serde(default)]
    pub completed: u32,
    /// Devices that failed.
    #[serde(default)]
    pub failed: u32,
}

/// Outcome of a task on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceResultStatus {
    /// The device finished the task.
    Success,
    /// The device failed the task.
    Failed,
    /// No result yet.
    #[serde(other)]
    Pending,
}

/// One per-device row of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResult {
    /// Device id.
    pub device_id: String,
    /// Outcome on that device.
    pub status: DeviceResultStatus,
    /// Optional detail from the agent.
    #[serde(default)]
    pub message: Option<String>,
}

/// A remote task as returned by every task endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Platform task id.
    pub id: String,
    /// Task name.
    #[serde(default)]
    pub name: String,
    /// Kind of work, when reported.
    #[serde(rename = "type", default)]
    pub task_type: Option<TaskType>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Progress counters.
    #[serde(default)]
    pub progress: TaskProgress,
    /// Per-device rows.
    #[serde(default)]
    pub results: Vec<DeviceResult>,
}

impl Task {
    /// Device ids whose row reports `success`.
    pub fn succeeded_devices(&self) -> Vec<String> {
        self.devices_with(DeviceResultStatus::Success)
    }

    /// Device ids whose row reports `failed`.
    pub fn failed_devices(&self) -> Vec<String> {
        self.devices_with(DeviceResultStatus::Failed)
    }

    fn devices_with(&self, status: DeviceResultStatus) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.device_id.clone())
            .collect()
    }
}

// ── Polling configuration ──────────────────────────────────────────────

/// How [`wait_for_task`] polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay before each status read.
    pub interval: Duration,
    /// Wall-clock budget measured from the first wait.
    pub timeout: Duration,
}

impl PollConfig {
    /// Creates a `PollConfig` with the given interval and timeout.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        PollConfig { interval, timeout }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

// ── Endpoint functions ─────────────────────────────────────────────────

fn task_event(action: &str) -> AuditEvent {
    AuditEvent::new(AuditCategory::TaskManagement, action, "task")
}

/// Creates a task on the platform.
///
/// # Errors
///
/// `EppError::InvalidInput` when `request` has no targets; otherwise any
/// pipeline error.
pub async fn create_task(client: &ApiClient, request: &CreateTaskRequest) -> Result<Task> {
    if request.target_device_ids.is_empty() {
        return Err(EppError::InvalidInput(
            "a task needs at least one target device".into(),
        ));
    }
    let result: Result<Task> = client.post("api/v1/tasks", request).await;
    let event = task_event("create_task")
        .detail("name", request.name.as_str())
        .detail("type", request.task_type.as_str())
        .detail("targets", request.target_device_ids.len())
        .detail("requireApproval", request.require_approval);
    let event = match &result {
        Ok(task) => event.resource(&task.id),
        Err(_) => event,
    };
    client.audit_result(event, &result);
    result
}

/// Reads the current state of a task.
pub async fn get_task(client: &ApiClient, task_id: &str) -> Result<Task> {
    let result = client.get(&format!("api/v1/tasks/{task_id}")).await;
    client.audit_result(task_event("get_task").resource(task_id), &result);
    result
}

/// Approves a task waiting in `pending_approval`.
pub async fn approve_task(client: &ApiClient, task_id: &str) -> Result<Task> {
    let result = client
        .post(&format!("api/v1/tasks/{task_id}/approve"), &serde_json::json!({}))
        .await;
    client.audit_result(task_event("approve_task").resource(task_id), &result);
    result
}

/// Asks the platform to cancel a task.
pub async fn cancel_task(client: &ApiClient, task_id: &str) -> Result<Task> {
    let result = client
        .post(&format!("api/v1/tasks/{task_id}/cancel"), &serde_json::json!({}))
        .await;
    client.audit_result(task_event("cancel_task").resource(task_id), &result);
    result
}

/// Polls a task until it reaches a terminal status.
///
/// Each iteration sleeps `config.interval` on the client's clock, checks the
/// budget, then reads the task. The terminal task is returned as-is whatever
/// the status; callers decide what `failed` or `cancelled` means for them.
/// Timing out leaves the remote task running.
///
/// # Errors
///
/// - `EppError::Timeout`: the budget ran out first.
/// - Any pipeline error from a status read.
pub async fn wait_for_task(client: &ApiClient, task_id: &str, config: &PollConfig) -> Result<Task> {
    let clock = client.clock();
    let started = clock.now();

    loop {
        clock.sleep(config.interval).await;

        let elapsed = clock.now().saturating_duration_since(started);
        if elapsed > config.timeout {
            return Err(EppError::Timeout {
                elapsed,
                task_id: task_id.to_string(),
            });
        }

        let task = get_task(client, task_id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        debug!(task_id, status = %task.status, "task still in progress");
    }
}
