//! Multi-device remediation workflows built on tasks and batches.

use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use crate::audit::{AuditCategory, AuditEvent};
use crate::batch::{BatchOptions, BatchResult, run_batch};
use crate::client::ApiClient;
use crate::error::{EppError, Result};
use crate::tasks::{
    CreateTaskRequest, PollConfig, Task, TaskStatus, TaskType, create_task, wait_for_task,
};

/// Creates one task per device through the batch orchestrator.
///
/// With `wait` set, each item also polls its task to a terminal status, and
/// a task ending `failed` or `cancelled` is recorded as a failed item.
///
/// # Errors
///
/// Only malformed `options`; per-device errors are recorded in the result.
pub async fn run_task_per_device(
    client: &ApiClient,
    template: &CreateTaskRequest,
    device_ids: &[String],
    options: &BatchOptions,
    wait: Option<&PollConfig>,
) -> Result<BatchResult<Task>> {
    let operation = format!("{}_per_device", template.task_type.as_str());
    let clock = client.clock();
    let result = run_batch(&operation, device_ids, options, clock, |device_id| async move {
        let mut request = template.clone();
        request.target_device_ids = vec![device_id];
        let task = create_task(client, &request).await?;
        let Some(poll) = wait else {
            return Ok(task);
        };
        let task = wait_for_task(client, &task.id, poll).await?;
        match task.status {
            TaskStatus::Failed | TaskStatus::Cancelled => Err(EppError::TaskFailed {
                status: task.status.to_string(),
                task_id: task.id,
            }),
            _ => Ok(task),
        }
    })
    .await?;

    client.audit().record(
        AuditEvent::new(AuditCategory::BatchOperation, &operation, "batch")
            .resource(result.operation_id.to_string())
            .detail("total", result.progress.total)
            .detail("succeeded", result.progress.succeeded)
            .detail("failed", result.progress.failed),
    );
    Ok(result)
}

/// Result of [`uninstall_then_reinstall`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReinstallOutcome {
    /// The uninstall task in its terminal state.
    pub uninstall_task: Task,
    /// Devices whose uninstall succeeded, in request order.
    pub succeeded: Vec<String>,
    /// Devices whose uninstall failed or never reported.
    pub failed: Vec<String>,
    /// Reinstall task for `succeeded`; `None` when nothing was uninstalled.
    pub reinstall_task: Option<Task>,
}

/// Uninstalls the agent from `device_ids` with one task, waits for it, and
/// creates a reinstall task covering exactly the devices that reported a
/// successful uninstall.
///
/// A `failed` uninstall task still has its per-device rows honored.
///
/// # Errors
///
/// - `EppError::InvalidInput`: no devices.
/// - `EppError::TaskFailed`: the uninstall task was cancelled.
/// - `EppError::Timeout`: the uninstall task did not finish in time.
/// - Any pipeline error from creating or polling tasks.
pub async fn uninstall_then_reinstall(
    client: &ApiClient,
    device_ids: &[String],
    poll: &PollConfig,
) -> Result<ReinstallOutcome> {
    let result = reinstall_flow(client, device_ids, poll).await;
    let event = AuditEvent::new(AuditCategory::BatchOperation, "uninstall_then_reinstall", "device")
        .detail("devices", device_ids.len());
    let event = match &result {
        Ok(outcome) => event
            .resource(&outcome.uninstall_task.id)
            .detail("reinstalled", outcome.succeeded.len())
            .detail("failed", outcome.failed.len()),
        Err(_) => event,
    };
    client.audit_result(event, &result);
    result
}

async fn reinstall_flow(
    client: &ApiClient,
    device_ids: &[String],
    poll: &PollConfig,
) -> Result<ReinstallOutcome> {
    if device_ids.is_empty() {
        return Err(EppError::InvalidInput("no devices to reinstall".into()));
    }

    let uninstall =
        CreateTaskRequest::new("uninstall agent", TaskType::Uninstall, device_ids.to_vec());
    let created = create_task(client, &uninstall).await?;
    let uninstall_task = wait_for_task(client, &created.id, poll).await?;
    if uninstall_task.status == TaskStatus::Cancelled {
        return Err(EppError::TaskFailed {
            status: uninstall_task.status.to_string(),
            task_id: uninstall_task.id,
        });
    }

    let reported: HashSet<String> = uninstall_task.succeeded_devices().into_iter().collect();
    let (succeeded, failed): (Vec<String>, Vec<String>) = device_ids
        .iter()
        .cloned()
        .partition(|id| reported.contains(id));

    info!(
        task_id = %uninstall_task.id,
        succeeded = succeeded.len(),
        failed = failed.len(),
        "uninstall finished"
    );

    let reinstall_task = if succeeded.is_empty() {
        None
    } else {
        let reinstall =
            CreateTaskRequest::new("reinstall agent", TaskType::Install, succeeded.clone());
        Some(create_task(client, &reinstall).await?)
    };

    Ok(ReinstallOutcome {
        uninstall_task,
        succeeded,
        failed,
        reinstall_task,
    })
}
