//! Job lifecycle notifications fanned out to in-process subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use patchflow_core::{JobId, RunId, TenantId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    pub tenant_id: TenantId,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// e.g. `job.completed`, `job.dead_lettered`, or a `notify` job's own event name.
    pub event: String,
    #[serde(default)]
    pub data: JsonValue,
    pub at: DateTime<Utc>,
}

/// Sending half shared by workers and handlers. Sends without subscribers are dropped.
pub type Notifier = broadcast::Sender<JobNotification>;

pub fn channel(capacity: usize) -> Notifier {
    let (tx, _rx) = broadcast::channel(capacity);
    tx
}
