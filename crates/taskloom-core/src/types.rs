use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LoomError;

/// Opaque key/value data handed to and returned from processors.
pub type Payload = HashMap<String, serde_json::Value>;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request category. Selects which compiled session graph runs.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestCategory {
    Chat,
    Analytics,
    Device,
    Operations,
    Automation,
    Workflow,
    Hybrid,
}

impl RequestCategory {
    /// Every category, hybrid last.
    pub const ALL: [RequestCategory; 7] = [
        Self::Chat,
        Self::Analytics,
        Self::Device,
        Self::Operations,
        Self::Automation,
        Self::Workflow,
        Self::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Analytics => "analytics",
            Self::Device => "device",
            Self::Operations => "operations",
            Self::Automation => "automation",
            Self::Workflow => "workflow",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestCategory {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| LoomError::Graph(format!("Unknown category: {}", s)))
    }
}

/// Scheduler lifecycle events, published on the [`EventBus`](crate::EventBus).
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Workflow execution started.
    WorkflowStarted { workflow_id: String, total_tasks: usize },
    /// A task was dispatched to its processor.
    TaskStarted {
        workflow_id: String,
        task_id: String,
        attempt: u32,
    },
    /// A task finished successfully.
    TaskCompleted {
        workflow_id: String,
        task_id: String,
        elapsed_ms: u64,
    },
    /// A task failed and will be re-dispatched.
    TaskRetrying {
        workflow_id: String,
        task_id: String,
        remaining_retries: u32,
        error: String,
    },
    /// A task failed permanently.
    TaskFailed {
        workflow_id: String,
        task_id: String,
        error: String,
    },
    /// Every task completed.
    WorkflowCompleted { workflow_id: String, elapsed_ms: u64 },
    /// Workflow aborted (validation, task failure or timeout).
    WorkflowFailed { workflow_id: String, error: String },
    /// Workflow stopped by a cancel request.
    WorkflowCancelled { workflow_id: String },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { workflow_id, .. }
            | Self::TaskStarted { workflow_id, .. }
            | Self::TaskCompleted { workflow_id, .. }
            | Self::TaskRetrying { workflow_id, .. }
            | Self::TaskFailed { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::WorkflowCancelled { workflow_id } => workflow_id,
        }
    }
}
