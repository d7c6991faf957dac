use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{LoomError, Result};
use crate::types::Payload;

/// Task priority. Higher runs first among ready tasks.
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Lifecycle of a single task.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    /// Was in flight when the workflow stopped; its outcome is discarded.
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work assigned to one agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    /// Selects the processor that executes this task.
    pub agent_type: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_task_timeout_secs")]
    pub timeout_secs: u64,
    /// Remaining retry budget.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Number of times the task has been dispatched.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

fn default_task_timeout_secs() -> u64 {
    SchedulerConfig::default().task_timeout_secs
}

impl Task {
    /// Create a pending task with default priority, timeout and no retries.
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_type: agent_type.into(),
            payload: Payload::new(),
            priority: Priority::default(),
            depends_on: vec![],
            timeout_secs: default_task_timeout_secs(),
            retries: 0,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Wall-clock duration of the latest attempt, if it has finished.
    pub fn elapsed_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// A set of tasks plus execution constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub tasks: Vec<Task>,
    pub max_parallel: usize,
    /// Overall wall-clock budget for the whole workflow.
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Create a definition using the default scheduler limits.
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            tasks,
            max_parallel: defaults.max_parallel,
            timeout_secs: defaults.workflow_timeout_secs,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// File form of a workflow. Omitted limits come from the `[scheduler]` config.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub tasks: Vec<TaskFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub agent_type: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
}

impl WorkflowFile {
    /// Parse a workflow from TOML.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| LoomError::InvalidWorkflow(e.to_string()))
    }

    /// Resolve into a definition, filling gaps from `defaults`.
    pub fn into_definition(self, defaults: &SchedulerConfig) -> WorkflowDefinition {
        let tasks = self
            .tasks
            .into_iter()
            .map(|t| Task {
                name: t.name.unwrap_or_else(|| t.id.clone()),
                payload: t.payload,
                priority: t.priority,
                depends_on: t.depends_on,
                timeout_secs: t.timeout_secs.unwrap_or(defaults.task_timeout_secs),
                retries: t.retries.unwrap_or(defaults.max_retries),
                ..Task::new(t.id, String::new(), t.agent_type)
            })
            .collect();

        WorkflowDefinition {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            tasks,
            max_parallel: self.max_parallel.unwrap_or(defaults.max_parallel),
            timeout_secs: self.timeout_secs.unwrap_or(defaults.workflow_timeout_secs),
            created_at: Utc::now(),
        }
    }
}

/// Scheduler-side lifecycle of a workflow.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    #[default]
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Point-in-time progress of one workflow, as seen by pollers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub state: WorkflowState,
    /// Completed fraction in `[0, 1]`.
    pub progress: f64,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub running_tasks: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub results: HashMap<String, serde_json::Value>,
    pub errors: Vec<String>,
}

impl WorkflowStatus {
    pub fn created(total_tasks: usize) -> Self {
        Self {
            total_tasks,
            ..Self::default()
        }
    }
}

/// Aggregate timing of a completed workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_elapsed_ms: u64,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    /// Completed tasks over total tasks.
    pub success_ratio: f64,
    /// Sum of task elapsed times over workflow elapsed time. Above 1 means
    /// tasks overlapped.
    pub parallel_efficiency: f64,
    pub task_elapsed_ms: HashMap<String, u64>,
}

/// Outcome of a workflow that ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub workflow_id: String,
    pub state: WorkflowState,
    pub results: HashMap<String, serde_json::Value>,
    pub metrics: ExecutionMetrics,
}
