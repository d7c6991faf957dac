use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoomError {
    // Workflow validation errors
    #[error("Invalid dependency: task(s) reference unknown id(s): {}", .missing.join(", "))]
    InvalidDependency { missing: Vec<String> },

    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    // Scheduler errors
    #[error("Task {task_id} failed after {attempts} attempt(s): {message}")]
    TaskExecution {
        task_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Workflow {workflow_id} timed out after {timeout_secs}s")]
    WorkflowTimeout {
        workflow_id: String,
        timeout_secs: u64,
    },

    #[error("Workflow cancelled: {0}")]
    WorkflowCancelled(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("No processor registered for agent type: {0}")]
    UnknownAgentType(String),

    #[error("Processor error: {0}")]
    Processor(String),

    // Session graph errors
    #[error("Session exceeded max iterations ({0})")]
    IterationLimitExceeded(u32),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // Checkpoint errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoomError {
    /// Whether a failed attempt may be retried against the task's budget.
    ///
    /// A missing processor can never succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LoomError::UnknownAgentType(_))
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;
