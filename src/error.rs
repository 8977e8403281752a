use thiserror::Error;

/// Convenience type alias for Results with LoomError
pub type Result<T> = std::result::Result<T, LoomError>;

/// Main error type for taskloom
///
/// Every public operation returns one of these kinds. Store-level errors
/// propagate to callers unchanged; the execution engine wraps agent failures
/// into `ExecutionFailed` and records a short string on the task.
#[derive(Error, Debug)]
pub enum LoomError {
    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Task {task_id} is not assignable: {reason}")]
    NotAssignable { task_id: String, reason: String },

    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("Feature {0} is not approved")]
    FeatureNotApproved(String),

    #[error("Could not acquire file lock on {path} within {timeout_ms}ms")]
    LockTimeout { path: String, timeout_ms: u64 },

    #[error("Hook timed out after {timeout_ms}ms")]
    HookTimeout { timeout_ms: u64 },

    #[error("Blocked by hook: {message}")]
    HookBlock { message: String },

    #[error("Task {task_id} exceeded its {timeout_ms}ms timeout")]
    ExecutionTimeout { task_id: String, timeout_ms: u64 },

    #[error("Task execution failed: {task_id} - {message}")]
    ExecutionFailed { task_id: String, message: String },

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl LoomError {
    /// Short machine-friendly string recorded on `task.last_error`.
    pub fn short(&self) -> String {
        match self {
            LoomError::ExecutionTimeout { .. } => "timeout".to_string(),
            LoomError::HookBlock { message } => format!("blocked_by_hook: {message}"),
            LoomError::ExecutionFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
