use crate::ActivityFault;
use crate::activities::ActivityState;
use thiserror::Error;

/// Errors surfaced by the engine and the host.
///
/// Argument and contract errors are raised at the boundary that detects them and are never
/// wrapped. Activity faults and cancellations reach the caller verbatim through
/// [`WorkflowError::Faulted`] and [`WorkflowError::Cancelled`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shape errors in serialized records (wrong JSON type, unknown enum name).
    #[error("type error: {0}")]
    Type(String),

    #[error("property '{name}' cannot be {attempted} because it's {existing}")]
    DeclarationConflict {
        name: String,
        attempted: &'static str,
        existing: &'static str,
    },

    #[error("malformed workflow definition: {0}")]
    MalformedDefinition(String),

    #[error("workflow '{name}' version {version} is already registered")]
    DuplicateWorkflow { name: String, version: String },

    #[error("workflow '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("cannot set persistence after the host is initialized")]
    AlreadyInitialized,

    #[error("activity {activity} cannot move from {from} to {to}")]
    InvalidTransition {
        activity: String,
        from: ActivityState,
        to: ActivityState,
    },

    #[error("workflow '{workflow}' cannot be created by invoking method '{method}'")]
    CannotCreateInstance { workflow: String, method: String },

    #[error("workflow '{workflow}' settled as {state} before method '{method}' was reached")]
    MethodNotReached {
        workflow: String,
        method: String,
        state: ActivityState,
    },

    #[error("instance '{instance}' has no idle method '{method}'")]
    NoIdleMethod { instance: String, method: String },

    #[error("instance '{0}' was not found")]
    InstanceNotFound(String),

    #[error("instance '{0}' already exists")]
    InstanceExists(String),

    #[error("timed out entering lock '{lock_name}'")]
    LockTimeout { lock_name: String },

    #[error("creating an instance of workflow '{workflow}' exceeded {timeout_ms} ms")]
    CreationTimeout { workflow: String, timeout_ms: u64 },

    #[error("activity faulted: {0}")]
    Faulted(ActivityFault),

    #[error("workflow was cancelled")]
    Cancelled,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        WorkflowError::Serialization(e.to_string())
    }
}

/// Failure reported by a [`crate::hosting::WorkflowPersistence`] backend.
///
/// `retryable` only classifies the failure; the host never retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation}: {message}")]
pub struct PersistenceError {
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl PersistenceError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;
