//! Durable workflow host built on cooperative activity trees.
//!
//! A workflow is a tree of [`activities::Activity`] definitions. Each running copy of a tree is
//! a [`hosting::WorkflowInstance`] driven by a single-flow engine until it becomes idle
//! (suspended on external methods) or terminal. The crate provides:
//!
//! - Activity variants: function, block, parallel, pick and method (bookmark)
//! - Scoped variables with declarator resolution of activity-valued variables
//! - `WorkflowHost` dispatch: route a method call to a running instance or create one
//!   under a timeout-bounded creation lock
//! - A `WorkflowPersistence` collaborator trait with in-memory and filesystem backends
use serde::{Deserialize, Serialize};

pub mod activities;
pub mod error;
pub mod hosting;
pub mod logging;

pub use activities::{Activity, ActivityExecutionState, ActivityId, ActivityState, ScopeAccess, StateChange, Tracker};
pub use error::{PersistenceError, Result, WorkflowError};
pub use hosting::{
    HostOptions, InMemoryPersistence, InstanceIdParser, WorkflowDefinition, WorkflowHost, WorkflowInstance,
    WorkflowPersistence,
};

/// Argument and result payloads are plain JSON values.
pub type Value = serde_json::Value;

/// Error raised by an activity body. Travels unchanged to the instance boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ActivityFault {
    pub message: String,
}

impl ActivityFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Early end of an activity body: a fault, or a cancellation reported by the body itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivityError {
    #[error(transparent)]
    Fault(#[from] ActivityFault),
    #[error("cancelled")]
    Cancel,
}

impl ActivityError {
    pub fn fault(message: impl Into<String>) -> Self {
        ActivityError::Fault(ActivityFault::new(message))
    }
}

impl From<ActivityError> for Outcome {
    fn from(e: ActivityError) -> Self {
        match e {
            ActivityError::Fault(fault) => Outcome::Fault(fault),
            ActivityError::Cancel => Outcome::Cancel,
        }
    }
}

/// Terminal outcome of an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "result", rename_all = "lowercase")]
pub enum Outcome {
    Complete(Value),
    Fault(ActivityFault),
    Cancel,
}

impl Outcome {
    pub fn reason(&self) -> ActivityState {
        match self {
            Outcome::Complete(_) => ActivityState::Complete,
            Outcome::Fault(_) => ActivityState::Fault,
            Outcome::Cancel => ActivityState::Cancel,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete(_))
    }

    /// Convert to the caller-facing result: faults and cancellations become errors.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Outcome::Complete(v) => Ok(v),
            Outcome::Fault(fault) => Err(WorkflowError::Faulted(fault)),
            Outcome::Cancel => Err(WorkflowError::Cancelled),
        }
    }
}
