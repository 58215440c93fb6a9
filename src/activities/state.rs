use crate::error::{Result, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Identity of an activity inside one workflow instance.
///
/// Ids are assigned in instantiation order, so the same definition always yields the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(pub u32);

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of one activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    /// Not started, or suspended awaiting an external call.
    Idle,
    Run,
    Complete,
    Fault,
    Cancel,
}

impl ActivityState {
    pub const ALL: [ActivityState; 5] = [
        ActivityState::Idle,
        ActivityState::Run,
        ActivityState::Complete,
        ActivityState::Fault,
        ActivityState::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Idle => "idle",
            ActivityState::Run => "run",
            ActivityState::Complete => "complete",
            ActivityState::Fault => "fault",
            ActivityState::Cancel => "cancel",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActivityState::Complete | ActivityState::Fault | ActivityState::Cancel
        )
    }

    /// Whether `self -> to` is a legal edge of the activity state machine.
    pub fn can_transition_to(&self, to: ActivityState) -> bool {
        use ActivityState::*;
        matches!(
            (self, to),
            (Idle, Run) | (Idle, Cancel) | (Run, Idle) | (Run, Complete) | (Run, Fault) | (Run, Cancel)
        )
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityState {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        ActivityState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| {
                WorkflowError::Type(format!(
                    "execState value '{s}' is not a valid activity state"
                ))
            })
    }
}

/// Per-activity runtime record: the unit of persistence and of state-change notification.
///
/// Only `exec_state` is serialized; parent and child linkage is rebuilt from the definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityExecutionState {
    pub activity_id: ActivityId,
    pub exec_state: ActivityState,
    pub parent_activity_id: Option<ActivityId>,
    pub child_activity_ids: BTreeSet<ActivityId>,
}

impl ActivityExecutionState {
    pub fn new(activity_id: ActivityId) -> Self {
        Self {
            activity_id,
            exec_state: ActivityState::Idle,
            parent_activity_id: None,
            child_activity_ids: BTreeSet::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.exec_state == ActivityState::Run
    }

    /// Move to `to`, returning the previous state. Terminal states are sinks.
    pub fn transition(&mut self, to: ActivityState) -> Result<ActivityState> {
        let from = self.exec_state;
        if !from.can_transition_to(to) {
            return Err(WorkflowError::InvalidTransition {
                activity: self.activity_id.to_string(),
                from,
                to,
            });
        }
        self.exec_state = to;
        Ok(from)
    }

    pub fn as_json(&self) -> serde_json::Value {
        json!({ "execState": self.exec_state.as_str() })
    }

    /// Load the persisted `{ "execState": ... }` record. Never falls back to a default.
    pub fn from_json(&mut self, json: &serde_json::Value) -> Result<()> {
        let obj = json
            .as_object()
            .ok_or_else(|| WorkflowError::Type("object argument expected".to_string()))?;
        let raw = obj.get("execState").and_then(|v| v.as_str()).ok_or_else(|| {
            WorkflowError::Type("argument object's execState property value is not a string".to_string())
        })?;
        self.exec_state = raw.parse()?;
        Ok(())
    }
}
