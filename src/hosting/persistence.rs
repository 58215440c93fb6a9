use super::instance::InstanceSnapshot;
use crate::error::PersistenceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lease on a named lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub name: String,
    pub token: Uuid,
    pub acquired_at_ms: u64,
    /// The lease may be taken over by another caller after this instant.
    pub held_until_ms: u64,
}

impl LockInfo {
    pub fn new(name: impl Into<String>, hold_timeout: Duration) -> Self {
        let now = now_ms();
        Self {
            name: name.into(),
            token: Uuid::new_v4(),
            acquired_at_ms: now,
            held_until_ms: now.saturating_add(hold_timeout.as_millis() as u64),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_ms() >= self.held_until_ms
    }
}

/// A running instance exposing an idle method, and the path that computes its id from the
/// call arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningInstanceIdPath {
    pub instance_id: String,
    pub value: Option<String>,
}

/// Durable store consumed by the host.
///
/// Locks are advisory leases: a holder that never calls `exit_lock` loses the lock once its
/// hold timeout passes.
#[async_trait]
pub trait WorkflowPersistence: Send + Sync {
    /// Acquire `name`, waiting at most `enter_timeout`. `Ok(None)` means the wait expired.
    async fn enter_lock(
        &self,
        name: &str,
        enter_timeout: Duration,
        hold_timeout: Duration,
    ) -> Result<Option<LockInfo>, PersistenceError>;

    /// Release a lock. Releasing a lease that was already taken over is a no-op.
    async fn exit_lock(&self, lock: &LockInfo) -> Result<(), PersistenceError>;

    async fn persist_state(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError>;

    async fn load_state(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>, PersistenceError>;

    async fn remove_state(&self, instance_id: &str) -> Result<(), PersistenceError>;

    /// Persisted instances of `workflow_name` with an idle method named `method_name`.
    async fn get_running_instance_id_paths(
        &self,
        workflow_name: &str,
        method_name: &str,
    ) -> Result<Vec<RunningInstanceIdPath>, PersistenceError>;
}

/// Idle-method entries of `snapshot` matching `workflow_name`/`method_name`.
pub(crate) fn running_paths_of(
    snapshot: &InstanceSnapshot,
    workflow_name: &str,
    method_name: &str,
) -> Vec<RunningInstanceIdPath> {
    if snapshot.workflow_name != workflow_name {
        return Vec::new();
    }
    snapshot
        .idle_methods
        .iter()
        .filter(|m| m.method_name == method_name)
        .map(|m| RunningInstanceIdPath {
            instance_id: snapshot.instance_id.clone(),
            value: m.instance_id_path.clone(),
        })
        .collect()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Poll interval while waiting for a held lock.
pub(crate) const LOCK_POLL_MS: u64 = 5;
