use super::instance::InstanceSnapshot;
use super::persistence::{LOCK_POLL_MS, LockInfo, RunningInstanceIdPath, WorkflowPersistence, running_paths_of};
use crate::error::PersistenceError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// Process-local persistence. Useful for tests and for hosts that only need the creation lock.
#[derive(Default)]
pub struct InMemoryPersistence {
    locks: Mutex<HashMap<String, LockInfo>>,
    instances: Mutex<BTreeMap<String, InstanceSnapshot>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn instance_ids(&self) -> Vec<String> {
        self.instances.lock().await.keys().cloned().collect()
    }

    async fn try_lock(&self, name: &str, hold_timeout: Duration) -> Option<LockInfo> {
        let mut locks = self.locks.lock().await;
        if let Some(held) = locks.get(name)
            && !held.is_expired()
        {
            return None;
        }
        let lock = LockInfo::new(name, hold_timeout);
        locks.insert(name.to_string(), lock.clone());
        Some(lock)
    }
}

#[async_trait]
impl WorkflowPersistence for InMemoryPersistence {
    async fn enter_lock(
        &self,
        name: &str,
        enter_timeout: Duration,
        hold_timeout: Duration,
    ) -> Result<Option<LockInfo>, PersistenceError> {
        let deadline = Instant::now() + enter_timeout;
        loop {
            if let Some(lock) = self.try_lock(name, hold_timeout).await {
                debug!(lock = name, token = %lock.token, "lock entered");
                return Ok(Some(lock));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(Duration::from_millis(LOCK_POLL_MS)).await;
        }
    }

    async fn exit_lock(&self, lock: &LockInfo) -> Result<(), PersistenceError> {
        let mut locks = self.locks.lock().await;
        if locks.get(&lock.name).is_some_and(|held| held.token == lock.token) {
            locks.remove(&lock.name);
            debug!(lock = %lock.name, token = %lock.token, "lock exited");
        }
        Ok(())
    }

    async fn persist_state(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError> {
        self.instances
            .lock()
            .await
            .insert(snapshot.instance_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_state(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>, PersistenceError> {
        Ok(self.instances.lock().await.get(instance_id).cloned())
    }

    async fn remove_state(&self, instance_id: &str) -> Result<(), PersistenceError> {
        self.instances.lock().await.remove(instance_id);
        Ok(())
    }

    async fn get_running_instance_id_paths(
        &self,
        workflow_name: &str,
        method_name: &str,
    ) -> Result<Vec<RunningInstanceIdPath>, PersistenceError> {
        let instances = self.instances.lock().await;
        Ok(instances
            .values()
            .flat_map(|s| running_paths_of(s, workflow_name, method_name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_exit() {
        let store = InMemoryPersistence::new();
        let hold = Duration::from_secs(5);
        let first = store
            .enter_lock("create-lock:A", Duration::from_millis(10), hold)
            .await
            .unwrap()
            .unwrap();
        let second = store
            .enter_lock("create-lock:A", Duration::from_millis(20), hold)
            .await
            .unwrap();
        assert!(second.is_none());

        // other names are independent
        assert!(store
            .enter_lock("create-lock:B", Duration::ZERO, hold)
            .await
            .unwrap()
            .is_some());

        store.exit_lock(&first).await.unwrap();
        assert!(store
            .enter_lock("create-lock:A", Duration::ZERO, hold)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = InMemoryPersistence::new();
        let stale = store
            .enter_lock("l", Duration::ZERO, Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        let fresh = store
            .enter_lock("l", Duration::from_millis(500), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stale.token, fresh.token);

        // the stale holder cannot release the new lease
        store.exit_lock(&stale).await.unwrap();
        assert!(store
            .enter_lock("l", Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());
    }
}
