use super::instance::InstanceSnapshot;
use super::persistence::{LOCK_POLL_MS, LockInfo, RunningInstanceIdPath, WorkflowPersistence, running_paths_of};
use crate::error::PersistenceError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::{Instant, sleep};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

/// Filesystem-backed persistence: one JSON document per instance and one file per held lock.
///
/// Lock files are created with `create_new`, so entering is atomic on a local filesystem.
/// Taking over an expired lease is best-effort.
#[derive(Debug, Clone)]
pub struct FsPersistence {
    instances_dir: PathBuf,
    locks_dir: PathBuf,
}

impl FsPersistence {
    /// Create a store rooted at `root`.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Result<Self, PersistenceError> {
        let root = root.as_ref().to_path_buf();
        if reset_on_create && root.exists() {
            std::fs::remove_dir_all(&root).map_err(|e| io_err("reset", e))?;
        }
        let instances_dir = root.join("instances");
        let locks_dir = root.join("locks");
        std::fs::create_dir_all(&instances_dir).map_err(|e| io_err("create", e))?;
        std::fs::create_dir_all(&locks_dir).map_err(|e| io_err("create", e))?;
        Ok(Self {
            instances_dir,
            locks_dir,
        })
    }

    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.instances_dir.join(format!("{}.json", file_stem(instance_id)))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", file_stem(name)))
    }

    async fn try_lock(&self, name: &str, hold_timeout: Duration) -> Result<Option<LockInfo>, PersistenceError> {
        let path = self.lock_path(name);
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(mut file) => {
                    let lock = LockInfo::new(name, hold_timeout);
                    let body = serde_json::to_vec(&lock).map_err(|e| PersistenceError::permanent("enter_lock", e.to_string()))?;
                    file.write_all(&body).await.map_err(|e| io_err("enter_lock", e))?;
                    file.flush().await.map_err(|e| io_err("enter_lock", e))?;
                    return Ok(Some(lock));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !self.is_stale(&path, hold_timeout).await {
                        return Ok(None);
                    }
                    debug!(lock = name, "taking over expired lock");
                    match fs::remove_file(&path).await {
                        Ok(()) => continue,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(io_err("enter_lock", e)),
                    }
                }
                Err(e) => return Err(io_err("enter_lock", e)),
            }
        }
    }

    /// An unreadable lock file may still be being written; it only counts as stale once it is
    /// older than the hold timeout.
    async fn is_stale(&self, path: &Path, hold_timeout: Duration) -> bool {
        match read_lock(path).await {
            Some(held) => held.is_expired(),
            None => match fs::metadata(path).await.and_then(|m| m.modified()) {
                Ok(modified) => SystemTime::now()
                    .duration_since(modified)
                    .is_ok_and(|age| age >= hold_timeout),
                Err(_) => false,
            },
        }
    }
}

async fn read_lock(path: &Path) -> Option<LockInfo> {
    let data = fs::read(path).await.ok()?;
    serde_json::from_slice(&data).ok()
}

fn io_err(operation: &str, e: std::io::Error) -> PersistenceError {
    match e.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            PersistenceError::retryable(operation, e.to_string())
        }
        _ => PersistenceError::permanent(operation, e.to_string()),
    }
}

/// Map arbitrary ids and lock names onto safe file names.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl WorkflowPersistence for FsPersistence {
    async fn enter_lock(
        &self,
        name: &str,
        enter_timeout: Duration,
        hold_timeout: Duration,
    ) -> Result<Option<LockInfo>, PersistenceError> {
        let deadline = Instant::now() + enter_timeout;
        loop {
            if let Some(lock) = self.try_lock(name, hold_timeout).await? {
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
        let path = self.lock_path(&lock.name);
        match read_lock(&path).await {
            Some(held) if held.token == lock.token => match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(lock = %lock.name, token = %lock.token, "lock exited");
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err("exit_lock", e)),
            },
            _ => Ok(()),
        }
    }

    async fn persist_state(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError> {
        let path = self.instance_path(&snapshot.instance_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(snapshot).map_err(|e| PersistenceError::permanent("persist_state", e.to_string()))?;
        fs::write(&tmp, body).await.map_err(|e| io_err("persist_state", e))?;
        fs::rename(&tmp, &path).await.map_err(|e| io_err("persist_state", e))?;
        Ok(())
    }

    async fn load_state(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>, PersistenceError> {
        let data = match fs::read(self.instance_path(instance_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err("load_state", e)),
        };
        let snapshot = serde_json::from_slice(&data).map_err(|e| PersistenceError::permanent("load_state", e.to_string()))?;
        Ok(Some(snapshot))
    }

    async fn remove_state(&self, instance_id: &str) -> Result<(), PersistenceError> {
        match fs::remove_file(self.instance_path(instance_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove_state", e)),
        }
    }

    async fn get_running_instance_id_paths(
        &self,
        workflow_name: &str,
        method_name: &str,
    ) -> Result<Vec<RunningInstanceIdPath>, PersistenceError> {
        let mut entries = fs::read_dir(&self.instances_dir)
            .await
            .map_err(|e| io_err("get_running_instance_id_paths", e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err("get_running_instance_id_paths", e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();

        let mut out = Vec::new();
        for path in files {
            let Ok(data) = fs::read(&path).await else { continue };
            match serde_json::from_slice::<InstanceSnapshot>(&data) {
                Ok(snapshot) => out.extend(running_paths_of(&snapshot, workflow_name, method_name)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable instance document"),
            }
        }
        Ok(out)
    }
}
