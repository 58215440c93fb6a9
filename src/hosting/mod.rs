//! Workflow hosting: registration, method dispatch and instance creation control.
//!
//! `invoke_method` routes an external call to the first running instance whose id, parsed from
//! the call arguments, matches; otherwise it creates a new instance. With persistence
//! configured, creation runs under the `create-lock:<workflow>` lease and an overall creation
//! budget. Without persistence, creation is serialized per workflow by an in-process gate.
use crate::activities::{Activity, ActivityState, Tracker};
use crate::error::{Result, WorkflowError};
use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod fs;
pub mod in_memory;
pub mod instance;
pub mod instance_id_parser;
pub mod persistence;
pub mod registry;

pub use fs::FsPersistence;
pub use in_memory::InMemoryPersistence;
pub use instance::{IdleMethod, InstanceSnapshot, WorkflowInstance};
pub use instance_id_parser::InstanceIdParser;
pub use persistence::{LockInfo, RunningInstanceIdPath, WorkflowPersistence};
pub use registry::{WorkflowDefinition, WorkflowDescriptor, WorkflowRegistry};

/// Timeouts applied by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOptions {
    /// How long to wait for the creation lock.
    /// Default: 1000ms
    pub enter_lock_timeout_ms: u64,
    /// Lease duration of the creation lock.
    /// Default: 1000ms
    pub lock_hold_timeout_ms: u64,
    /// Budget for creating, persisting and registering a new instance.
    /// Default: 1000ms
    pub creation_timeout_ms: u64,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            enter_lock_timeout_ms: 1000,
            lock_hold_timeout_ms: 1000,
            creation_timeout_ms: 1000,
        }
    }
}

impl HostOptions {
    pub fn enter_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.enter_lock_timeout_ms)
    }

    pub fn lock_hold_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_hold_timeout_ms)
    }

    pub fn creation_timeout(&self) -> Duration {
        Duration::from_millis(self.creation_timeout_ms)
    }
}

type SharedInstance = Arc<Mutex<WorkflowInstance>>;

pub struct WorkflowHost {
    options: HostOptions,
    registry: Mutex<WorkflowRegistry>,
    trackers: Mutex<Vec<Arc<dyn Tracker>>>,
    persistence: Mutex<Option<Arc<dyn WorkflowPersistence>>>,
    is_initialized: AtomicBool,
    pub instance_id_parser: InstanceIdParser,
    known_running: Mutex<HashMap<String, SharedInstance>>,
    creation_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for WorkflowHost {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowHost {
    pub fn new() -> Self {
        Self::with_options(HostOptions::default())
    }

    pub fn with_options(options: HostOptions) -> Self {
        crate::logging::init_tracing();
        Self {
            options,
            registry: Mutex::new(WorkflowRegistry::new()),
            trackers: Mutex::new(Vec::new()),
            persistence: Mutex::new(None),
            is_initialized: AtomicBool::new(false),
            instance_id_parser: InstanceIdParser,
            known_running: Mutex::new(HashMap::new()),
            creation_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::SeqCst)
    }

    /// Configure persistence. Fails once the host has dispatched its first call.
    pub async fn set_persistence(&self, persistence: Arc<dyn WorkflowPersistence>) -> Result<()> {
        let mut slot = self.persistence.lock().await;
        if self.is_initialized() {
            return Err(WorkflowError::AlreadyInitialized);
        }
        *slot = Some(persistence);
        Ok(())
    }

    pub async fn persistence(&self) -> Option<Arc<dyn WorkflowPersistence>> {
        self.persistence.lock().await.clone()
    }

    async fn initialize(&self) -> Option<Arc<dyn WorkflowPersistence>> {
        let slot = self.persistence.lock().await;
        if !self.is_initialized.swap(true, Ordering::SeqCst) {
            debug!(persistence = slot.is_some(), "host initialized");
        }
        slot.clone()
    }

    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        self.registry.lock().await.register(definition)?;
        Ok(())
    }

    /// Register a single activity as workflow `name`.
    pub async fn register_activity(&self, activity: Activity, name: &str, version: &str) -> Result<()> {
        let definition = WorkflowDefinition::new(name, version, Activity::block(vec![activity]))?;
        self.register_workflow(definition).await
    }

    /// Attach a tracker to future instances and to every instance currently held in memory.
    pub async fn add_tracker(&self, tracker: Arc<dyn Tracker>) {
        self.trackers.lock().await.push(tracker.clone());
        let instances: Vec<SharedInstance> = self.known_running.lock().await.values().cloned().collect();
        for instance in instances {
            instance.lock().await.add_tracker(tracker.clone());
        }
    }

    /// Ids of idle instances held in memory.
    pub async fn running_instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.known_running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn invoke_method(&self, workflow_name: &str, method_name: &str, args: Value) -> Result<Value> {
        let workflow_name = workflow_name.trim();
        if workflow_name.is_empty() {
            return Err(WorkflowError::Type("argument 'workflowName' is not a non-empty string".to_string()));
        }
        let method_name = method_name.trim();
        if method_name.is_empty() {
            return Err(WorkflowError::Type("argument 'methodName' is not a non-empty string".to_string()));
        }

        let persistence = self.initialize().await;
        let paths = self
            .running_instance_id_paths(persistence.as_deref(), workflow_name, method_name)
            .await?;
        if let Some(instance_id) = self.match_running(&paths, &args) {
            return self
                .invoke_on_running(persistence.as_deref(), &instance_id, method_name, args)
                .await;
        }
        self.create_and_invoke(persistence, workflow_name, method_name, args).await
    }

    async fn running_instance_id_paths(
        &self,
        persistence: Option<&dyn WorkflowPersistence>,
        workflow_name: &str,
        method_name: &str,
    ) -> Result<Vec<RunningInstanceIdPath>> {
        if let Some(p) = persistence {
            return Ok(p.get_running_instance_id_paths(workflow_name, method_name).await?);
        }
        let instances: Vec<SharedInstance> = self.known_running.lock().await.values().cloned().collect();
        let mut out = Vec::new();
        for instance in instances {
            let instance = instance.lock().await;
            if instance.workflow_name() != workflow_name {
                continue;
            }
            out.extend(
                instance
                    .idle_methods()
                    .into_iter()
                    .filter(|m| m.method_name == method_name)
                    .map(|m| RunningInstanceIdPath {
                        instance_id: instance.id().to_string(),
                        value: m.instance_id_path,
                    }),
            );
        }
        Ok(out)
    }

    /// First candidate whose id, parsed from `args`, equals its own id.
    fn match_running(&self, paths: &[RunningInstanceIdPath], args: &Value) -> Option<String> {
        paths
            .iter()
            .find(|p| {
                p.value
                    .as_deref()
                    .and_then(|path| self.instance_id_parser.parse(path, args))
                    .is_some_and(|id| id == p.instance_id)
            })
            .map(|p| p.instance_id.clone())
    }

    async fn invoke_on_running(
        &self,
        persistence: Option<&dyn WorkflowPersistence>,
        instance_id: &str,
        method_name: &str,
        args: Value,
    ) -> Result<Value> {
        let instance = self.running_instance(persistence, instance_id).await?;
        let mut instance = instance.lock().await;
        debug!(instance = instance_id, method = method_name, "invoking method on running instance");
        let result = instance.call_method(method_name, args).await;

        match instance.exec_state() {
            ActivityState::Idle => {
                if let Some(p) = persistence {
                    p.persist_state(&instance.snapshot()?).await?;
                }
            }
            state if state.is_terminal() => {
                info!(instance = instance_id, state = %state, "instance finished");
                self.known_running.lock().await.remove(instance_id);
                if let Some(p) = persistence {
                    p.remove_state(instance_id).await?;
                }
            }
            _ => {}
        }
        result
    }

    /// The in-memory instance, restoring it from persistence when it is not loaded.
    async fn running_instance(
        &self,
        persistence: Option<&dyn WorkflowPersistence>,
        instance_id: &str,
    ) -> Result<SharedInstance> {
        let mut known = self.known_running.lock().await;
        if let Some(instance) = known.get(instance_id) {
            return Ok(instance.clone());
        }
        let p = persistence.ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))?;
        let snapshot = p
            .load_state(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))?;
        let descriptor = self
            .registry
            .lock()
            .await
            .get_version(&snapshot.workflow_name, &snapshot.workflow_version)
            .ok_or_else(|| {
                WorkflowError::UnknownWorkflow(format!("{}@{}", snapshot.workflow_name, snapshot.workflow_version))
            })?;
        let mut instance = WorkflowInstance::restore(descriptor, &snapshot)?;
        for tracker in self.trackers.lock().await.iter() {
            instance.add_tracker(tracker.clone());
        }
        let shared = Arc::new(Mutex::new(instance));
        known.insert(instance_id.to_string(), shared.clone());
        Ok(shared)
    }

    async fn create_and_invoke(
        &self,
        persistence: Option<Arc<dyn WorkflowPersistence>>,
        workflow_name: &str,
        method_name: &str,
        args: Value,
    ) -> Result<Value> {
        let descriptor = self
            .registry
            .lock()
            .await
            .get_desc(workflow_name)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_name.to_string()))?;
        if !descriptor.create_instance_methods.contains(method_name) {
            return Err(WorkflowError::CannotCreateInstance {
                workflow: workflow_name.to_string(),
                method: method_name.to_string(),
            });
        }

        let Some(p) = persistence else {
            let gate = self.creation_gate(workflow_name).await;
            let _guard = gate.lock().await;
            return self
                .create_checked(None, descriptor, method_name, args, None, &mut None)
                .await;
        };

        let lock_name = format!("create-lock:{workflow_name}");
        let lock = p
            .enter_lock(&lock_name, self.options.enter_lock_timeout(), self.options.lock_hold_timeout())
            .await?
            .ok_or_else(|| WorkflowError::LockTimeout {
                lock_name: lock_name.clone(),
            })?;
        debug!(workflow = workflow_name, lock = %lock_name, token = %lock.token, "creation lock entered");

        let mut written = None;
        let result = tokio::time::timeout(
            self.options.creation_timeout(),
            self.create_checked(
                Some(p.as_ref()),
                descriptor,
                method_name,
                args,
                Some(lock.clone()),
                &mut written,
            ),
        )
        .await;

        let result = match result {
            Ok(result) => result,
            Err(_) => {
                warn!(workflow = workflow_name, method = method_name, "instance creation timed out");
                if let Some(instance_id) = written {
                    self.discard(p.as_ref(), &instance_id).await;
                }
                Err(WorkflowError::CreationTimeout {
                    workflow: workflow_name.to_string(),
                    timeout_ms: self.options.creation_timeout_ms,
                })
            }
        };
        if let Err(e) = p.exit_lock(&lock).await {
            warn!(lock = %lock_name, error = %e, "failed to exit creation lock");
        }
        result
    }

    /// Drop every trace of an instance whose creation did not finish.
    async fn discard(&self, persistence: &dyn WorkflowPersistence, instance_id: &str) {
        self.known_running.lock().await.remove(instance_id);
        if let Err(e) = persistence.remove_state(instance_id).await {
            warn!(instance = instance_id, error = %e, "failed to remove state of abandoned instance");
        }
    }

    /// Repeat the running-instance lookup inside the creation lock, then create. `written`
    /// receives the id of a new instance before its state is handed to persistence.
    async fn create_checked(
        &self,
        persistence: Option<&dyn WorkflowPersistence>,
        descriptor: Arc<WorkflowDescriptor>,
        method_name: &str,
        args: Value,
        lock: Option<LockInfo>,
        written: &mut Option<String>,
    ) -> Result<Value> {
        let paths = self
            .running_instance_id_paths(persistence, &descriptor.name, method_name)
            .await?;
        if let Some(instance_id) = self.match_running(&paths, &args) {
            debug!(instance = %instance_id, "instance appeared while waiting to create");
            return self
                .invoke_on_running(persistence, &instance_id, method_name, args)
                .await;
        }

        let instance_id = WorkflowInstance::id_for_call(&descriptor, method_name, &args)?;
        let exists = match persistence {
            Some(p) => p.load_state(&instance_id).await?.is_some(),
            None => self.known_running.lock().await.contains_key(&instance_id),
        };
        if exists {
            return Err(WorkflowError::InstanceExists(instance_id));
        }

        let mut instance = WorkflowInstance::new(descriptor, instance_id);
        for tracker in self.trackers.lock().await.iter() {
            instance.add_tracker(tracker.clone());
        }
        let result = instance.create(method_name, args, lock).await;

        if result.is_ok() && instance.exec_state() == ActivityState::Idle {
            if let Some(p) = persistence {
                *written = Some(instance.id().to_string());
                p.persist_state(&instance.snapshot()?).await?;
            }
            debug!(instance = %instance.id(), workflow = %instance.workflow_name(), "instance is idle, registering");
            self.known_running
                .lock()
                .await
                .insert(instance.id().to_string(), Arc::new(Mutex::new(instance)));
        }
        result
    }

    async fn creation_gate(&self, workflow_name: &str) -> Arc<Mutex<()>> {
        self.creation_gates
            .lock()
            .await
            .entry(workflow_name.to_string())
            .or_default()
            .clone()
    }
}
