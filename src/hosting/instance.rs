use super::instance_id_parser::InstanceIdParser;
use super::persistence::LockInfo;
use super::registry::WorkflowDescriptor;
use crate::activities::{ActivityState, EngineSnapshot, Tracker, WorkflowEngine};
use crate::error::{Result, WorkflowError};
use crate::Value;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// External call a suspended instance can accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleMethod {
    pub method_name: String,
    pub instance_id_path: Option<String>,
}

/// Persisted form of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub workflow_name: String,
    pub workflow_version: Version,
    pub exec_state: ActivityState,
    pub idle_methods: Vec<IdleMethod>,
    #[serde(default)]
    pub promoted: BTreeMap<String, Value>,
    pub engine: EngineSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockInfo>,
}

/// One execution of a workflow definition.
pub struct WorkflowInstance {
    id: String,
    descriptor: Arc<WorkflowDescriptor>,
    engine: WorkflowEngine,
    lock: Option<LockInfo>,
}

impl WorkflowInstance {
    pub fn new(descriptor: Arc<WorkflowDescriptor>, id: impl Into<String>) -> Self {
        let id = id.into();
        let engine = WorkflowEngine::with_instance_id(id.clone(), &descriptor.root);
        Self {
            id,
            descriptor,
            engine,
            lock: None,
        }
    }

    /// Id a new instance created by `method_name` with `args` gets: parsed from the arguments
    /// when the creating method declares an id path, otherwise a fresh UUID.
    pub fn id_for_call(descriptor: &WorkflowDescriptor, method_name: &str, args: &Value) -> Result<String> {
        let spec = descriptor
            .root
            .methods()
            .into_iter()
            .find(|m| m.can_create_instance && m.method_name == method_name)
            .ok_or_else(|| WorkflowError::CannotCreateInstance {
                workflow: descriptor.name.clone(),
                method: method_name.to_string(),
            })?;
        match &spec.instance_id_path {
            Some(path) => InstanceIdParser.parse(path, args).ok_or_else(|| {
                WorkflowError::InvalidArgument(format!(
                    "instance id path '{path}' of method '{method_name}' does not resolve in the call arguments"
                ))
            }),
            None => Ok(Uuid::new_v4().to_string()),
        }
    }

    /// Run the tree from the start with `method_name`/`args` as the initiating call, until the
    /// first idle or terminal state.
    ///
    /// Returns the root's result when the tree finished, otherwise the arguments accepted by
    /// the initiating method.
    pub async fn create(&mut self, method_name: &str, args: Value, lock: Option<LockInfo>) -> Result<Value> {
        self.lock = lock;
        debug!(instance = %self.id, workflow = %self.descriptor.name, method = method_name, "creating instance");
        self.engine.offer_call(method_name, args.clone());
        self.engine.start(vec![args])?;
        self.engine.run_until_stable().await?;
        if self.engine.take_unconsumed_call().is_some() {
            return Err(WorkflowError::MethodNotReached {
                workflow: self.descriptor.name.clone(),
                method: method_name.to_string(),
                state: self.exec_state(),
            });
        }
        info!(instance = %self.id, workflow = %self.descriptor.name, state = %self.exec_state(), "instance created");
        self.call_result()
    }

    /// Resume the idle method `method_name` with `args` and run to the next stable state.
    pub async fn call_method(&mut self, method_name: &str, args: Value) -> Result<Value> {
        if self.exec_state() != ActivityState::Idle {
            return Err(WorkflowError::NoIdleMethod {
                instance: self.id.clone(),
                method: method_name.to_string(),
            });
        }
        self.engine.resume_bookmark(method_name, args)?;
        self.engine.run_until_stable().await?;
        debug!(instance = %self.id, method = method_name, state = %self.exec_state(), "method call finished");
        self.call_result()
    }

    fn call_result(&mut self) -> Result<Value> {
        let accepted = self.engine.take_method_result();
        match self.engine.root_outcome() {
            Some(outcome) => outcome.clone().into_result(),
            None => Ok(accepted.unwrap_or(Value::Null)),
        }
    }

    pub fn add_tracker(&mut self, tracker: Arc<dyn Tracker>) {
        self.engine.add_tracker(tracker);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workflow_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn workflow_version(&self) -> &Version {
        &self.descriptor.version
    }

    pub fn lock_info(&self) -> Option<&LockInfo> {
        self.lock.as_ref()
    }

    pub fn exec_state(&self) -> ActivityState {
        self.engine.exec_state()
    }

    pub fn idle_methods(&self) -> Vec<IdleMethod> {
        self.engine
            .bookmarks()
            .iter()
            .map(|b| IdleMethod {
                method_name: b.method_name.clone(),
                instance_id_path: b.instance_id_path.clone(),
            })
            .collect()
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn snapshot(&self) -> Result<InstanceSnapshot> {
        Ok(InstanceSnapshot {
            instance_id: self.id.clone(),
            workflow_name: self.descriptor.name.clone(),
            workflow_version: self.descriptor.version.clone(),
            exec_state: self.exec_state(),
            idle_methods: self.idle_methods(),
            promoted: self.engine.promoted_values(),
            engine: self.engine.snapshot()?,
            lock: self.lock.clone(),
        })
    }

    /// Rebuild an instance of `descriptor` from a snapshot taken by [`WorkflowInstance::snapshot`].
    pub fn restore(descriptor: Arc<WorkflowDescriptor>, snapshot: &InstanceSnapshot) -> Result<Self> {
        if snapshot.workflow_name != descriptor.name || snapshot.workflow_version != descriptor.version {
            return Err(WorkflowError::InvalidArgument(format!(
                "snapshot of {}@{} cannot be restored as {}@{}",
                snapshot.workflow_name, snapshot.workflow_version, descriptor.name, descriptor.version
            )));
        }
        let engine = WorkflowEngine::restore(snapshot.instance_id.clone(), &descriptor.root, &snapshot.engine)?;
        debug!(instance = %snapshot.instance_id, workflow = %descriptor.name, "instance restored");
        Ok(Self {
            id: snapshot.instance_id.clone(),
            descriptor,
            engine,
            lock: snapshot.lock.clone(),
        })
    }
}
