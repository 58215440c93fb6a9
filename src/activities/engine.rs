//! Cooperative execution engine for one activity tree.
//!
//! Activities never call each other directly. A running activity uses its [`CallContext`] to
//! schedule children under a typed [`Continuation`]; the engine records the pending set keyed
//! by the parent's id and queues a resume once the set has settled. All work for one tree
//! flows through a single FIFO queue, so the tree is driven by one logical thread of control.
use super::declarator::{self, Declarator, Declared, PendingDeclaration};
use super::scope::{Scope, ScopeAccess, VarValue};
use super::state::{ActivityExecutionState, ActivityId, ActivityState};
use super::{Activity, ActivityKind, FuncCode, MethodSpec, Variable};
use crate::error::{Result, WorkflowError};
use crate::{Outcome, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Observer of activity state changes.
///
/// Called synchronously after the new state is stored and before the engine takes its next
/// scheduling step.
pub trait Tracker: Send + Sync {
    fn activity_state_changed(&self, change: &StateChange);
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub instance_id: String,
    pub activity_id: ActivityId,
    pub activity_kind: &'static str,
    pub display_name: Option<String>,
    pub previous: ActivityState,
    pub state: ActivityState,
}

/// Continuation invoked on the scheduling activity once its scheduled set settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Continuation {
    /// Declarator variables resolved.
    VarsGot,
    /// Function arguments evaluated.
    ArgsResolved,
    /// A block step finished; `next` is the index of the following step.
    StepDone { next: usize },
    BranchesDone,
    Picked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleMode {
    /// Settles when every child is terminal. The first non-complete outcome wins.
    Join,
    /// Settles with the first terminal child; the rest are cancelled.
    Race,
}

/// Children an activity is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSchedule {
    pub continuation: Continuation,
    pub mode: ScheduleMode,
    pub children: Vec<ActivityId>,
    pub outcomes: Vec<Option<Outcome>>,
    pub first_failure: Option<usize>,
}

/// Idle method exposed by a suspended method activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub activity_id: ActivityId,
    pub method_name: String,
    pub instance_id_path: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct DeclaratorState {
    pub spec: Declarator,
    pub pending: Option<PendingDeclaration>,
}

#[derive(Clone)]
pub(crate) enum ArgSlot {
    Value(Value),
    Activity(ActivityId),
}

#[derive(Clone)]
pub(crate) enum NodeKind {
    Func { code: FuncCode, args: Vec<ArgSlot> },
    Block { steps: Vec<ActivityId> },
    Parallel { branches: Vec<ActivityId> },
    Pick { branches: Vec<ActivityId> },
    Method(MethodSpec),
}

/// Runtime copy of one activity definition.
pub(crate) struct ActivityNode {
    pub parent: Option<ActivityId>,
    pub children: Vec<ActivityId>,
    pub display_name: Option<String>,
    pub kind_name: &'static str,
    pub kind: NodeKind,
    pub scope: Scope,
    pub declarator: Option<DeclaratorState>,
    pub state: ActivityExecutionState,
}

impl ActivityNode {
    pub(crate) fn declarator_mut(&mut self) -> Result<&mut DeclaratorState> {
        let id = self.state.activity_id;
        self.declarator
            .as_mut()
            .ok_or_else(|| WorkflowError::InvalidArgument(format!("activity {id} is not a declarator")))
    }
}

enum Work {
    Run {
        activity: ActivityId,
        args: Vec<Value>,
    },
    Resume {
        activity: ActivityId,
        continuation: Continuation,
        outcome: Outcome,
    },
}

impl Work {
    fn activity(&self) -> ActivityId {
        match self {
            Work::Run { activity, .. } | Work::Resume { activity, .. } => *activity,
        }
    }
}

/// Scheduling handle of one running activity.
pub struct CallContext<'e> {
    engine: &'e mut WorkflowEngine,
    activity: ActivityId,
}

impl<'e> CallContext<'e> {
    pub fn activity_id(&self) -> ActivityId {
        self.activity
    }

    pub(crate) fn node(&self) -> &ActivityNode {
        self.engine.node(self.activity)
    }

    pub(crate) fn node_mut(&mut self) -> &mut ActivityNode {
        self.engine.node_mut(self.activity)
    }

    /// Run `children`; `continuation` fires once all of them are terminal.
    pub fn schedule(&mut self, children: Vec<ActivityId>, continuation: Continuation) -> Result<()> {
        self.engine
            .schedule(self.activity, children, continuation, ScheduleMode::Join)
    }

    /// Run `children`; `continuation` fires with the first one to settle.
    pub fn schedule_any(&mut self, children: Vec<ActivityId>, continuation: Continuation) -> Result<()> {
        self.engine
            .schedule(self.activity, children, continuation, ScheduleMode::Race)
    }

    /// Report this activity's terminal outcome to its parent.
    pub fn end(&mut self, outcome: Outcome) -> Result<()> {
        self.engine.end(self.activity, outcome)
    }
}

/// Serializable state of a stable engine. Topology is not included; it is rebuilt from the
/// activity definition on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub activities: Vec<ActivitySnapshot>,
    pub pending: Vec<(ActivityId, PendingSchedule)>,
    pub bookmarks: Vec<Bookmark>,
    pub root_outcome: Option<Outcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub id: ActivityId,
    /// `{ "execState": ... }`
    pub state: Value,
    pub vars: Vec<VarSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declaration: Option<PendingDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarSnapshot {
    pub name: String,
    pub value: VarValue,
    pub scoped: bool,
}

/// Drives one activity tree through its call contexts.
pub struct WorkflowEngine {
    instance_id: String,
    nodes: Vec<ActivityNode>,
    pending: BTreeMap<ActivityId, PendingSchedule>,
    queue: VecDeque<Work>,
    bookmarks: Vec<Bookmark>,
    trackers: Vec<Arc<dyn Tracker>>,
    initiating_call: Option<(String, Value)>,
    last_method_result: Option<Value>,
    root_outcome: Option<Outcome>,
}

const ROOT: ActivityId = ActivityId(0);

impl WorkflowEngine {
    pub fn new(root: &Activity) -> Self {
        Self::with_instance_id("", root)
    }

    pub(crate) fn with_instance_id(instance_id: impl Into<String>, root: &Activity) -> Self {
        let mut nodes = Vec::new();
        instantiate(&mut nodes, root, None);
        Self {
            instance_id: instance_id.into(),
            nodes,
            pending: BTreeMap::new(),
            queue: VecDeque::new(),
            bookmarks: Vec::new(),
            trackers: Vec::new(),
            initiating_call: None,
            last_method_result: None,
            root_outcome: None,
        }
    }

    /// Run the tree from the start with `args` for the root activity and return the root's
    /// outcome, or `None` if the tree suspended on idle methods.
    pub async fn invoke(&mut self, args: Vec<Value>) -> Result<Option<Outcome>> {
        self.start(args)?;
        self.run_until_stable().await?;
        Ok(self.root_outcome.clone())
    }

    pub fn add_tracker(&mut self, tracker: Arc<dyn Tracker>) {
        self.trackers.push(tracker);
    }

    pub fn root_id(&self) -> ActivityId {
        ROOT
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn state_of(&self, id: ActivityId) -> Option<&ActivityExecutionState> {
        self.nodes.get(id.0 as usize).map(|n| &n.state)
    }

    pub fn scope_of(&self, id: ActivityId) -> Option<&Scope> {
        self.nodes.get(id.0 as usize).map(|n| &n.scope)
    }

    pub fn bookmarks(&self) -> &[Bookmark] {
        &self.bookmarks
    }

    pub fn root_outcome(&self) -> Option<&Outcome> {
        self.root_outcome.as_ref()
    }

    /// Overall state: the root's terminal reason, `Idle` when suspended on idle methods,
    /// otherwise the root's own state.
    pub fn exec_state(&self) -> ActivityState {
        if let Some(outcome) = &self.root_outcome {
            return outcome.reason();
        }
        if self.queue.is_empty() && !self.bookmarks.is_empty() {
            return ActivityState::Idle;
        }
        self.node(ROOT).state.exec_state
    }

    pub(crate) fn set_instance_id(&mut self, instance_id: impl Into<String>) {
        self.instance_id = instance_id.into();
    }

    /// Offer the call that created the instance to the first method activity that matches it.
    pub(crate) fn offer_call(&mut self, method_name: impl Into<String>, args: Value) {
        self.initiating_call = Some((method_name.into(), args));
    }

    pub(crate) fn take_unconsumed_call(&mut self) -> Option<(String, Value)> {
        self.initiating_call.take()
    }

    pub(crate) fn take_method_result(&mut self) -> Option<Value> {
        self.last_method_result.take()
    }

    pub(crate) fn start(&mut self, args: Vec<Value>) -> Result<()> {
        if self.node(ROOT).state.exec_state != ActivityState::Idle || self.root_outcome.is_some() {
            return Err(WorkflowError::InvalidArgument(format!(
                "instance '{}' has already started",
                self.instance_id
            )));
        }
        self.queue.push_back(Work::Run { activity: ROOT, args });
        Ok(())
    }

    /// Drain the work queue. Returns once the tree is idle or terminal.
    pub(crate) async fn run_until_stable(&mut self) -> Result<()> {
        while let Some(work) = self.queue.pop_front() {
            self.step(work).await?;
        }
        if self.root_outcome.is_none() && self.bookmarks.is_empty() {
            warn!(instance = %self.instance_id, "activity tree stalled without idle methods");
        }
        Ok(())
    }

    /// Complete the first idle method named `method_name` with `args`. The caller drives the
    /// tree afterwards with `run_until_stable`.
    pub(crate) fn resume_bookmark(&mut self, method_name: &str, args: Value) -> Result<()> {
        let pos = self
            .bookmarks
            .iter()
            .position(|b| b.method_name == method_name)
            .ok_or_else(|| WorkflowError::NoIdleMethod {
                instance: self.instance_id.clone(),
                method: method_name.to_string(),
            })?;
        let bookmark = self.bookmarks.remove(pos);
        let id = bookmark.activity_id;
        let NodeKind::Method(spec) = self.node(id).kind.clone() else {
            return Err(WorkflowError::InvalidArgument(format!(
                "bookmark {id} does not point at a method activity"
            )));
        };
        debug!(instance = %self.instance_id, activity = %id, method = method_name, "resuming bookmark");
        self.set_state(id, ActivityState::Run)?;
        self.complete_method(id, &spec, args)
    }

    pub(crate) fn context(&mut self, activity: ActivityId) -> CallContext<'_> {
        CallContext { engine: self, activity }
    }

    fn node(&self, id: ActivityId) -> &ActivityNode {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: ActivityId) -> &mut ActivityNode {
        &mut self.nodes[id.0 as usize]
    }

    fn set_state(&mut self, id: ActivityId, to: ActivityState) -> Result<()> {
        let node = &mut self.nodes[id.0 as usize];
        let previous = node.state.transition(to)?;
        debug!(instance = %self.instance_id, activity = %id, kind = node.kind_name, from = %previous, to = %to, "activity state changed");
        if self.trackers.is_empty() {
            return Ok(());
        }
        let change = StateChange {
            instance_id: self.instance_id.clone(),
            activity_id: id,
            activity_kind: node.kind_name,
            display_name: node.display_name.clone(),
            previous,
            state: to,
        };
        for tracker in &self.trackers {
            tracker.activity_state_changed(&change);
        }
        Ok(())
    }

    fn schedule(
        &mut self,
        parent: ActivityId,
        children: Vec<ActivityId>,
        continuation: Continuation,
        mode: ScheduleMode,
    ) -> Result<()> {
        if self.pending.contains_key(&parent) {
            return Err(WorkflowError::InvalidArgument(format!(
                "activity {parent} already waits for scheduled children"
            )));
        }
        for child in &children {
            let valid = self.node(parent).children.contains(child)
                && self.node(*child).state.exec_state == ActivityState::Idle
                && !self.is_active(*child);
            if !valid {
                return Err(WorkflowError::InvalidArgument(format!(
                    "activity {parent} cannot schedule {child}"
                )));
            }
        }
        if children.is_empty() {
            let outcome = match mode {
                ScheduleMode::Join => Outcome::Complete(Value::Array(Vec::new())),
                ScheduleMode::Race => Outcome::Complete(Value::Null),
            };
            self.queue.push_back(Work::Resume {
                activity: parent,
                continuation,
                outcome,
            });
            return Ok(());
        }
        for child in &children {
            self.queue.push_back(Work::Run {
                activity: *child,
                args: Vec::new(),
            });
        }
        self.pending.insert(
            parent,
            PendingSchedule {
                continuation,
                mode,
                outcomes: vec![None; children.len()],
                children,
                first_failure: None,
            },
        );
        Ok(())
    }

    fn end(&mut self, id: ActivityId, outcome: Outcome) -> Result<()> {
        self.set_state(id, outcome.reason())?;
        match self.node(id).parent {
            None => {
                debug!(instance = %self.instance_id, reason = %outcome.reason(), "root activity finished");
                self.root_outcome = Some(outcome);
                Ok(())
            }
            Some(parent) => self.settle(parent, id, outcome),
        }
    }

    fn settle(&mut self, parent: ActivityId, child: ActivityId, outcome: Outcome) -> Result<()> {
        let Some(pending) = self.pending.get_mut(&parent) else {
            warn!(instance = %self.instance_id, activity = %child, "finished child has no waiting parent");
            return Ok(());
        };
        let Some(idx) = pending.children.iter().position(|c| *c == child) else {
            return Ok(());
        };
        if pending.outcomes[idx].is_some() {
            return Ok(());
        }

        match pending.mode {
            ScheduleMode::Race => {
                let continuation = pending.continuation;
                let others: Vec<ActivityId> = pending
                    .children
                    .iter()
                    .copied()
                    .filter(|c| *c != child)
                    .collect();
                self.pending.remove(&parent);
                for other in others {
                    self.cancel_subtree(other)?;
                }
                self.queue.push_back(Work::Resume {
                    activity: parent,
                    continuation,
                    outcome,
                });
            }
            ScheduleMode::Join => {
                let failed = !outcome.is_complete();
                pending.outcomes[idx] = Some(outcome);
                if failed && pending.first_failure.is_none() {
                    pending.first_failure = Some(idx);
                    let unsettled: Vec<(usize, ActivityId)> = pending
                        .children
                        .iter()
                        .copied()
                        .enumerate()
                        .filter(|(i, _)| pending.outcomes[*i].is_none())
                        .collect();
                    for (i, sibling) in unsettled {
                        self.cancel_subtree(sibling)?;
                        if let Some(p) = self.pending.get_mut(&parent) {
                            p.outcomes[i] = Some(Outcome::Cancel);
                        }
                    }
                }
                let settled = self
                    .pending
                    .get(&parent)
                    .is_some_and(|p| p.outcomes.iter().all(Option::is_some));
                if settled && let Some(done) = self.pending.remove(&parent) {
                    let aggregate = match done.first_failure {
                        Some(i) => done.outcomes[i].clone().unwrap_or(Outcome::Cancel),
                        None => Outcome::Complete(Value::Array(
                            done.outcomes
                                .into_iter()
                                .map(|o| match o {
                                    Some(Outcome::Complete(v)) => v,
                                    _ => Value::Null,
                                })
                                .collect(),
                        )),
                    };
                    self.queue.push_back(Work::Resume {
                        activity: parent,
                        continuation: done.continuation,
                        outcome: aggregate,
                    });
                }
            }
        }
        Ok(())
    }

    fn is_active(&self, id: ActivityId) -> bool {
        let state = self.node(id).state.exec_state;
        if state.is_terminal() {
            return false;
        }
        state == ActivityState::Run
            || self.bookmarks.iter().any(|b| b.activity_id == id)
            || self
                .queue
                .iter()
                .any(|w| matches!(w, Work::Run { activity, .. } if *activity == id))
    }

    /// Cancel `id` and every active descendant. Never-started activities are left alone.
    fn cancel_subtree(&mut self, id: ActivityId) -> Result<()> {
        let children = self.node(id).children.clone();
        for child in children {
            self.cancel_subtree(child)?;
        }
        if !self.is_active(id) {
            return Ok(());
        }
        self.pending.remove(&id);
        self.bookmarks.retain(|b| b.activity_id != id);
        self.queue.retain(|w| w.activity() != id);
        self.set_state(id, ActivityState::Cancel)
    }

    async fn step(&mut self, work: Work) -> Result<()> {
        match work {
            Work::Run { activity, args } => {
                self.set_state(activity, ActivityState::Run)?;
                let mut ctx = self.context(activity);
                match declarator::run(&mut ctx, args)? {
                    Declared::Ready(args) => self.vars_declared(activity, args).await,
                    Declared::Scheduled | Declared::Ended => Ok(()),
                }
            }
            Work::Resume {
                activity,
                continuation,
                outcome,
            } => self.resume(activity, continuation, outcome).await,
        }
    }

    /// Body of each activity variant, entered once its variables are declared.
    async fn vars_declared(&mut self, id: ActivityId, args: Vec<Value>) -> Result<()> {
        match self.node(id).kind.clone() {
            NodeKind::Func { args: slots, .. } => {
                let pending: Vec<ActivityId> = slots
                    .iter()
                    .filter_map(|s| match s {
                        ArgSlot::Activity(a) => Some(*a),
                        ArgSlot::Value(_) => None,
                    })
                    .collect();
                if !pending.is_empty() {
                    return self.schedule(id, pending, Continuation::ArgsResolved, ScheduleMode::Join);
                }
                let call_args = if slots.is_empty() {
                    args
                } else {
                    fill_args(&slots, Vec::new())
                };
                self.invoke_func(id, call_args).await
            }
            NodeKind::Block { steps } => match steps.first() {
                Some(first) => self.schedule(
                    id,
                    vec![*first],
                    Continuation::StepDone { next: 1 },
                    ScheduleMode::Join,
                ),
                None => self.end(id, Outcome::Complete(Value::Null)),
            },
            NodeKind::Parallel { branches } => {
                self.schedule(id, branches, Continuation::BranchesDone, ScheduleMode::Join)
            }
            NodeKind::Pick { branches } => self.schedule(id, branches, Continuation::Picked, ScheduleMode::Race),
            NodeKind::Method(spec) => {
                let matches_call = self
                    .initiating_call
                    .as_ref()
                    .is_some_and(|(name, _)| spec.can_create_instance && *name == spec.method_name);
                if matches_call && let Some((_, call_args)) = self.initiating_call.take() {
                    return self.complete_method(id, &spec, call_args);
                }
                self.set_state(id, ActivityState::Idle)?;
                debug!(instance = %self.instance_id, activity = %id, method = %spec.method_name, "method is idle");
                self.bookmarks.push(Bookmark {
                    activity_id: id,
                    method_name: spec.method_name,
                    instance_id_path: spec.instance_id_path,
                });
                Ok(())
            }
        }
    }

    async fn resume(&mut self, id: ActivityId, continuation: Continuation, outcome: Outcome) -> Result<()> {
        match continuation {
            Continuation::VarsGot => {
                let mut ctx = self.context(id);
                match declarator::vars_got(&mut ctx, outcome)? {
                    Declared::Ready(args) => self.vars_declared(id, args).await,
                    Declared::Scheduled | Declared::Ended => Ok(()),
                }
            }
            Continuation::ArgsResolved => match outcome {
                Outcome::Complete(Value::Array(results)) => {
                    let NodeKind::Func { args: slots, .. } = &self.node(id).kind else {
                        return Err(WorkflowError::InvalidArgument(format!(
                            "activity {id} is not a function"
                        )));
                    };
                    let call_args = fill_args(slots, results);
                    self.invoke_func(id, call_args).await
                }
                other => self.end(id, other),
            },
            Continuation::StepDone { next } => match outcome {
                Outcome::Complete(Value::Array(mut results)) => {
                    let last = results.pop().unwrap_or(Value::Null);
                    let step = match &self.node(id).kind {
                        NodeKind::Block { steps } => steps.get(next).copied(),
                        _ => None,
                    };
                    match step {
                        Some(step) => self.schedule(
                            id,
                            vec![step],
                            Continuation::StepDone { next: next + 1 },
                            ScheduleMode::Join,
                        ),
                        None => self.end(id, Outcome::Complete(last)),
                    }
                }
                other => self.end(id, other),
            },
            Continuation::BranchesDone | Continuation::Picked => self.end(id, outcome),
        }
    }

    async fn invoke_func(&mut self, id: ActivityId, args: Vec<Value>) -> Result<()> {
        let NodeKind::Func { code, .. } = &self.node(id).kind else {
            return Err(WorkflowError::InvalidArgument(format!("activity {id} is not a function")));
        };
        let result = match code.clone() {
            FuncCode::Sync(body) => {
                let mut scope = ScopeAccess::new(&mut self.nodes, id);
                body(&mut scope, &args)
            }
            FuncCode::Async(body) => {
                let fut = {
                    let mut scope = ScopeAccess::new(&mut self.nodes, id);
                    body(&mut scope, &args)
                };
                fut.await
            }
        };
        let outcome = match result {
            Ok(v) => Outcome::Complete(v),
            Err(e) => Outcome::from(e),
        };
        self.end(id, outcome)
    }

    fn complete_method(&mut self, id: ActivityId, spec: &MethodSpec, args: Value) -> Result<()> {
        if let Some(var) = &spec.result_var {
            ScopeAccess::new(&mut self.nodes, id).set(var, args.clone());
        }
        self.last_method_result = Some(args.clone());
        self.end(id, Outcome::Complete(args))
    }

    /// Values of promoted variables, keyed by variable name.
    pub fn promoted_values(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for node in &self.nodes {
            let Some(decl) = &node.declarator else { continue };
            for name in decl.spec.promoted_properties() {
                if let Some(VarValue::Value(v)) = node.scope.get(name) {
                    out.insert(name.to_string(), v.clone());
                }
            }
        }
        out
    }

    pub fn snapshot(&self) -> Result<EngineSnapshot> {
        if !self.queue.is_empty() {
            return Err(WorkflowError::InvalidArgument(format!(
                "instance '{}' has queued work and cannot be captured",
                self.instance_id
            )));
        }
        let activities = self
            .nodes
            .iter()
            .map(|n| ActivitySnapshot {
                id: n.state.activity_id,
                state: n.state.as_json(),
                vars: n
                    .scope
                    .entries()
                    .map(|e| VarSnapshot {
                        name: e.name.clone(),
                        value: e.value.clone(),
                        scoped: e.scoped,
                    })
                    .collect(),
                declaration: n.declarator.as_ref().and_then(|d| d.pending.clone()),
            })
            .collect();
        Ok(EngineSnapshot {
            activities,
            pending: self
                .pending
                .iter()
                .map(|(id, p)| (*id, p.clone()))
                .collect(),
            bookmarks: self.bookmarks.clone(),
            root_outcome: self.root_outcome.clone(),
        })
    }

    /// Rebuild the tree from `root` and overlay `snapshot` onto it.
    pub fn restore(instance_id: impl Into<String>, root: &Activity, snapshot: &EngineSnapshot) -> Result<Self> {
        let mut engine = Self::with_instance_id(instance_id, root);
        if snapshot.activities.len() != engine.nodes.len() {
            return Err(WorkflowError::MalformedDefinition(format!(
                "snapshot has {} activities but the definition has {}",
                snapshot.activities.len(),
                engine.nodes.len()
            )));
        }
        for saved in &snapshot.activities {
            let node = engine
                .nodes
                .get_mut(saved.id.0 as usize)
                .ok_or_else(|| WorkflowError::MalformedDefinition(format!("unknown activity {}", saved.id)))?;
            node.state.from_json(&saved.state)?;
            for var in &saved.vars {
                node.scope.declare(var.name.clone(), var.value.clone(), var.scoped);
            }
            if let Some(decl) = &saved.declaration {
                node.declarator_mut()?.pending = Some(decl.clone());
            }
        }
        engine.check_references(snapshot)?;
        engine.pending = snapshot.pending.iter().cloned().collect();
        engine.bookmarks = snapshot.bookmarks.clone();
        engine.root_outcome = snapshot.root_outcome.clone();
        Ok(engine)
    }

    /// Reject snapshot entries that point outside the rebuilt tree.
    fn check_references(&self, snapshot: &EngineSnapshot) -> Result<()> {
        for b in &snapshot.bookmarks {
            let valid = matches!(
                self.nodes.get(b.activity_id.0 as usize).map(|n| &n.kind),
                Some(NodeKind::Method(spec)) if spec.method_name == b.method_name
            );
            if !valid {
                return Err(WorkflowError::MalformedDefinition(format!(
                    "bookmark '{}' points at unknown activity {}",
                    b.method_name, b.activity_id
                )));
            }
        }
        for (parent, p) in &snapshot.pending {
            let Some(node) = self.nodes.get(parent.0 as usize) else {
                return Err(WorkflowError::MalformedDefinition(format!(
                    "pending schedule of unknown activity {parent}"
                )));
            };
            if let Some(child) = p.children.iter().find(|c| !node.children.contains(c)) {
                return Err(WorkflowError::MalformedDefinition(format!(
                    "activity {parent} waits for {child}, which is not its child"
                )));
            }
            if p.outcomes.len() != p.children.len() || p.first_failure.is_some_and(|i| i >= p.outcomes.len()) {
                return Err(WorkflowError::MalformedDefinition(format!(
                    "pending schedule of activity {parent} is inconsistent"
                )));
            }
        }
        Ok(())
    }
}

fn fill_args(slots: &[ArgSlot], results: Vec<Value>) -> Vec<Value> {
    let mut results = results.into_iter();
    slots
        .iter()
        .map(|slot| match slot {
            ArgSlot::Value(v) => v.clone(),
            ArgSlot::Activity(_) => results.next().unwrap_or(Value::Null),
        })
        .collect()
}

/// Copy `def` into the arena in pre-order and return its id.
fn instantiate(nodes: &mut Vec<ActivityNode>, def: &Activity, parent: Option<ActivityId>) -> ActivityId {
    let id = ActivityId(nodes.len() as u32);
    let mut state = ActivityExecutionState::new(id);
    state.parent_activity_id = parent;
    nodes.push(ActivityNode {
        parent,
        children: Vec::new(),
        display_name: def.display_name.clone(),
        kind_name: def.kind.name(),
        kind: NodeKind::Block { steps: Vec::new() },
        scope: Scope::default(),
        declarator: def.declarator.clone().map(|spec| DeclaratorState { spec, pending: None }),
        state,
    });

    let mut children = Vec::new();
    let mut scope = Scope::default();
    for var in &def.vars {
        let value = match &var.init {
            Variable::Value(v) => VarValue::Value(v.clone()),
            Variable::Activity(a) => {
                let child = instantiate(nodes, a, Some(id));
                children.push(child);
                VarValue::Activity(child)
            }
        };
        scope.declare(var.name.clone(), value, var.scoped);
    }

    let kind = match &def.kind {
        ActivityKind::Func { code, args } => {
            let mut slots = Vec::with_capacity(args.len());
            for arg in args {
                slots.push(match arg {
                    Variable::Value(v) => ArgSlot::Value(v.clone()),
                    Variable::Activity(a) => {
                        let child = instantiate(nodes, a, Some(id));
                        children.push(child);
                        ArgSlot::Activity(child)
                    }
                });
            }
            NodeKind::Func {
                code: code.clone(),
                args: slots,
            }
        }
        ActivityKind::Block { steps } => NodeKind::Block {
            steps: adopt(nodes, steps, id, &mut children),
        },
        ActivityKind::Parallel { branches } => NodeKind::Parallel {
            branches: adopt(nodes, branches, id, &mut children),
        },
        ActivityKind::Pick { branches } => NodeKind::Pick {
            branches: adopt(nodes, branches, id, &mut children),
        },
        ActivityKind::Method(spec) => NodeKind::Method(spec.clone()),
    };

    let node = &mut nodes[id.0 as usize];
    node.kind = kind;
    node.scope = scope;
    node.state.child_activity_ids = children.iter().copied().collect();
    node.children = children;
    id
}

fn adopt(
    nodes: &mut Vec<ActivityNode>,
    list: &[Activity],
    parent: ActivityId,
    children: &mut Vec<ActivityId>,
) -> Vec<ActivityId> {
    list.iter()
        .map(|a| {
            let child = instantiate(nodes, a, Some(parent));
            children.push(child);
            child
        })
        .collect()
}
