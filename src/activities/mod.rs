//! Activity definitions and the execution engine that drives them.
//!
//! An [`Activity`] is a definition: a tagged variant plus its declared variables. Instances
//! copy definitions into an arena of runtime nodes (see [`engine`]) where each node carries an
//! identity, a parent back-reference, its children and an [`ActivityExecutionState`].
use crate::error::Result;
use crate::{ActivityError, Value};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

pub mod declarator;
pub mod engine;
pub mod scope;
pub mod state;

pub use declarator::{Declarator, PendingDeclaration};
pub use engine::{
    ActivitySnapshot, Bookmark, CallContext, Continuation, EngineSnapshot, PendingSchedule, ScheduleMode,
    StateChange, Tracker, VarSnapshot, WorkflowEngine,
};
pub use scope::{Scope, ScopeAccess, ScopeEntry, VarValue};
pub use state::{ActivityExecutionState, ActivityId, ActivityState};

/// Synchronous leaf body: reads/writes the scope chain, receives the resolved arguments.
pub type FuncBody = Arc<dyn Fn(&mut ScopeAccess<'_>, &[Value]) -> Result<Value, ActivityError> + Send + Sync>;

/// Asynchronous leaf body. Scope access is only available while building the future.
pub type AsyncFuncBody =
    Arc<dyn Fn(&mut ScopeAccess<'_>, &[Value]) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync>;

#[derive(Clone)]
pub enum FuncCode {
    Sync(FuncBody),
    Async(AsyncFuncBody),
}

/// Initial content of a variable or argument: a plain value or an activity to evaluate.
#[derive(Clone, Debug)]
pub enum Variable {
    Value(Value),
    Activity(Box<Activity>),
}

impl From<Value> for Variable {
    fn from(v: Value) -> Self {
        Variable::Value(v)
    }
}

impl From<Activity> for Variable {
    fn from(a: Activity) -> Self {
        Variable::Activity(Box::new(a))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct VarDecl {
    pub name: String,
    pub init: Variable,
    pub scoped: bool,
}

/// External entry point of a workflow. Running it either consumes the call that created the
/// instance or suspends the activity as an idle method until the host routes a call to it.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodSpec {
    pub method_name: String,
    /// Path into the call arguments that yields the instance id.
    pub instance_id_path: Option<String>,
    pub can_create_instance: bool,
    /// Scope variable that receives the call arguments.
    pub result_var: Option<String>,
}

#[derive(Clone)]
pub(crate) enum ActivityKind {
    Func { code: FuncCode, args: Vec<Variable> },
    Block { steps: Vec<Activity> },
    Parallel { branches: Vec<Activity> },
    Pick { branches: Vec<Activity> },
    Method(MethodSpec),
}

impl ActivityKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ActivityKind::Func { .. } => "func",
            ActivityKind::Block { .. } => "block",
            ActivityKind::Parallel { .. } => "parallel",
            ActivityKind::Pick { .. } => "pick",
            ActivityKind::Method(_) => "method",
        }
    }
}

/// Definition of a schedulable unit of workflow logic.
#[derive(Clone)]
pub struct Activity {
    pub(crate) kind: ActivityKind,
    pub(crate) display_name: Option<String>,
    pub(crate) vars: Vec<VarDecl>,
    pub(crate) declarator: Option<Declarator>,
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("kind", &self.kind.name())
            .field("display_name", &self.display_name)
            .field("vars", &self.vars)
            .field("declarator", &self.declarator)
            .finish()
    }
}

impl Activity {
    fn with_kind(kind: ActivityKind, declarator: Option<Declarator>) -> Self {
        Self {
            kind,
            display_name: None,
            vars: Vec::new(),
            declarator,
        }
    }

    /// Leaf activity running a synchronous body.
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&mut ScopeAccess<'_>, &[Value]) -> Result<Value, ActivityError> + Send + Sync + 'static,
    {
        Self::with_kind(
            ActivityKind::Func {
                code: FuncCode::Sync(Arc::new(f)),
                args: Vec::new(),
            },
            None,
        )
    }

    /// Leaf activity whose body completes asynchronously.
    pub fn func_async<F>(f: F) -> Self
    where
        F: Fn(&mut ScopeAccess<'_>, &[Value]) -> BoxFuture<'static, Result<Value, ActivityError>>
            + Send
            + Sync
            + 'static,
    {
        Self::with_kind(
            ActivityKind::Func {
                code: FuncCode::Async(Arc::new(f)),
                args: Vec::new(),
            },
            None,
        )
    }

    /// Runs `steps` one after another; the result is the last step's result.
    pub fn block(steps: Vec<Activity>) -> Self {
        Self::with_kind(ActivityKind::Block { steps }, Some(Declarator::default()))
    }

    /// Runs all `branches`; the result is an array aligned with the branch order.
    pub fn parallel(branches: Vec<Activity>) -> Self {
        Self::with_kind(ActivityKind::Parallel { branches }, Some(Declarator::default()))
    }

    /// Runs all `branches` until the first one settles; the others are cancelled.
    pub fn pick(branches: Vec<Activity>) -> Self {
        Self::with_kind(ActivityKind::Pick { branches }, Some(Declarator::default()))
    }

    pub fn method(method_name: impl Into<String>) -> Self {
        Self::with_kind(
            ActivityKind::Method(MethodSpec {
                method_name: method_name.into(),
                instance_id_path: None,
                can_create_instance: false,
                result_var: None,
            }),
            None,
        )
    }

    /// Allow this method to originate a new instance.
    pub fn can_create_instance(mut self) -> Self {
        if let ActivityKind::Method(spec) = &mut self.kind {
            spec.can_create_instance = true;
        }
        self
    }

    pub fn instance_id_path(mut self, path: impl Into<String>) -> Self {
        if let ActivityKind::Method(spec) = &mut self.kind {
            spec.instance_id_path = Some(path.into());
        }
        self
    }

    /// Store the call arguments of this method into the scope variable `var`.
    pub fn result_to(mut self, var: impl Into<String>) -> Self {
        if let ActivityKind::Method(spec) = &mut self.kind {
            spec.result_var = Some(var.into());
        }
        self
    }

    pub fn named(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Add an argument to a function activity. Activity arguments are evaluated first.
    pub fn arg(mut self, value: impl Into<Variable>) -> Self {
        if let ActivityKind::Func { args, .. } = &mut self.kind {
            args.push(value.into());
        }
        self
    }

    /// Declare a scoped variable. An activity-valued variable opts this activity into
    /// declarator resolution.
    pub fn var(self, name: impl Into<String>, value: impl Into<Variable>) -> Self {
        self.declare(name.into(), value.into(), true)
    }

    /// Declare a variable that is visible only to this activity and never resolved.
    pub fn non_scoped_var(self, name: impl Into<String>, value: impl Into<Variable>) -> Self {
        self.declare(name.into(), value.into(), false)
    }

    fn declare(mut self, name: String, init: Variable, scoped: bool) -> Self {
        if scoped && matches!(init, Variable::Activity(_)) && self.declarator.is_none() {
            self.declarator = Some(Declarator::default());
        }
        match self.vars.iter_mut().find(|v| v.name == name) {
            Some(existing) => {
                existing.init = init;
                existing.scoped = scoped;
            }
            None => self.vars.push(VarDecl { name, init, scoped }),
        }
        self
    }

    /// Mark `name` as reserved: its value is never replaced by resolution.
    pub fn reserved(mut self, name: impl Into<String>, value: Option<Variable>) -> Result<Self> {
        let name = name.into();
        self.declarator.get_or_insert_with(Declarator::default).reserve(&name)?;
        Ok(match value {
            Some(v) => self.declare(name, v, true),
            None => self,
        })
    }

    /// Mark `name` as promoted: its value is exported with the instance snapshot.
    pub fn promoted(mut self, name: impl Into<String>, value: Option<Variable>) -> Result<Self> {
        let name = name.into();
        self.declarator.get_or_insert_with(Declarator::default).promote(&name)?;
        Ok(match value {
            Some(v) => self.declare(name, v, true),
            None => self,
        })
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn declarator(&self) -> Option<&Declarator> {
        self.declarator.as_ref()
    }

    pub fn as_method(&self) -> Option<&MethodSpec> {
        match &self.kind {
            ActivityKind::Method(spec) => Some(spec),
            _ => None,
        }
    }

    /// Every method activity reachable from this definition, in pre-order.
    pub fn methods(&self) -> Vec<&MethodSpec> {
        let mut out = Vec::new();
        self.collect_methods(&mut out);
        out
    }

    fn collect_methods<'a>(&'a self, out: &mut Vec<&'a MethodSpec>) {
        for v in &self.vars {
            if let Variable::Activity(a) = &v.init {
                a.collect_methods(out);
            }
        }
        match &self.kind {
            ActivityKind::Method(spec) => out.push(spec),
            ActivityKind::Func { args, .. } => {
                for arg in args {
                    if let Variable::Activity(a) = arg {
                        a.collect_methods(out);
                    }
                }
            }
            ActivityKind::Block { steps: children }
            | ActivityKind::Parallel { branches: children }
            | ActivityKind::Pick { branches: children } => {
                for c in children {
                    c.collect_methods(out);
                }
            }
        }
    }
}
