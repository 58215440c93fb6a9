//! Scoped-variable resolution for composite activities.
//!
//! Before a declarator-capable activity runs its body, every scoped, non-reserved variable
//! whose value is an activity is scheduled; when all of them complete, each result is written
//! back into the variable it came from and the body runs with the original arguments.
use super::engine::{CallContext, Continuation};
use super::scope::VarValue;
use super::ActivityId;
use crate::error::{Result, WorkflowError};
use crate::{Outcome, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Declaration metadata of a declarator-capable activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Declarator {
    reserved: BTreeSet<String>,
    promoted: BTreeSet<String>,
}

impl Declarator {
    pub fn reserve(&mut self, name: &str) -> Result<()> {
        if self.promoted.contains(name) {
            return Err(WorkflowError::DeclarationConflict {
                name: name.to_string(),
                attempted: "reserved",
                existing: "promoted",
            });
        }
        self.reserved.insert(name.to_string());
        Ok(())
    }

    pub fn promote(&mut self, name: &str) -> Result<()> {
        if self.reserved.contains(name) {
            return Err(WorkflowError::DeclarationConflict {
                name: name.to_string(),
                attempted: "promoted",
                existing: "reserved",
            });
        }
        self.promoted.insert(name.to_string());
        Ok(())
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(name)
    }

    pub fn is_promoted(&self, name: &str) -> bool {
        self.promoted.contains(name)
    }

    pub fn reserved_properties(&self) -> impl Iterator<Item = &str> {
        self.reserved.iter().map(String::as_str)
    }

    pub fn promoted_properties(&self) -> impl Iterator<Item = &str> {
        self.promoted.iter().map(String::as_str)
    }
}

/// Bookkeeping kept between scheduling the variables and receiving their results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDeclaration {
    pub field_names: Vec<String>,
    pub saved_args: Vec<Value>,
}

/// Result of a declarator step.
pub(crate) enum Declared {
    /// Variables were scheduled; the activity waits for `Continuation::VarsGot`.
    Scheduled,
    /// All variables hold values; run the body with these arguments.
    Ready(Vec<Value>),
    /// A variable did not complete; its outcome was forwarded to the parent.
    Ended,
}

pub(crate) fn run(ctx: &mut CallContext<'_>, args: Vec<Value>) -> Result<Declared> {
    let node = ctx.node();
    let Some(state) = node.declarator.as_ref() else {
        return Ok(Declared::Ready(args));
    };
    let mut field_names = Vec::new();
    let mut variables: Vec<ActivityId> = Vec::new();
    for entry in node.scope.entries() {
        if !entry.scoped || state.spec.is_reserved(&entry.name) {
            continue;
        }
        if let VarValue::Activity(id) = entry.value {
            field_names.push(entry.name.clone());
            variables.push(id);
        }
    }

    if variables.is_empty() {
        return Ok(Declared::Ready(args));
    }

    ctx.node_mut().declarator_mut()?.pending = Some(PendingDeclaration {
        field_names,
        saved_args: args,
    });
    ctx.schedule(variables, Continuation::VarsGot)?;
    Ok(Declared::Scheduled)
}

pub(crate) fn vars_got(ctx: &mut CallContext<'_>, outcome: Outcome) -> Result<Declared> {
    let pending = ctx.node_mut().declarator_mut()?.pending.take();
    match outcome {
        Outcome::Complete(Value::Array(results)) => {
            let pending = pending.ok_or_else(|| {
                WorkflowError::InvalidArgument(format!(
                    "activity {} resumed without pending declarations",
                    ctx.activity_id()
                ))
            })?;
            let scope = &mut ctx.node_mut().scope;
            for (name, value) in pending.field_names.iter().zip(results) {
                scope.assign(name, VarValue::Value(value));
            }
            Ok(Declared::Ready(pending.saved_args))
        }
        Outcome::Complete(other) => Err(WorkflowError::InvalidArgument(format!(
            "activity {} received {other} instead of variable results",
            ctx.activity_id()
        ))),
        failed => {
            ctx.end(failed)?;
            Ok(Declared::Ended)
        }
    }
}
