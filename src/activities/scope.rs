use super::ActivityId;
use super::engine::ActivityNode;
use crate::Value;
use serde::{Deserialize, Serialize};

/// Current value of a declared variable. An activity-valued variable is resolved to a plain
/// value by the declarator before the owning activity's body runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VarValue {
    Value(Value),
    Activity(ActivityId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeEntry {
    pub name: String,
    pub value: VarValue,
    /// Non-scoped entries are private to their activity: descendants cannot see them and the
    /// declarator never resolves them.
    pub scoped: bool,
}

/// Ordered map of the variables declared on one activity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    entries: Vec<ScopeEntry>,
}

impl Scope {
    /// Declare `name`, or overwrite it in place if it already exists (keeping its position).
    pub fn declare(&mut self, name: impl Into<String>, value: VarValue, scoped: bool) {
        let name = name.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.value = value;
                entry.scoped = scoped;
            }
            None => self.entries.push(ScopeEntry { name, value, scoped }),
        }
    }

    pub fn entry(&self, name: &str) -> Option<&ScopeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.entry(name).map(|e| &e.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Replace the value of an existing variable. Returns false when `name` is not declared.
    pub fn assign(&mut self, name: &str, value: VarValue) -> bool {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<VarValue> {
        let idx = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(idx).value)
    }

    /// Names of scoped variables in declaration order.
    pub fn scope_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter(|e| e.scoped).map(|e| e.name.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScopeEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Variable access handed to function bodies.
///
/// Lookup walks from the running activity towards the root. The activity's own variables are
/// all visible; an ancestor contributes only its scoped variables. Assignment writes to the
/// nearest activity that declares the name, or declares a new scoped variable locally.
pub struct ScopeAccess<'a> {
    nodes: &'a mut [ActivityNode],
    current: ActivityId,
}

impl<'a> ScopeAccess<'a> {
    pub(crate) fn new(nodes: &'a mut [ActivityNode], current: ActivityId) -> Self {
        Self { nodes, current }
    }

    pub fn activity_id(&self) -> ActivityId {
        self.current
    }

    fn owner_of(&self, name: &str) -> Option<ActivityId> {
        let mut cursor = Some(self.current);
        while let Some(id) = cursor {
            let node = &self.nodes[id.0 as usize];
            if let Some(entry) = node.scope.entry(name)
                && (id == self.current || entry.scoped)
            {
                return Some(id);
            }
            cursor = node.parent;
        }
        None
    }

    /// Resolved value of `name`; `None` when undeclared or still bound to an activity.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let owner = self.owner_of(name)?;
        match self.nodes[owner.0 as usize].scope.get(name)? {
            VarValue::Value(v) => Some(v),
            VarValue::Activity(_) => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = VarValue::Value(value.into());
        match self.owner_of(name) {
            Some(owner) => {
                self.nodes[owner.0 as usize].scope.assign(name, value);
            }
            None => self.nodes[self.current.0 as usize]
                .scope
                .declare(name, value, true),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.owner_of(name).is_some()
    }
}
