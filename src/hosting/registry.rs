use crate::activities::Activity;
use crate::error::{Result, WorkflowError};
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// A named, versioned workflow: the root activity template every instance is copied from.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: Version,
    pub root: Activity,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: impl AsRef<str>, root: Activity) -> Result<Self> {
        let version = Version::parse(version.as_ref().trim()).map_err(|e| {
            WorkflowError::MalformedDefinition(format!("version '{}' is not valid semver: {e}", version.as_ref()))
        })?;
        Ok(Self {
            name: name.into(),
            version,
            root,
        })
    }
}

/// Registered form of a definition.
#[derive(Debug, Clone)]
pub struct WorkflowDescriptor {
    pub name: String,
    pub version: Version,
    pub root: Arc<Activity>,
    /// Methods allowed to originate a new instance.
    pub create_instance_methods: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    inner: HashMap<String, BTreeMap<Version, Arc<WorkflowDescriptor>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<Arc<WorkflowDescriptor>> {
        let name = definition.name.trim().to_string();
        if name.is_empty() {
            return Err(WorkflowError::MalformedDefinition("workflow name is empty".to_string()));
        }
        let create_instance_methods: BTreeSet<String> = definition
            .root
            .methods()
            .into_iter()
            .filter(|m| m.can_create_instance)
            .map(|m| m.method_name.clone())
            .collect();
        if create_instance_methods.is_empty() {
            return Err(WorkflowError::MalformedDefinition(format!(
                "workflow '{name}' has no method that can create an instance"
            )));
        }

        let versions = self.inner.entry(name.clone()).or_default();
        if versions.contains_key(&definition.version) {
            return Err(WorkflowError::DuplicateWorkflow {
                name,
                version: definition.version.to_string(),
            });
        }
        debug!(workflow = %name, version = %definition.version, methods = ?create_instance_methods, "workflow registered");
        let desc = Arc::new(WorkflowDescriptor {
            name,
            version: definition.version.clone(),
            root: Arc::new(definition.root),
            create_instance_methods,
        });
        versions.insert(definition.version, desc.clone());
        Ok(desc)
    }

    /// Latest registered version of `name`.
    pub fn get_desc(&self, name: &str) -> Option<Arc<WorkflowDescriptor>> {
        self.inner.get(name)?.iter().next_back().map(|(_v, d)| d.clone())
    }

    pub fn get_version(&self, name: &str, version: &Version) -> Option<Arc<WorkflowDescriptor>> {
        self.inner.get(name)?.get(version).cloned()
    }

    pub fn list_workflow_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn list_workflow_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn greeter() -> Activity {
        Activity::block(vec![
            Activity::method("sayHi").can_create_instance(),
            Activity::method("sayBye"),
        ])
    }

    #[test]
    fn collects_creation_methods_and_resolves_latest() {
        let mut reg = WorkflowRegistry::new();
        reg.register(WorkflowDefinition::new("Greeter", "1.0.0", greeter()).unwrap())
            .unwrap();
        reg.register(WorkflowDefinition::new("Greeter", "1.2.0", greeter()).unwrap())
            .unwrap();

        let desc = reg.get_desc("Greeter").unwrap();
        assert_eq!(desc.version, Version::new(1, 2, 0));
        assert!(desc.create_instance_methods.contains("sayHi"));
        assert!(!desc.create_instance_methods.contains("sayBye"));
        assert!(reg.get_version("Greeter", &Version::new(1, 0, 0)).is_some());
        assert_eq!(reg.list_workflow_versions("Greeter").len(), 2);
    }

    #[test]
    fn rejects_duplicates_and_malformed_definitions() {
        let mut reg = WorkflowRegistry::new();
        reg.register(WorkflowDefinition::new("Greeter", "1.0.0", greeter()).unwrap())
            .unwrap();
        let err = reg
            .register(WorkflowDefinition::new("Greeter", "1.0.0", greeter()).unwrap())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateWorkflow { .. }));

        let no_creator = Activity::block(vec![Activity::func(|_, _| Ok(Value::Null))]);
        let err = reg
            .register(WorkflowDefinition::new("Silent", "1.0.0", no_creator).unwrap())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::MalformedDefinition(_)));

        assert!(WorkflowDefinition::new("Bad", "one", greeter()).is_err());
        let err = reg
            .register(WorkflowDefinition::new("  ", "1.0.0", greeter()).unwrap())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::MalformedDefinition(_)));
    }
}
