#![allow(dead_code)]
use rust_wf::activities::{Activity, StateChange, Tracker};
use rust_wf::{ActivityState, Value, WorkflowDefinition};
use serde_json::json;
use std::sync::Mutex;

/// Tracker that keeps every notification for later assertions.
#[derive(Default)]
pub struct RecordingTracker {
    changes: Mutex<Vec<StateChange>>,
}

impl RecordingTracker {
    pub fn changes(&self) -> Vec<StateChange> {
        self.changes.lock().unwrap().clone()
    }

    /// Activities that reached `state`, in notification order.
    pub fn reached(&self, state: ActivityState) -> Vec<u32> {
        self.changes()
            .into_iter()
            .filter(|c| c.state == state)
            .map(|c| c.activity_id.0)
            .collect()
    }
}

impl Tracker for RecordingTracker {
    fn activity_state_changed(&self, change: &StateChange) {
        self.changes.lock().unwrap().push(change.clone());
    }
}

pub fn constant(value: Value) -> Activity {
    Activity::func(move |_, _| Ok(value.clone()))
}

/// `sayHi` creates the instance and the workflow returns `args.name`.
pub fn greeter() -> WorkflowDefinition {
    let root = Activity::block(vec![
        Activity::method("sayHi").can_create_instance().result_to("args"),
        Activity::func(|s, _| Ok(s.get("args").and_then(|a| a.get("name")).cloned().unwrap_or(Value::Null))),
    ])
    .var("args", Value::Null);
    WorkflowDefinition::new("Greeter", "1.0.0", root).unwrap()
}

/// `submit` creates an instance keyed by `id`, `approve` finishes it.
pub fn approval() -> WorkflowDefinition {
    let root = Activity::block(vec![
        Activity::method("submit")
            .can_create_instance()
            .instance_id_path("id")
            .result_to("request"),
        Activity::method("approve").instance_id_path("id").result_to("decision"),
        Activity::func(|s, _| {
            let amount = s.get("request").and_then(|r| r.get("amount")).cloned();
            let approved = s.get("decision").and_then(|d| d.get("ok")).cloned();
            Ok(json!({ "amount": amount, "approved": approved }))
        }),
    ])
    .var("request", Value::Null)
    .var("decision", Value::Null)
    .promoted("status", Some(json!("pending").into()))
    .unwrap();
    WorkflowDefinition::new("Approval", "1.0.0", root).unwrap()
}
