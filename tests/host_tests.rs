//! Host dispatch: creation gate, bookmark resumption, creation locking and persistence.
use futures::FutureExt;
use rust_wf::activities::Activity;
use rust_wf::logging::ConsoleTracker;
use rust_wf::hosting::{
    FsPersistence, HostOptions, InMemoryPersistence, InstanceSnapshot, LockInfo, RunningInstanceIdPath,
    WorkflowPersistence, WorkflowRegistry,
};
use rust_wf::{ActivityError, ActivityFault, ActivityState, PersistenceError, Value, WorkflowDefinition, WorkflowError, WorkflowHost, WorkflowInstance};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
mod common;
use common::{RecordingTracker, approval, greeter};

/// In-memory store whose state writes are acknowledged late while `slow` is set.
struct SlowAck {
    inner: InMemoryPersistence,
    slow: AtomicBool,
}

#[async_trait::async_trait]
impl WorkflowPersistence for SlowAck {
    async fn enter_lock(
        &self,
        name: &str,
        enter_timeout: Duration,
        hold_timeout: Duration,
    ) -> Result<Option<LockInfo>, PersistenceError> {
        self.inner.enter_lock(name, enter_timeout, hold_timeout).await
    }

    async fn exit_lock(&self, lock: &LockInfo) -> Result<(), PersistenceError> {
        self.inner.exit_lock(lock).await
    }

    async fn persist_state(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError> {
        self.inner.persist_state(snapshot).await?;
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(())
    }

    async fn load_state(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>, PersistenceError> {
        self.inner.load_state(instance_id).await
    }

    async fn remove_state(&self, instance_id: &str) -> Result<(), PersistenceError> {
        self.inner.remove_state(instance_id).await
    }

    async fn get_running_instance_id_paths(
        &self,
        workflow_name: &str,
        method_name: &str,
    ) -> Result<Vec<RunningInstanceIdPath>, PersistenceError> {
        self.inner.get_running_instance_id_paths(workflow_name, method_name).await
    }
}

async fn host_with(defs: Vec<WorkflowDefinition>) -> WorkflowHost {
    let host = WorkflowHost::new();
    for def in defs {
        host.register_workflow(def).await.unwrap();
    }
    host
}

#[tokio::test]
async fn greeter_returns_the_name() {
    let host = host_with(vec![greeter()]).await;
    host.add_tracker(Arc::new(ConsoleTracker)).await;
    let out = host
        .invoke_method("Greeter", "sayHi", json!({ "name": "Gabor" }))
        .await
        .unwrap();
    assert_eq!(out, json!("Gabor"));
    // finished instances are not kept
    assert!(host.running_instance_ids().await.is_empty());
}

#[tokio::test]
async fn non_creating_method_is_rejected() {
    let root = Activity::block(vec![
        Activity::method("sayHi").can_create_instance(),
        Activity::method("sayBye"),
    ]);
    let host = host_with(vec![WorkflowDefinition::new("Greeter", "1.0.0", root).unwrap()]).await;

    let err = host
        .invoke_method("Greeter", "sayBye", json!({ "name": "Gabor" }))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "workflow 'Greeter' cannot be created by invoking method 'sayBye'"
    );
    assert!(host.running_instance_ids().await.is_empty());

    // sayHi leaves the instance idle on sayBye, echoing the accepted arguments
    let out = host.invoke_method(" Greeter ", "sayHi ", json!({ "x": 1 })).await.unwrap();
    assert_eq!(out, json!({ "x": 1 }));
    assert_eq!(host.running_instance_ids().await.len(), 1);
}

#[tokio::test]
async fn argument_errors_fail_fast() {
    let host = host_with(vec![greeter()]).await;
    let err = host.invoke_method("  ", "sayHi", Value::Null).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Type(_)));
    let err = host.invoke_method("Greeter", "", Value::Null).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Type(_)));
    let err = host.invoke_method("Nope", "sayHi", Value::Null).await.unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownWorkflow(_)));
}

#[tokio::test]
async fn persistence_is_set_once_before_first_call() {
    let host = host_with(vec![greeter()]).await;
    assert!(!host.is_initialized());
    assert!(host.persistence().await.is_none());
    host.set_persistence(Arc::new(InMemoryPersistence::new())).await.unwrap();
    assert!(host.persistence().await.is_some());

    host.invoke_method("Greeter", "sayHi", json!({ "name": "a" }))
        .await
        .unwrap();
    assert!(host.is_initialized());
    let err = host
        .set_persistence(Arc::new(InMemoryPersistence::new()))
        .await
        .unwrap_err();
    assert_eq!(err, WorkflowError::AlreadyInitialized);
}

#[tokio::test]
async fn register_activity_wraps_a_single_activity() {
    let host = WorkflowHost::new();
    host.register_activity(Activity::method("ping").can_create_instance(), "Ping", "1.0.0")
        .await
        .unwrap();
    let out = host.invoke_method("Ping", "ping", json!(5)).await.unwrap();
    assert_eq!(out, json!(5));

    let err = host
        .register_activity(Activity::method("ping").can_create_instance(), "Ping", "1.0.0")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::DuplicateWorkflow { .. }));
}

#[tokio::test]
async fn bookmark_resumes_the_matching_instance() {
    let host = host_with(vec![approval()]).await;

    // 1) two instances wait for approve
    let accepted = host
        .invoke_method("Approval", "submit", json!({ "id": "r1", "amount": 10 }))
        .await
        .unwrap();
    assert_eq!(accepted, json!({ "id": "r1", "amount": 10 }));
    host.invoke_method("Approval", "submit", json!({ "id": "r2", "amount": 20 }))
        .await
        .unwrap();
    assert_eq!(host.running_instance_ids().await, vec!["r1", "r2"]);

    // 2) approve routes by id
    let out = host
        .invoke_method("Approval", "approve", json!({ "id": "r2", "ok": true }))
        .await
        .unwrap();
    assert_eq!(out, json!({ "amount": 20, "approved": true }));
    assert_eq!(host.running_instance_ids().await, vec!["r1"]);

    // 3) no instance matches and approve cannot create one
    let err = host
        .invoke_method("Approval", "approve", json!({ "id": "r3", "ok": true }))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::CannotCreateInstance { .. }));

    // 4) the same id cannot be created twice
    let err = host
        .invoke_method("Approval", "submit", json!({ "id": "r1", "amount": 1 }))
        .await
        .unwrap_err();
    assert_eq!(err, WorkflowError::InstanceExists("r1".to_string()));
}

#[tokio::test]
async fn concurrent_creation_yields_one_instance() {
    let store = Arc::new(InMemoryPersistence::new());
    let host = Arc::new(host_with(vec![approval()]).await);
    host.set_persistence(store.clone()).await.unwrap();

    let mut handles = Vec::new();
    for amount in [1, 2] {
        let host = host.clone();
        handles.push(tokio::spawn(async move {
            host.invoke_method("Approval", "submit", json!({ "id": "same", "amount": amount }))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(
                matches!(
                    e,
                    WorkflowError::InstanceExists(_)
                        | WorkflowError::LockTimeout { .. }
                        | WorkflowError::CreationTimeout { .. }
                ),
                "unexpected error {e:?}"
            ),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(store.instance_ids().await, vec!["same"]);
    assert_eq!(host.running_instance_ids().await, vec!["same"]);
}

#[tokio::test]
async fn held_creation_lock_times_out() {
    let store = Arc::new(InMemoryPersistence::new());
    let _held = store
        .enter_lock("create-lock:Approval", Duration::ZERO, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    let host = WorkflowHost::with_options(HostOptions {
        enter_lock_timeout_ms: 30,
        ..HostOptions::default()
    });
    host.register_workflow(approval()).await.unwrap();
    host.set_persistence(store.clone()).await.unwrap();

    let err = host
        .invoke_method("Approval", "submit", json!({ "id": "r1" }))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        WorkflowError::LockTimeout {
            lock_name: "create-lock:Approval".to_string()
        }
    );
    assert!(store.instance_ids().await.is_empty());
    assert!(host.running_instance_ids().await.is_empty());
}

#[tokio::test]
async fn slow_creation_times_out_and_releases_the_lock() {
    let root = Activity::block(vec![
        Activity::method("start").can_create_instance(),
        Activity::func_async(|_, _| {
            async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Value::Null)
            }
            .boxed()
        }),
        Activity::method("finish"),
    ]);
    let store = Arc::new(InMemoryPersistence::new());
    let host = WorkflowHost::with_options(HostOptions {
        creation_timeout_ms: 30,
        ..HostOptions::default()
    });
    host.register_workflow(WorkflowDefinition::new("Slow", "1.0.0", root).unwrap())
        .await
        .unwrap();
    host.set_persistence(store.clone()).await.unwrap();

    let err = host.invoke_method("Slow", "start", Value::Null).await.unwrap_err();
    assert!(matches!(err, WorkflowError::CreationTimeout { timeout_ms: 30, .. }));
    assert!(store.instance_ids().await.is_empty());
    assert!(host.running_instance_ids().await.is_empty());
    assert!(store
        .enter_lock("create-lock:Slow", Duration::ZERO, Duration::from_secs(1))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn late_store_ack_leaves_no_instance_behind() {
    let store = Arc::new(SlowAck {
        inner: InMemoryPersistence::new(),
        slow: AtomicBool::new(true),
    });
    let host = WorkflowHost::with_options(HostOptions {
        creation_timeout_ms: 50,
        ..HostOptions::default()
    });
    host.register_workflow(approval()).await.unwrap();
    host.set_persistence(store.clone()).await.unwrap();

    // 1) the write lands but the budget runs out before it is acknowledged
    let err = host
        .invoke_method("Approval", "submit", json!({ "id": "r1", "amount": 1 }))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::CreationTimeout { timeout_ms: 50, .. }));
    assert!(store.inner.instance_ids().await.is_empty());
    assert!(host.running_instance_ids().await.is_empty());

    // 2) nothing routes to the abandoned instance
    let err = host
        .invoke_method("Approval", "approve", json!({ "id": "r1", "ok": true }))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::CannotCreateInstance { .. }));

    // 3) the same id can be created again
    store.slow.store(false, Ordering::SeqCst);
    host.invoke_method("Approval", "submit", json!({ "id": "r1", "amount": 2 }))
        .await
        .unwrap();
    assert_eq!(store.inner.instance_ids().await, vec!["r1"]);
    let out = host
        .invoke_method("Approval", "approve", json!({ "id": "r1", "ok": true }))
        .await
        .unwrap();
    assert_eq!(out, json!({ "amount": 2, "approved": true }));
}

#[tokio::test]
async fn concurrent_creation_without_persistence_yields_one_instance() {
    let host = host_with(vec![approval()]).await;
    let (a, b) = tokio::join!(
        host.invoke_method("Approval", "submit", json!({ "id": "same", "amount": 1 })),
        host.invoke_method("Approval", "submit", json!({ "id": "same", "amount": 2 })),
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(WorkflowError::InstanceExists(id)) if id == "same"))
            .count(),
        1
    );
    assert_eq!(host.running_instance_ids().await, vec!["same"]);
}

#[tokio::test]
async fn only_a_creating_method_takes_the_initiating_call() {
    // both branches expose `ping`; only the second may create
    let root = Activity::parallel(vec![
        Activity::method("ping").instance_id_path("id"),
        Activity::method("ping").can_create_instance().instance_id_path("id"),
    ]);
    let host = host_with(vec![WorkflowDefinition::new("Echo", "1.0.0", root).unwrap()]).await;

    let first = host
        .invoke_method("Echo", "ping", json!({ "id": "p1", "n": 1 }))
        .await
        .unwrap();
    assert_eq!(first, json!({ "id": "p1", "n": 1 }));
    assert_eq!(host.running_instance_ids().await, vec!["p1"]);

    let out = host
        .invoke_method("Echo", "ping", json!({ "id": "p1", "n": 2 }))
        .await
        .unwrap();
    assert_eq!(out, json!([{ "id": "p1", "n": 2 }, { "id": "p1", "n": 1 }]));
    assert!(host.running_instance_ids().await.is_empty());
}

#[tokio::test]
async fn faults_reach_the_caller() {
    let root = Activity::block(vec![
        Activity::method("go").can_create_instance(),
        Activity::func(|_, _| Err(ActivityError::fault("nope"))),
    ]);
    let host = host_with(vec![WorkflowDefinition::new("Failing", "1.0.0", root).unwrap()]).await;
    let err = host.invoke_method("Failing", "go", Value::Null).await.unwrap_err();
    assert_eq!(err, WorkflowError::Faulted(ActivityFault::new("nope")));
    assert!(host.running_instance_ids().await.is_empty());
}

#[tokio::test]
async fn creating_method_must_be_reached() {
    let root = Activity::block(vec![
        Activity::method("first"),
        Activity::method("start").can_create_instance(),
    ]);
    let host = host_with(vec![WorkflowDefinition::new("Gated", "1.0.0", root).unwrap()]).await;
    let err = host.invoke_method("Gated", "start", Value::Null).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::MethodNotReached {
            state: ActivityState::Idle,
            ..
        }
    ));
    assert!(host.running_instance_ids().await.is_empty());
}

#[tokio::test]
async fn trackers_reach_existing_instances() {
    let host = host_with(vec![approval()]).await;
    host.invoke_method("Approval", "submit", json!({ "id": "r1", "amount": 3 }))
        .await
        .unwrap();

    let tracker = Arc::new(RecordingTracker::default());
    host.add_tracker(tracker.clone()).await;
    host.invoke_method("Approval", "approve", json!({ "id": "r1", "ok": false }))
        .await
        .unwrap();

    let changes = tracker.changes();
    assert!(!changes.is_empty());
    assert!(changes.iter().all(|c| c.instance_id == "r1"));
    assert_eq!(changes.last().map(|c| c.state), Some(ActivityState::Complete));
}

#[tokio::test]
async fn persisted_instance_resumes_in_a_new_host() {
    let td = tempfile::tempdir().unwrap();

    // 1) first host creates and persists
    {
        let host = host_with(vec![approval()]).await;
        host.set_persistence(Arc::new(FsPersistence::new(td.path(), true).unwrap()))
            .await
            .unwrap();
        host.invoke_method("Approval", "submit", json!({ "id": "r1", "amount": 99 }))
            .await
            .unwrap();
    }

    let store = Arc::new(FsPersistence::new(td.path(), false).unwrap());
    let snap = store.load_state("r1").await.unwrap().unwrap();
    assert_eq!(snap.exec_state, ActivityState::Idle);
    assert_eq!(snap.idle_methods[0].method_name, "approve");
    assert_eq!(snap.promoted.get("status"), Some(&json!("pending")));
    let paths = store.get_running_instance_id_paths("Approval", "approve").await.unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].value.as_deref(), Some("id"));

    // 2) a fresh host restores it and finishes it
    let host = host_with(vec![approval()]).await;
    host.set_persistence(store.clone()).await.unwrap();
    let out = host
        .invoke_method("Approval", "approve", json!({ "id": "r1", "ok": true }))
        .await
        .unwrap();
    assert_eq!(out, json!({ "amount": 99, "approved": true }));
    assert!(store.load_state("r1").await.unwrap().is_none());
}

#[tokio::test]
async fn instance_snapshot_restores_and_continues() {
    let mut registry = WorkflowRegistry::new();
    let desc = registry.register(approval()).unwrap();

    let mut instance = WorkflowInstance::new(desc.clone(), "r7");
    instance
        .create("submit", json!({ "id": "r7", "amount": 5 }), None)
        .await
        .unwrap();
    assert_eq!(instance.exec_state(), ActivityState::Idle);
    assert_eq!(instance.idle_methods().len(), 1);

    let snap = instance.snapshot().unwrap();
    let mut restored = WorkflowInstance::restore(desc, &snap).unwrap();
    assert_eq!(restored.id(), "r7");
    let err = restored.call_method("submit", Value::Null).await.unwrap_err();
    assert!(matches!(err, WorkflowError::NoIdleMethod { .. }));

    let out = restored
        .call_method("approve", json!({ "id": "r7", "ok": true }))
        .await
        .unwrap();
    assert_eq!(out, json!({ "amount": 5, "approved": true }));
    assert_eq!(restored.exec_state(), ActivityState::Complete);
    assert!(restored.idle_methods().is_empty());
}
