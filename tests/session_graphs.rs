use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use taskloom_core::config::SchedulerConfig;
use taskloom_core::types::{Payload, RequestCategory, SessionId};
use taskloom_engine::graph::GraphMessage;
use taskloom_engine::{
    classify, CheckpointStore, GraphState, ProcessorRegistry, RunConfig, SessionGraphExecutor,
    WorkflowScheduler,
};

fn registry() -> Arc<ProcessorRegistry> {
    let registry = Arc::new(ProcessorRegistry::new());
    for category in RequestCategory::ALL {
        registry.register_fn(category.as_str(), move |payload: Payload| async move {
            let mut out = Payload::new();
            out.insert("handled_by".into(), json!(category));
            out.insert("request".into(), payload.get("request").cloned().unwrap_or_default());
            Ok(out)
        });
    }
    registry.register_fn("echo", |payload: Payload| async move { Ok(payload) });
    registry
}

fn executor_with(store: Arc<CheckpointStore>) -> SessionGraphExecutor {
    let scheduler = Arc::new(WorkflowScheduler::new(registry()));
    SessionGraphExecutor::new(scheduler, store, SchedulerConfig::default()).expect("compile graphs")
}

#[test]
fn test_classifier_routing_examples() {
    assert_eq!(
        classify("Give me a comprehensive view of my devices", "devices"),
        RequestCategory::Hybrid
    );
    assert_eq!(classify("show device status", "device"), RequestCategory::Device);
    assert_eq!(classify("hello", "chat"), RequestCategory::Chat);
}

#[tokio::test]
async fn test_hybrid_request_reaches_analytics_and_device_graphs() {
    let executor = executor_with(Arc::new(CheckpointStore::open_in_memory().unwrap()));
    let request = "analyze traffic trends on every router";
    let category = classify(request, "chat");
    assert_eq!(category, RequestCategory::Hybrid);

    let result = executor
        .run(category, request, Payload::new(), RunConfig::default())
        .await
        .unwrap();

    let response = result.final_response.expect("final response");
    let results = response["results"].as_object().unwrap();
    assert!(results.contains_key("analytics"));
    assert!(results.contains_key("device"));
    assert_eq!(results["device"]["result"]["handled_by"], "device");
    assert_eq!(result.error_count, 0);
}

#[tokio::test]
async fn test_workflow_graph_runs_inline_workflow() {
    let executor = executor_with(Arc::new(CheckpointStore::open_in_memory().unwrap()));
    let mut context = Payload::new();
    context.insert(
        "workflow".into(),
        json!({
            "name": "deploy",
            "max_parallel": 2,
            "tasks": [
                {"id": "build", "agent_type": "echo"},
                {"id": "test", "agent_type": "echo", "depends_on": ["build"]},
                {"id": "ship", "agent_type": "echo", "depends_on": ["test"]}
            ]
        }),
    );

    let result = executor
        .run(RequestCategory::Workflow, "deploy the api", context, RunConfig::default())
        .await
        .unwrap();

    assert_eq!(result.error_count, 0);
    let workflow = &result.final_response.unwrap()["result"];
    assert_eq!(workflow["state"], "completed");
    assert_eq!(workflow["metrics"]["tasks_completed"], 3);
}

#[test]
fn test_checkpoint_round_trip_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open(&dir.path().join("checkpoints.db")).unwrap();

    let mut context = Payload::new();
    context.insert("tenant".into(), json!({"id": 7, "tags": ["edge", "lab"]}));
    let mut state = GraphState::new(
        &SessionId::from_string("round-trip"),
        RequestCategory::Analytics,
        "weekly report",
        context,
        25,
    );
    state.push_message(GraphMessage::user("weekly report"));
    state.set_result("analytics", json!({"rows": [1, 2, 3], "ratio": 0.25}));
    state.error_count = 1;
    state.iteration = 2;

    store.save("round-trip", &state).unwrap();
    store.save("other", &state).unwrap();
    assert_eq!(store.load("round-trip").unwrap().unwrap(), state);

    assert_eq!(store.cleanup(Duration::from_secs(86_400)).unwrap(), 0);
    assert_eq!(store.list().unwrap().len(), 2);
    assert_eq!(store.cleanup(Duration::ZERO).unwrap(), 2);
    assert!(store.load("round-trip").unwrap().is_none());
}

#[tokio::test]
async fn test_resume_from_persisted_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");

    let first = {
        let executor = executor_with(Arc::new(CheckpointStore::open(&path).unwrap()));
        let config = RunConfig::default()
            .with_session_id(SessionId::from_string("persisted"))
            .with_checkpoint_after(["device"]);
        executor
            .run(RequestCategory::Device, "reboot switch 4", Payload::new(), config)
            .await
            .unwrap()
    };

    // A new process: fresh executor, same database.
    let executor = executor_with(Arc::new(CheckpointStore::open(&path).unwrap()));
    let resumed = executor
        .resume("persisted", RunConfig::default())
        .await
        .unwrap();

    assert_eq!(resumed.session_id, SessionId::from_string("persisted"));
    assert_eq!(resumed.final_response, first.final_response);
    assert_eq!(resumed.iterations, 3);
    assert_eq!(
        resumed.final_response.unwrap()["result"]["request"],
        "reboot switch 4"
    );
}

#[tokio::test]
async fn test_concurrent_sessions_share_store() {
    let executor = Arc::new(executor_with(Arc::new(
        CheckpointStore::open_in_memory().unwrap(),
    )));

    let mut handles = Vec::new();
    for i in 0..8 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            let config = RunConfig::default()
                .with_session_id(SessionId::from_string(&format!("s-{}", i)))
                .with_checkpoint_after(["respond"]);
            executor
                .run(RequestCategory::Chat, "hello", Payload::new(), config)
                .await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(result.final_response.is_some());
    }

    assert_eq!(executor.store().list().unwrap().len(), 8);
    assert_eq!(executor.sessions().list().len(), 8);
}
