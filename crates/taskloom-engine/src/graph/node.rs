use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use taskloom_core::config::SchedulerConfig;
use taskloom_core::error::LoomError;
use taskloom_core::types::Payload;
use taskloom_core::workflow::WorkflowFile;

use super::state::{GraphMessage, GraphState};
use crate::registry::ProcessorRegistry;
use crate::scheduler::WorkflowScheduler;

pub const INTAKE: &str = "intake";
pub const RESPOND: &str = "respond";
pub const WORKFLOW: &str = "workflow";

/// Context key holding an inline workflow for the `workflow` node.
pub const WORKFLOW_CONTEXT_KEY: &str = "workflow";

/// One step of a session graph.
///
/// Nodes never fail the graph: a node that cannot do its work records the
/// error on the state (see [`GraphState::record_error`]) and hands the state on.
pub trait GraphNode: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, state: GraphState) -> BoxFuture<'_, GraphState>;
}

/// Opens the transcript with the user request.
pub struct IntakeNode;

impl GraphNode for IntakeNode {
    fn name(&self) -> &str {
        INTAKE
    }

    fn run(&self, mut state: GraphState) -> BoxFuture<'_, GraphState> {
        async move {
            let request = state.request.clone();
            state.push_message(GraphMessage::user(request));
            let intake = json!({
                "category": state.category,
                "context_keys": sorted_keys(&state.context),
            });
            state.set_result(INTAKE, intake);
            state
        }
        .boxed()
    }
}

/// Hands the request to the processor registered for `agent_type` and stores
/// its output under the node's name.
pub struct AgentNode {
    name: String,
    agent_type: String,
    registry: Arc<ProcessorRegistry>,
}

impl AgentNode {
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            registry,
        }
    }

    async fn call(&self, mut state: GraphState) -> GraphState {
        let Some(processor) = self.registry.get(&self.agent_type) else {
            warn!(node = %self.name, agent_type = %self.agent_type, "No processor registered");
            state.record_error(&self.name, LoomError::UnknownAgentType(self.agent_type.clone()));
            return state;
        };

        match processor.execute(processor_payload(&state)).await {
            Ok(output) => {
                let output = Value::Object(output.into_iter().collect());
                let summary = summarize(&self.name, &output);
                state.set_result(self.name.clone(), output);
                state.push_message(GraphMessage::node(self.name.clone(), summary));
            }
            Err(e) => {
                warn!(
                    session_id = %state.session_id(),
                    node = %self.name,
                    error = %e,
                    "Processor failed"
                );
                state.record_error(&self.name, e);
            }
        }
        state
    }
}

impl GraphNode for AgentNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, state: GraphState) -> BoxFuture<'_, GraphState> {
        self.call(state).boxed()
    }
}

/// Builds `final_response` from the category node's result.
pub struct RespondNode {
    source: String,
}

impl RespondNode {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl GraphNode for RespondNode {
    fn name(&self) -> &str {
        RESPOND
    }

    fn run(&self, mut state: GraphState) -> BoxFuture<'_, GraphState> {
        async move {
            let result = state.result(&self.source).cloned().unwrap_or(Value::Null);
            let mut response = json!({
                "type": state.category,
                "result": result,
            });
            if state.error_count > 0 {
                response["errors"] = json!(state.error_count);
            }
            state.final_response = Some(response);
            state.push_message(GraphMessage::node(RESPOND, "Response ready"));
            state
        }
        .boxed()
    }
}

/// Runs a workflow through the scheduler.
///
/// When the context carries an inline workflow under `workflow`, it is
/// resolved against the scheduler defaults and executed; the execution
/// result becomes the node result. Otherwise the node behaves like an
/// [`AgentNode`] for the `workflow` agent type.
pub struct WorkflowNode {
    scheduler: Arc<WorkflowScheduler>,
    defaults: SchedulerConfig,
    fallback: AgentNode,
}

impl WorkflowNode {
    pub fn new(scheduler: Arc<WorkflowScheduler>, defaults: SchedulerConfig) -> Self {
        let fallback = AgentNode::new(WORKFLOW, WORKFLOW, scheduler.registry().clone());
        Self {
            scheduler,
            defaults,
            fallback,
        }
    }

    async fn run_inline(&self, mut state: GraphState, definition: Value) -> GraphState {
        let file: WorkflowFile = match serde_json::from_value(definition) {
            Ok(file) => file,
            Err(e) => {
                state.record_error(WORKFLOW, LoomError::InvalidWorkflow(e.to_string()));
                return state;
            }
        };
        let definition = file.into_definition(&self.defaults);
        debug!(
            session_id = %state.session_id(),
            workflow_id = %definition.id,
            tasks = definition.tasks.len(),
            "Running inline workflow"
        );

        match self.scheduler.run(definition).await {
            Ok(result) => {
                let summary = format!(
                    "Workflow {} completed {} of {} tasks",
                    result.workflow_id, result.metrics.tasks_completed, result.metrics.tasks_total
                );
                state.set_result(WORKFLOW, serde_json::to_value(&result).unwrap_or_default());
                state.push_message(GraphMessage::node(WORKFLOW, summary));
            }
            Err(e) => state.record_error(WORKFLOW, e),
        }
        state
    }
}

impl GraphNode for WorkflowNode {
    fn name(&self) -> &str {
        WORKFLOW
    }

    fn run(&self, state: GraphState) -> BoxFuture<'_, GraphState> {
        async move {
            match state.context.get(WORKFLOW_CONTEXT_KEY).cloned() {
                Some(definition) => self.run_inline(state, definition).await,
                None => self.fallback.call(state).await,
            }
        }
        .boxed()
    }
}

/// Processor input: the caller context plus request, category and session.
fn processor_payload(state: &GraphState) -> Payload {
    let mut payload = state.context.clone();
    payload.insert("request".into(), json!(state.request));
    payload.insert("category".into(), json!(state.category));
    payload.insert("session_id".into(), json!(state.session_id()));
    payload
}

fn summarize(node: &str, output: &Value) -> String {
    ["summary", "response", "message"]
        .iter()
        .find_map(|key| output.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} completed", node))
}

fn sorted_keys(payload: &Payload) -> Vec<&str> {
    let mut keys: Vec<&str> = payload.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_core::types::{RequestCategory, SessionId};

    fn state(category: RequestCategory, request: &str) -> GraphState {
        GraphState::new(&SessionId::from_string("s"), category, request, Payload::new(), 10)
    }

    fn registry() -> Arc<ProcessorRegistry> {
        let registry = Arc::new(ProcessorRegistry::new());
        registry.register_fn("device", |payload: Payload| async move {
            let mut out = Payload::new();
            out.insert("summary".into(), json!("2 devices online"));
            out.insert("echo".into(), payload.get("request").cloned().unwrap_or_default());
            Ok(out)
        });
        registry.register_fn("broken", |_payload: Payload| async move {
            Err(LoomError::Processor("backend down".into()))
        });
        registry
    }

    #[tokio::test]
    async fn test_intake_records_request() {
        let s = IntakeNode.run(state(RequestCategory::Chat, "hi")).await;
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.messages[0].content, "hi");
        assert_eq!(s.result(INTAKE).unwrap()["category"], "chat");
    }

    #[tokio::test]
    async fn test_agent_node_stores_result_under_name() {
        let node = AgentNode::new("device", "device", registry());
        let s = node.run(state(RequestCategory::Device, "status?")).await;
        assert_eq!(s.error_count, 0);
        assert_eq!(s.result("device").unwrap()["echo"], "status?");
        assert_eq!(s.messages.last().unwrap().content, "2 devices online");
    }

    #[tokio::test]
    async fn test_agent_node_failure_is_recorded() {
        let node = AgentNode::new("device", "broken", registry());
        let before = state(RequestCategory::Device, "status?");
        let s = node.run(before.clone()).await;
        assert_eq!(s.error_count, 1);
        assert!(s.result("device").is_none());
        assert_eq!(s.results, before.results);
    }

    #[tokio::test]
    async fn test_agent_node_unknown_agent_type() {
        let node = AgentNode::new("analytics", "analytics", registry());
        let s = node.run(state(RequestCategory::Analytics, "x")).await;
        assert_eq!(s.error_count, 1);
        assert!(s.messages[0].content.contains("analytics"));
    }

    #[tokio::test]
    async fn test_respond_builds_final_response() {
        let mut s = state(RequestCategory::Device, "x");
        s.set_result("device", json!({"online": 2}));
        let s = RespondNode::new("device").run(s).await;
        let response = s.final_response.unwrap();
        assert_eq!(response["type"], "device");
        assert_eq!(response["result"]["online"], 2);
        assert!(response.get("errors").is_none());
    }

    #[tokio::test]
    async fn test_workflow_node_runs_inline_workflow() {
        let registry = registry();
        let scheduler = Arc::new(WorkflowScheduler::new(registry));
        let node = WorkflowNode::new(scheduler.clone(), SchedulerConfig::default());

        let mut s = state(RequestCategory::Workflow, "run it");
        s.context.insert(
            WORKFLOW_CONTEXT_KEY.into(),
            json!({
                "id": "inline-1",
                "name": "inline",
                "tasks": [
                    {"id": "a", "agent_type": "device"},
                    {"id": "b", "agent_type": "device", "depends_on": ["a"]}
                ]
            }),
        );

        let s = node.run(s).await;
        assert_eq!(s.error_count, 0);
        let result = s.result(WORKFLOW).unwrap();
        assert_eq!(result["workflow_id"], "inline-1");
        assert_eq!(result["metrics"]["tasks_completed"], 2);
        assert!(scheduler.status("inline-1").is_ok());
    }

    #[tokio::test]
    async fn test_workflow_node_without_inline_uses_processor() {
        let registry = registry();
        registry.register_fn("workflow", |_payload: Payload| async move {
            let mut out = Payload::new();
            out.insert("summary".into(), json!("queued"));
            Ok(out)
        });
        let scheduler = Arc::new(WorkflowScheduler::new(registry));
        let node = WorkflowNode::new(scheduler, SchedulerConfig::default());

        let s = node.run(state(RequestCategory::Workflow, "deploy")).await;
        assert_eq!(s.result(WORKFLOW).unwrap()["summary"], "queued");
    }

    #[tokio::test]
    async fn test_workflow_node_bad_inline_definition() {
        let scheduler = Arc::new(WorkflowScheduler::new(registry()));
        let node = WorkflowNode::new(scheduler, SchedulerConfig::default());

        let mut s = state(RequestCategory::Workflow, "run");
        s.context.insert(WORKFLOW_CONTEXT_KEY.into(), json!({"tasks": 3}));
        let s = node.run(s).await;
        assert_eq!(s.error_count, 1);
        assert!(s.result(WORKFLOW).is_none());
    }
}
