//! Nodes of the `hybrid` graph: classify the categories a request touches, run
//! each category's graph on a child state, and merge the child responses.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use taskloom_core::types::RequestCategory;

use super::compiled::CompiledGraph;
use super::node::GraphNode;
use super::state::{keys, GraphMessage, GraphState};

pub const CLASSIFY: &str = "classify";
pub const FAN_OUT: &str = "fan_out";
pub const SYNTHESIZE: &str = "synthesize";

/// Topic words per category. Deliberately broader than the request
/// classifier's tables: a hybrid request should reach every graph it plausibly
/// concerns.
const TOPICS: &[(RequestCategory, &[&str])] = &[
    (
        RequestCategory::Analytics,
        &["analy", "metric", "report", "trend", "statistic", "performance", "usage"],
    ),
    (
        RequestCategory::Device,
        &["device", "router", "switch", "firewall", "interface", "network", "firmware"],
    ),
    (
        RequestCategory::Operations,
        &["incident", "alert", "outage", "ticket", "maintenance", "health", "uptime"],
    ),
    (
        RequestCategory::Automation,
        &["automat", "schedul", "script", "playbook", "backup"],
    ),
    (
        RequestCategory::Workflow,
        &["workflow", "pipeline", "orchestrat"],
    ),
];

/// Categories a request touches, in table order. Never empty.
pub fn touched_categories(request: &str) -> Vec<RequestCategory> {
    let text = request.to_lowercase();
    let mut touched: Vec<RequestCategory> = TOPICS
        .iter()
        .filter(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map(|(category, _)| *category)
        .collect();
    if touched.is_empty() {
        touched.push(RequestCategory::Chat);
    }
    touched
}

/// Categories recorded by [`ClassifyNode`] on `state`.
pub fn recorded_categories(state: &GraphState) -> Vec<RequestCategory> {
    state
        .metadata
        .get(keys::HYBRID_CATEGORIES)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| s.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

pub struct ClassifyNode;

impl GraphNode for ClassifyNode {
    fn name(&self) -> &str {
        CLASSIFY
    }

    fn run(&self, mut state: GraphState) -> BoxFuture<'_, GraphState> {
        async move {
            let categories = touched_categories(&state.request);
            let names: Vec<&str> = categories.iter().map(|c| c.as_str()).collect();
            debug!(session_id = %state.session_id(), categories = ?names, "Hybrid request classified");

            state.set_metadata(keys::HYBRID_CATEGORIES, json!(names));
            state.set_result(CLASSIFY, json!({ "categories": names }));
            state.push_message(GraphMessage::node(
                CLASSIFY,
                format!("Request touches: {}", names.join(", ")),
            ));
            state
        }
        .boxed()
    }
}

/// Runs each recorded category's graph, one after another, on a fresh child
/// state sharing the parent's request and context.
pub struct FanOutNode {
    graphs: HashMap<RequestCategory, Arc<CompiledGraph>>,
}

impl FanOutNode {
    pub fn new(graphs: HashMap<RequestCategory, Arc<CompiledGraph>>) -> Self {
        Self { graphs }
    }

    async fn fan_out(&self, mut state: GraphState) -> GraphState {
        let mut responses = Map::new();

        for category in recorded_categories(&state) {
            let Some(graph) = self.graphs.get(&category) else {
                debug!(category = %category, "No graph for hybrid category, skipping");
                continue;
            };

            let child = state.child(category);
            match graph.execute(child, None, |_, _| Ok(())).await {
                Ok(child) => {
                    state.error_count += child.error_count;
                    responses.insert(
                        category.to_string(),
                        child.final_response.unwrap_or(Value::Null),
                    );
                }
                Err(e) => {
                    warn!(session_id = %state.session_id(), category = %category, error = %e, "Sub-graph failed");
                    state.record_error(&format!("{}:{}", FAN_OUT, category), e);
                }
            }
        }

        let count = responses.len();
        state.set_result(FAN_OUT, Value::Object(responses));
        state.push_message(GraphMessage::node(
            FAN_OUT,
            format!("Ran {} sub-graph(s)", count),
        ));
        state
    }
}

impl GraphNode for FanOutNode {
    fn name(&self) -> &str {
        FAN_OUT
    }

    fn run(&self, state: GraphState) -> BoxFuture<'_, GraphState> {
        self.fan_out(state).boxed()
    }
}

/// Merges the fan-out responses into the hybrid `final_response`.
pub struct SynthesizeNode;

impl GraphNode for SynthesizeNode {
    fn name(&self) -> &str {
        SYNTHESIZE
    }

    fn run(&self, mut state: GraphState) -> BoxFuture<'_, GraphState> {
        async move {
            let categories: Vec<&str> = recorded_categories(&state)
                .into_iter()
                .map(|c| c.as_str())
                .collect();
            let results = state
                .result(FAN_OUT)
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            let answered = results.as_object().map(Map::len).unwrap_or(0);

            state.final_response = Some(json!({
                "type": "hybrid",
                "categories": categories,
                "results": results,
            }));
            state.push_message(GraphMessage::node(
                SYNTHESIZE,
                format!("Combined results from {} categories", answered),
            ));
            state
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{AgentNode, IntakeNode, RespondNode};
    use crate::registry::ProcessorRegistry;
    use taskloom_core::types::{Payload, SessionId};

    fn state(request: &str) -> GraphState {
        GraphState::new(
            &SessionId::from_string("h"),
            RequestCategory::Hybrid,
            request,
            Payload::new(),
            10,
        )
    }

    fn echo_graph(category: RequestCategory, registry: &Arc<ProcessorRegistry>) -> Arc<CompiledGraph> {
        Arc::new(
            CompiledGraph::chain(
                category,
                vec![
                    Arc::new(IntakeNode),
                    Arc::new(AgentNode::new(category.as_str(), category.as_str(), registry.clone())),
                    Arc::new(RespondNode::new(category.as_str())),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_touched_categories() {
        assert_eq!(
            touched_categories("Analyze router performance"),
            vec![RequestCategory::Analytics, RequestCategory::Device]
        );
        assert_eq!(touched_categories("good morning"), vec![RequestCategory::Chat]);
    }

    #[tokio::test]
    async fn test_classify_records_metadata() {
        let s = ClassifyNode.run(state("device health")).await;
        assert_eq!(
            recorded_categories(&s),
            vec![RequestCategory::Device, RequestCategory::Operations]
        );
        assert_eq!(s.result(CLASSIFY).unwrap()["categories"][0], "device");
    }

    #[tokio::test]
    async fn test_fan_out_and_synthesize() {
        let registry = Arc::new(ProcessorRegistry::new());
        for category in [RequestCategory::Analytics, RequestCategory::Device] {
            registry.register_fn(category.as_str(), move |_payload: Payload| async move {
                let mut out = Payload::new();
                out.insert("handled_by".into(), json!(category.as_str()));
                Ok(out)
            });
        }
        let graphs: HashMap<_, _> = [RequestCategory::Analytics, RequestCategory::Device]
            .into_iter()
            .map(|c| (c, echo_graph(c, &registry)))
            .collect();

        let s = ClassifyNode.run(state("usage report for every router")).await;
        let s = FanOutNode::new(graphs).run(s).await;
        let s = SynthesizeNode.run(s).await;

        assert_eq!(s.error_count, 0);
        let response = s.final_response.unwrap();
        assert_eq!(response["type"], "hybrid");
        assert_eq!(response["categories"], json!(["analytics", "device"]));
        assert_eq!(response["results"]["analytics"]["result"]["handled_by"], "analytics");
        assert_eq!(response["results"]["device"]["result"]["handled_by"], "device");
    }

    #[tokio::test]
    async fn test_fan_out_skips_categories_without_graph() {
        let s = ClassifyNode.run(state("hello there")).await;
        let s = FanOutNode::new(HashMap::new()).run(s).await;
        assert_eq!(s.result(FAN_OUT).unwrap(), &json!({}));
        let s = SynthesizeNode.run(s).await;
        assert_eq!(s.final_response.unwrap()["categories"], json!(["chat"]));
    }
}
