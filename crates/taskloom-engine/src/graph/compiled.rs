use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use taskloom_core::error::{LoomError, Result};
use taskloom_core::types::RequestCategory;

use super::edge::Edge;
use super::node::GraphNode;
use super::state::{keys, GraphState};

/// Node and edge listing of a compiled graph, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphDescription {
    pub category: RequestCategory,
    pub entry: String,
    pub nodes: Vec<String>,
    pub edges: Vec<Edge>,
}

/// A validated linear graph of nodes.
pub struct CompiledGraph {
    category: RequestCategory,
    nodes: HashMap<String, Arc<dyn GraphNode>>,
    edges: Vec<Edge>,
    entry: String,
}

impl CompiledGraph {
    pub fn builder(category: RequestCategory) -> GraphBuilder {
        GraphBuilder {
            category,
            nodes: Vec::new(),
            edges: Vec::new(),
            entry: None,
        }
    }

    /// Linear chain of `nodes`, entered at the first one.
    pub fn chain(category: RequestCategory, nodes: Vec<Arc<dyn GraphNode>>) -> Result<Self> {
        let names: Vec<String> = nodes.iter().map(|n| n.name().to_string()).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut builder = Self::builder(category);
        for node in nodes {
            builder = builder.node(node);
        }
        builder.edges(Edge::chain(&refs)).build()
    }

    pub fn category(&self) -> RequestCategory {
        self.category
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Successor of `node`, or `None` at the end of the chain.
    pub fn next(&self, node: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.from == node)
            .map(|e| e.to.as_str())
    }

    /// Node names in execution order.
    pub fn node_order(&self) -> Vec<String> {
        let mut order = vec![self.entry.clone()];
        let mut current = self.entry.as_str();
        while let Some(next) = self.next(current) {
            order.push(next.to_string());
            current = next;
        }
        order
    }

    pub fn describe(&self) -> GraphDescription {
        GraphDescription {
            category: self.category,
            entry: self.entry.clone(),
            nodes: self.node_order(),
            edges: self.edges.clone(),
        }
    }

    /// Walk the graph from `start` (default: the entry node) to the end.
    ///
    /// Every node visit counts against `state.max_iterations`. `after_node`
    /// runs after each node and may fail the run (checkpoint errors do).
    pub async fn execute<F>(
        &self,
        mut state: GraphState,
        start: Option<&str>,
        mut after_node: F,
    ) -> Result<GraphState>
    where
        F: FnMut(&str, &mut GraphState) -> Result<()> + Send,
    {
        let mut current = Some(start.unwrap_or(self.entry.as_str()).to_string());

        while let Some(name) = current {
            if state.iteration >= state.max_iterations {
                return Err(LoomError::IterationLimitExceeded(state.max_iterations));
            }
            let node = self
                .nodes
                .get(&name)
                .ok_or_else(|| LoomError::Graph(format!("node '{}' not found", name)))?;

            state.iteration += 1;
            let started = Instant::now();
            state = node.run(state).await;
            state.set_metadata(keys::LAST_NODE, serde_json::json!(name));

            debug!(
                session_id = %state.session_id(),
                category = %self.category,
                node = %name,
                iteration = state.iteration,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Node complete"
            );

            after_node(&name, &mut state)?;
            current = self.next(&name).map(str::to_string);
        }

        Ok(state)
    }
}

pub struct GraphBuilder {
    category: RequestCategory,
    nodes: Vec<Arc<dyn GraphNode>>,
    edges: Vec<Edge>,
    entry: Option<String>,
}

impl GraphBuilder {
    pub fn node(mut self, node: Arc<dyn GraphNode>) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn edges(mut self, edges: Vec<Edge>) -> Self {
        self.edges.extend(edges);
        self
    }

    /// Entry node. Defaults to the first node added.
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Validate and compile. Every edge must join known nodes, no node may
    /// have more than one successor, and the chain must not loop.
    pub fn build(self) -> Result<CompiledGraph> {
        let mut nodes: HashMap<String, Arc<dyn GraphNode>> = HashMap::new();
        for node in &self.nodes {
            let name = node.name().to_string();
            if nodes.insert(name.clone(), node.clone()).is_some() {
                return Err(LoomError::Graph(format!("duplicate node '{}'", name)));
            }
        }

        let entry = match self.entry {
            Some(entry) => entry,
            None => self
                .nodes
                .first()
                .map(|n| n.name().to_string())
                .ok_or_else(|| LoomError::Graph(format!("{} graph has no nodes", self.category)))?,
        };
        if !nodes.contains_key(&entry) {
            return Err(LoomError::Graph(format!("entry node '{}' not found", entry)));
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !nodes.contains_key(end) {
                    return Err(LoomError::Graph(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.from, edge.to, end
                    )));
                }
            }
            if self.edges.iter().filter(|e| e.from == edge.from).count() > 1 {
                return Err(LoomError::Graph(format!(
                    "node '{}' has more than one successor",
                    edge.from
                )));
            }
        }

        let graph = CompiledGraph {
            category: self.category,
            nodes,
            edges: self.edges,
            entry,
        };

        // A loop would make node_order() spin; walking at most one step per
        // edge proves the chain ends.
        let terminates = {
            let mut current = Some(graph.entry.as_str());
            for _ in 0..=graph.edges.len() {
                current = current.and_then(|node| graph.next(node));
            }
            current.is_none()
        };
        if !terminates {
            return Err(LoomError::Graph(format!("{} graph contains a loop", graph.category)));
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use taskloom_core::types::{Payload, SessionId};

    struct Tag(&'static str);

    impl GraphNode for Tag {
        fn name(&self) -> &str {
            self.0
        }

        fn run(&self, mut state: GraphState) -> BoxFuture<'_, GraphState> {
            async move {
                let visits = state.results.len();
                state.set_result(self.0, serde_json::json!(visits));
                state
            }
            .boxed()
        }
    }

    fn tag(name: &'static str) -> Arc<dyn GraphNode> {
        Arc::new(Tag(name))
    }

    fn state(max_iterations: u32) -> GraphState {
        GraphState::new(
            &SessionId::from_string("s"),
            RequestCategory::Chat,
            "hi",
            Payload::new(),
            max_iterations,
        )
    }

    #[tokio::test]
    async fn test_chain_runs_in_edge_order() {
        let graph =
            CompiledGraph::chain(RequestCategory::Chat, vec![tag("a"), tag("b"), tag("c")]).unwrap();
        let mut seen = Vec::new();
        let out = graph
            .execute(state(10), None, |name, _| {
                seen.push(name.to_string());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(out.result("c").unwrap(), 2);
        assert_eq!(out.iteration, 3);
        assert_eq!(out.metadata_str(keys::LAST_NODE), Some("c"));
    }

    #[tokio::test]
    async fn test_execute_from_middle() {
        let graph =
            CompiledGraph::chain(RequestCategory::Chat, vec![tag("a"), tag("b"), tag("c")]).unwrap();
        let out = graph.execute(state(10), Some("b"), |_, _| Ok(())).await.unwrap();
        assert!(out.result("a").is_none());
        assert_eq!(out.iteration, 2);
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let graph =
            CompiledGraph::chain(RequestCategory::Chat, vec![tag("a"), tag("b"), tag("c")]).unwrap();
        let err = graph.execute(state(2), None, |_, _| Ok(())).await.unwrap_err();
        assert!(matches!(err, LoomError::IterationLimitExceeded(2)));
    }

    #[tokio::test]
    async fn test_after_node_error_stops_run() {
        let graph = CompiledGraph::chain(RequestCategory::Chat, vec![tag("a"), tag("b")]).unwrap();
        let err = graph
            .execute(state(10), None, |name, _| {
                if name == "a" {
                    Err(LoomError::Checkpoint("disk full".into()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LoomError::Checkpoint(_)));
    }

    #[test]
    fn test_describe() {
        let graph = CompiledGraph::chain(RequestCategory::Device, vec![tag("x"), tag("y")]).unwrap();
        let description = graph.describe();
        assert_eq!(description.entry, "x");
        assert_eq!(description.nodes, vec!["x", "y"]);
        assert_eq!(description.edges, vec![Edge::new("x", "y")]);
    }

    #[test]
    fn test_build_rejects_bad_graphs() {
        let unknown = CompiledGraph::builder(RequestCategory::Chat)
            .node(tag("a"))
            .edge("a", "missing")
            .build();
        assert!(matches!(unknown, Err(LoomError::Graph(_))));

        let fork = CompiledGraph::builder(RequestCategory::Chat)
            .node(tag("a"))
            .node(tag("b"))
            .node(tag("c"))
            .edge("a", "b")
            .edge("a", "c")
            .build();
        assert!(matches!(fork, Err(LoomError::Graph(_))));

        let looped = CompiledGraph::builder(RequestCategory::Chat)
            .node(tag("a"))
            .node(tag("b"))
            .edge("a", "b")
            .edge("b", "a")
            .build();
        assert!(matches!(looped, Err(LoomError::Graph(_))));

        let empty = CompiledGraph::builder(RequestCategory::Chat).build();
        assert!(matches!(empty, Err(LoomError::Graph(_))));
    }
}
