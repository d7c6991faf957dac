use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use taskloom_core::config::{GraphConfig, SchedulerConfig};
use taskloom_core::error::{LoomError, Result};
use taskloom_core::types::{Payload, RequestCategory, SessionId};

use super::compiled::{CompiledGraph, GraphDescription};
use super::hybrid::{ClassifyNode, FanOutNode, SynthesizeNode};
use super::node::{AgentNode, GraphNode, IntakeNode, RespondNode, WorkflowNode};
use super::state::{keys, GraphMessage, GraphState};
use crate::checkpoint::CheckpointStore;
use crate::scheduler::WorkflowScheduler;
use crate::session::SessionManager;

/// Per-run options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Session to run under. A fresh id is generated when absent.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub max_iterations: u32,
    /// Node names after which the session is checkpointed.
    #[serde(default)]
    pub checkpoint_after: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_graph_config(&GraphConfig::default())
    }
}

impl RunConfig {
    pub fn from_graph_config(config: &GraphConfig) -> Self {
        Self {
            session_id: None,
            max_iterations: config.max_iterations,
            checkpoint_after: vec![],
        }
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_checkpoint_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.checkpoint_after = nodes.into_iter().map(Into::into).collect();
        self
    }
}

/// What a finished session hands back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct GraphRunResult {
    pub session_id: SessionId,
    pub category: RequestCategory,
    pub final_response: Option<Value>,
    pub messages: Vec<GraphMessage>,
    pub results: HashMap<String, Value>,
    pub error_count: u32,
    pub iterations: u32,
    pub checkpoints: Vec<String>,
}

impl GraphRunResult {
    fn from_state(state: GraphState) -> Self {
        Self {
            session_id: SessionId::from_string(state.session_id()),
            category: state.category,
            final_response: state.final_response,
            messages: state.messages,
            results: state.results,
            error_count: state.error_count,
            iterations: state.iteration,
            checkpoints: state.checkpoints,
        }
    }
}

/// Incremental output of [`SessionGraphExecutor::stream`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    NodeCompleted {
        session_id: String,
        node: String,
        iteration: u32,
        result: Option<Value>,
    },
    Completed {
        result: GraphRunResult,
    },
    Error {
        session_id: String,
        error: String,
    },
}

/// Category name to category; anything unrecognized is routed to `hybrid`.
pub fn resolve_category(name: &str) -> RequestCategory {
    name.parse().unwrap_or_else(|_| {
        warn!(category = name, "Unknown category, using hybrid graph");
        RequestCategory::Hybrid
    })
}

/// Runs requests through the per-category session graphs.
///
/// Each category compiles to `intake → <category> → respond`; `hybrid` is
/// `intake → classify → fan_out → synthesize` and reuses the other graphs as
/// sub-steps. Node visits run strictly one after another within a session;
/// separate sessions may run concurrently.
pub struct SessionGraphExecutor {
    graphs: HashMap<RequestCategory, Arc<CompiledGraph>>,
    hybrid: Arc<CompiledGraph>,
    store: Arc<CheckpointStore>,
    sessions: SessionManager,
}

impl SessionGraphExecutor {
    /// Compile every category graph. Agent nodes call the processor registered
    /// under the category name; the workflow node runs inline workflows on
    /// `scheduler` with `workflow_defaults` filling unset limits.
    pub fn new(
        scheduler: Arc<WorkflowScheduler>,
        store: Arc<CheckpointStore>,
        workflow_defaults: SchedulerConfig,
    ) -> Result<Self> {
        let registry = scheduler.registry().clone();
        let mut graphs = HashMap::new();

        for category in [
            RequestCategory::Chat,
            RequestCategory::Analytics,
            RequestCategory::Device,
            RequestCategory::Operations,
            RequestCategory::Automation,
        ] {
            let worker: Arc<dyn GraphNode> = Arc::new(AgentNode::new(
                category.as_str(),
                category.as_str(),
                registry.clone(),
            ));
            graphs.insert(category, Arc::new(category_chain(category, worker)?));
        }

        let workflow: Arc<dyn GraphNode> =
            Arc::new(WorkflowNode::new(scheduler, workflow_defaults));
        graphs.insert(
            RequestCategory::Workflow,
            Arc::new(category_chain(RequestCategory::Workflow, workflow)?),
        );

        let hybrid = Arc::new(CompiledGraph::chain(
            RequestCategory::Hybrid,
            vec![
                Arc::new(IntakeNode),
                Arc::new(ClassifyNode),
                Arc::new(FanOutNode::new(graphs.clone())),
                Arc::new(SynthesizeNode),
            ],
        )?);
        graphs.insert(RequestCategory::Hybrid, hybrid.clone());

        Ok(Self {
            graphs,
            hybrid,
            store,
            sessions: SessionManager::new(),
        })
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Categories with a compiled graph.
    pub fn available_categories(&self) -> Vec<RequestCategory> {
        RequestCategory::ALL
            .into_iter()
            .filter(|c| self.graphs.contains_key(c))
            .collect()
    }

    pub fn describe_graph(&self, category: RequestCategory) -> GraphDescription {
        self.graph_for(category).describe()
    }

    fn graph_for(&self, category: RequestCategory) -> Arc<CompiledGraph> {
        match self.graphs.get(&category) {
            Some(graph) => graph.clone(),
            None => {
                warn!(category = %category, "No graph for category, using hybrid graph");
                self.hybrid.clone()
            }
        }
    }

    /// Run a request to completion.
    pub async fn run(
        &self,
        category: RequestCategory,
        request: &str,
        context: Payload,
        config: RunConfig,
    ) -> Result<GraphRunResult> {
        self.run_observed(category, request, context, config, |_, _| {})
            .await
    }

    /// Run a request, yielding a chunk per completed node and a final
    /// `completed` or `error` chunk.
    pub fn stream(
        self: Arc<Self>,
        category: RequestCategory,
        request: String,
        context: Payload,
        config: RunConfig,
    ) -> BoxStream<'static, StreamChunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = config.session_id.clone().unwrap_or_default();
        let config = config.with_session_id(session_id.clone());

        tokio::spawn(async move {
            let node_tx = tx.clone();
            let outcome = self
                .run_observed(category, &request, context, config, move |node, state| {
                    let _ = node_tx.send(StreamChunk::NodeCompleted {
                        session_id: state.session_id().to_string(),
                        node: node.to_string(),
                        iteration: state.iteration,
                        result: state.result(node).cloned(),
                    });
                })
                .await;

            let last = match outcome {
                Ok(result) => StreamChunk::Completed { result },
                Err(e) => StreamChunk::Error {
                    session_id: session_id.0,
                    error: e.to_string(),
                },
            };
            let _ = tx.send(last);
        });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed()
    }

    /// Snapshot `state` now. Returns the checkpoint id recorded on the state.
    pub fn checkpoint(&self, state: &mut GraphState) -> Result<String> {
        let session_id = state.session_id().to_string();
        let id = format!(
            "{}:{}:{}",
            session_id,
            state.iteration,
            state.metadata_str(keys::LAST_NODE).unwrap_or("start")
        );
        state.checkpoints.push(id.clone());
        self.store.save(&session_id, state)?;
        debug!(session_id = %session_id, checkpoint = %id, "Checkpoint saved");
        Ok(id)
    }

    /// Continue a checkpointed session from the node after the last one it
    /// completed. A session that already reached the end of its graph is
    /// returned as stored.
    pub async fn resume(&self, session_id: &str, config: RunConfig) -> Result<GraphRunResult> {
        let mut state = self
            .store
            .load(session_id)?
            .ok_or_else(|| LoomError::SessionNotFound(session_id.to_string()))?;
        let graph = self.graph_for(state.category);

        let start = match state.metadata_str(keys::LAST_NODE) {
            Some(last) => graph.next(last).map(str::to_string),
            None => Some(graph.entry().to_string()),
        };
        let Some(start) = start else {
            info!(session_id, "Session already finished, nothing to resume");
            return Ok(GraphRunResult::from_state(state));
        };

        state.max_iterations = config.max_iterations;
        info!(session_id, node = %start, iteration = state.iteration, "Resuming session");
        self.sessions.start(
            &SessionId::from_string(session_id),
            &state.request,
            state.category,
        );
        self.drive(&graph, state, Some(&start), &config, |_, _| {})
            .await
    }

    /// Drop finished sessions idle for at least `max_age` and their
    /// checkpoints, then any other checkpoint that old whose session is no
    /// longer tracked. Running and unexpired sessions keep their checkpoints.
    /// Returns the number of sessions removed.
    pub fn cleanup_sessions(&self, max_age: Duration) -> Result<usize> {
        let expired = self.sessions.cleanup(max_age);
        for id in &expired {
            self.store.delete(id)?;
        }
        let live: HashSet<String> = self
            .sessions
            .list()
            .into_iter()
            .map(|s| s.session_id.0)
            .collect();
        let stale = self.store.cleanup_except(max_age, &live)?;
        if !expired.is_empty() || stale > 0 {
            info!(sessions = expired.len(), checkpoints = stale, "Cleaned up sessions");
        }
        Ok(expired.len())
    }

    async fn run_observed<F>(
        &self,
        category: RequestCategory,
        request: &str,
        context: Payload,
        config: RunConfig,
        on_node: F,
    ) -> Result<GraphRunResult>
    where
        F: FnMut(&str, &GraphState) + Send,
    {
        let graph = self.graph_for(category);
        let session_id = config.session_id.clone().unwrap_or_default();

        let mut state = GraphState::new(
            &session_id,
            graph.category(),
            request,
            context,
            config.max_iterations,
        );
        state.set_metadata(keys::CONFIG, serde_json::to_value(&config)?);

        self.sessions.start(&session_id, request, graph.category());
        info!(session_id = %session_id, category = %graph.category(), "Session started");

        self.drive(&graph, state, None, &config, on_node).await
    }

    async fn drive<F>(
        &self,
        graph: &CompiledGraph,
        state: GraphState,
        start: Option<&str>,
        config: &RunConfig,
        mut on_node: F,
    ) -> Result<GraphRunResult>
    where
        F: FnMut(&str, &GraphState) + Send,
    {
        let session_id = state.session_id().to_string();

        let outcome = graph
            .execute(state, start, |node, state| {
                if config.checkpoint_after.iter().any(|n| n == node) {
                    self.checkpoint(state)?;
                }
                on_node(node, state);
                Ok(())
            })
            .await;

        match outcome {
            Ok(state) => {
                info!(
                    session_id = %session_id,
                    errors = state.error_count,
                    iterations = state.iteration,
                    "Session completed"
                );
                self.sessions
                    .complete(&session_id, state.final_response.clone());
                Ok(GraphRunResult::from_state(state))
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Session failed");
                self.sessions.fail(&session_id, &e.to_string());
                Err(e)
            }
        }
    }
}

fn category_chain(category: RequestCategory, worker: Arc<dyn GraphNode>) -> Result<CompiledGraph> {
    let respond = RespondNode::new(worker.name());
    CompiledGraph::chain(
        category,
        vec![Arc::new(IntakeNode), worker, Arc::new(respond)],
    )
}
