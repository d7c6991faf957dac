//! Session graphs: per-category chains of nodes that a single request flows
//! through, accumulating results in a [`GraphState`].
//!
//! Every category compiles to a linear chain. The `hybrid` graph classifies
//! which categories a request touches and runs their graphs as sub-steps.

pub mod compiled;
pub mod edge;
pub mod executor;
pub mod hybrid;
pub mod node;
pub mod state;

pub use compiled::{CompiledGraph, GraphBuilder, GraphDescription};
pub use edge::Edge;
pub use executor::{resolve_category, GraphRunResult, RunConfig, SessionGraphExecutor, StreamChunk};
pub use node::{AgentNode, GraphNode, IntakeNode, RespondNode, WorkflowNode};
pub use state::{GraphMessage, GraphState, MessageRole};
