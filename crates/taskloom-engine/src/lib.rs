pub mod checkpoint;
pub mod classifier;
pub mod dependency;
pub mod graph;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use checkpoint::{Checkpoint, CheckpointInfo, CheckpointStore, CHECKPOINT_SCHEMA_VERSION};
pub use classifier::classify;
pub use dependency::{DependencyGraph, DependencyGraphBuilder};
pub use graph::{
    resolve_category, CompiledGraph, GraphRunResult, GraphState, RunConfig, SessionGraphExecutor,
    StreamChunk,
};
pub use registry::ProcessorRegistry;
pub use scheduler::WorkflowScheduler;
pub use session::{SessionInfo, SessionManager, SessionStatus};
