use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use taskloom_core::error::{LoomError, Result};
use taskloom_core::traits::{FnProcessor, TaskProcessor};
use taskloom_core::types::Payload;

/// Registry of task processors keyed by agent type.
///
/// Shared by the scheduler and the session graph nodes. Registration happens
/// up front; during execution the map is only read.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn TaskProcessor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor. Re-registering an agent type replaces the old one.
    pub fn register(&self, agent_type: impl Into<String>, processor: Arc<dyn TaskProcessor>) {
        let agent_type = agent_type.into();
        tracing::debug!(agent_type = %agent_type, "Processor registered");
        self.processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_type, processor);
    }

    /// Register an async closure as a processor.
    pub fn register_fn<F, Fut>(&self, agent_type: impl Into<String>, f: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.register(agent_type, Arc::new(FnProcessor::new(f)));
    }

    /// Unregister a processor by agent type.
    pub fn unregister(&self, agent_type: &str) -> bool {
        self.processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_type)
            .is_some()
    }

    /// Get a processor by agent type.
    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn TaskProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_type)
            .cloned()
    }

    /// Look up a processor, failing with `UnknownAgentType`.
    pub fn require(&self, agent_type: &str) -> Result<Arc<dyn TaskProcessor>> {
        self.get(agent_type)
            .ok_or_else(|| LoomError::UnknownAgentType(agent_type.to_string()))
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(agent_type)
    }

    /// List registered agent types, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
