use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};

/// Top-level Taskloom configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    /// Checkpoint persistence. Absent means checkpoints are kept in memory.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
}

/// Defaults applied to workflows that do not set their own limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            max_retries: 0,
        }
    }
}

fn default_max_parallel() -> usize { 4 }
fn default_workflow_timeout_secs() -> u64 { 300 }
fn default_task_timeout_secs() -> u64 { 60 }

/// Session graph execution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Maximum node visits per session run.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Sessions older than this are removed by the cleanup sweep.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

fn default_max_iterations() -> u32 { 25 }
fn default_session_ttl_secs() -> u64 { 3600 }

/// Checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Enable on-disk checkpoints (default: true when section is present).
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// SQLite database path. Default: ~/.taskloom/checkpoints.db
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

fn default_checkpoint_enabled() -> bool { true }

impl CheckpointConfig {
    /// Resolve the database path (expand ~).
    pub fn db_path(&self) -> PathBuf {
        match self.path.as_deref() {
            Some(p) => expand_home(p),
            None => dirs_home()
                .map(|h| h.join(".taskloom").join("checkpoints.db"))
                .unwrap_or_else(|| PathBuf::from("checkpoints.db")),
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LoomError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from a TOML string, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| LoomError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.max_parallel == 0 {
            return Err(LoomError::Config(
                "scheduler.max_parallel must be at least 1".into(),
            ));
        }
        if self.graph.max_iterations == 0 {
            return Err(LoomError::Config(
                "graph.max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Checkpoint database path, if on-disk checkpoints are enabled.
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.checkpoint
            .as_ref()
            .filter(|c| c.enabled)
            .map(CheckpointConfig::db_path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
