use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskloom_core::config::AppConfig;
use taskloom_core::event::EventBus;
use taskloom_core::types::{Payload, RequestCategory, SessionId, WorkflowEvent};
use taskloom_core::workflow::WorkflowFile;

use taskloom_engine::{
    classify, resolve_category, CheckpointStore, ProcessorRegistry, RunConfig,
    SessionGraphExecutor, StreamChunk, WorkflowScheduler,
};

#[derive(Parser)]
#[command(name = "taskloom", version, about = "Dependency-aware task scheduling and session graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskloom.toml")]
    config: PathBuf,

    /// Session ID (auto-generated if not provided)
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
    },
    /// Send a request through a session graph
    Ask {
        /// Graph to use (classified from the request when omitted)
        #[arg(long)]
        category: Option<String>,
        /// Page the request originated from
        #[arg(long, default_value = "chat")]
        page: String,
        /// Extra context as a JSON object
        #[arg(long)]
        context: Option<String>,
        /// Nodes after which to checkpoint the session
        #[arg(long, value_delimiter = ',')]
        checkpoint_after: Vec<String>,
        /// Print one JSON line per completed node
        #[arg(long)]
        stream: bool,
        /// The request text (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        request: Vec<String>,
    },
    /// Show which category a request would be routed to
    Classify {
        #[arg(long, default_value = "chat")]
        page: String,
        #[arg(trailing_var_arg = true)]
        request: Vec<String>,
    },
    /// List the compiled session graphs
    Graphs,
    /// Show the nodes and edges of one graph
    Describe {
        category: String,
    },
    /// Continue a checkpointed session
    Resume {
        session: String,
    },
    /// Inspect or prune stored checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List stored checkpoints
    List,
    /// Delete checkpoints older than the session TTL
    Cleanup {
        /// Override the configured session TTL (seconds)
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("taskloom=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "taskloom", &mut io::stdout());
        return Ok(());
    }

    if let Commands::Classify { page, request } = &cli.command {
        let text = request_text(request);
        println!("{}", classify(&text, page));
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    let event_bus = Arc::new(EventBus::default());
    let registry = Arc::new(ProcessorRegistry::new());
    register_echo_processors(&registry);
    let scheduler = Arc::new(WorkflowScheduler::new(registry).with_event_bus(event_bus.clone()));

    let store = match config.checkpoint_path() {
        Some(path) => {
            info!(path = %path.display(), "Opening checkpoint store");
            Arc::new(CheckpointStore::open(&path)?)
        }
        None => Arc::new(CheckpointStore::open_in_memory()?),
    };
    let executor = Arc::new(SessionGraphExecutor::new(
        scheduler.clone(),
        store.clone(),
        config.scheduler.clone(),
    )?);

    let run_config = {
        let base = RunConfig::from_graph_config(&config.graph);
        match &cli.session {
            Some(id) => base.with_session_id(SessionId::from_string(id)),
            None => base,
        }
    };

    match cli.command {
        Commands::Run { workflow } => {
            let content = std::fs::read_to_string(&workflow)
                .with_context(|| format!("reading {}", workflow.display()))?;
            let definition = WorkflowFile::from_toml(&content)?.into_definition(&config.scheduler);

            let printer = spawn_event_printer(&event_bus);
            let outcome = scheduler.run(definition).await;
            printer.abort();

            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Ask {
            category,
            page,
            context,
            checkpoint_after,
            stream,
            request,
        } => {
            let text = request_text(&request);
            let category = match category {
                Some(name) => resolve_category(&name),
                None => classify(&text, &page),
            };
            let context: Payload = match context {
                Some(raw) => serde_json::from_str(&raw).context("--context must be a JSON object")?,
                None => Payload::new(),
            };
            let run_config = run_config.with_checkpoint_after(checkpoint_after);
            info!(category = %category, "Routing request");

            if stream {
                let mut chunks = executor.stream(category, text, context, run_config);
                while let Some(chunk) = chunks.next().await {
                    println!("{}", serde_json::to_string(&chunk)?);
                    if let StreamChunk::Error { error, .. } = &chunk {
                        anyhow::bail!("session failed: {}", error);
                    }
                }
            } else {
                let result = executor.run(category, &text, context, run_config).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
        Commands::Graphs => {
            for category in executor.available_categories() {
                let graph = executor.describe_graph(category);
                println!("{:<11} {}", category.as_str(), graph.nodes.join(" -> "));
            }
        }
        Commands::Describe { category } => {
            let category: RequestCategory = category.parse()?;
            let graph = executor.describe_graph(category);
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
        Commands::Resume { session } => {
            if config.checkpoint_path().is_none() {
                warn!("No [checkpoint] section configured; only in-memory checkpoints exist");
            }
            let result = executor.resume(&session, run_config).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Checkpoints { action } => match action {
            CheckpointAction::List => {
                let checkpoints = store.list()?;
                if checkpoints.is_empty() {
                    println!("No checkpoints.");
                }
                for cp in checkpoints {
                    println!(
                        "{}  v{}  created {}  saved {}",
                        cp.session_id,
                        cp.version,
                        cp.created_at.format("%Y-%m-%d %H:%M:%S"),
                        cp.saved_at.format("%Y-%m-%d %H:%M:%S"),
                    );
                }
            }
            CheckpointAction::Cleanup { max_age_secs } => {
                let max_age =
                    Duration::from_secs(max_age_secs.unwrap_or(config.graph.session_ttl_secs));
                let removed = store.cleanup(max_age)?;
                println!("Removed {} checkpoint(s).", removed);
            }
        },
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        // Answered before the config was loaded.
        Commands::Classify { .. } | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".taskloom").join("config.toml"));
    match home_config {
        Some(ref home) if home.exists() => {
            info!(path = %home.display(), "Loading config from home directory");
            Ok(AppConfig::load(home)?)
        }
        _ => {
            info!("No config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

/// Stand-in processors so every graph and the `echo` agent type can run
/// without external services.
fn register_echo_processors(registry: &ProcessorRegistry) {
    for category in RequestCategory::ALL {
        registry.register_fn(category.as_str(), move |payload: Payload| async move {
            let request = payload
                .get("request")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let mut out = Payload::new();
            out.insert("summary".into(), json!(format!("{} handled: {}", category, request)));
            out.insert("category".into(), json!(category));
            out.insert("input".into(), json!(payload));
            Ok(out)
        });
    }
    registry.register_fn("echo", |payload: Payload| async move { Ok(payload) });
}

fn spawn_event_printer(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                WorkflowEvent::WorkflowStarted { workflow_id, total_tasks } => {
                    eprintln!("[workflow {}] started ({} tasks)", workflow_id, total_tasks);
                }
                WorkflowEvent::TaskStarted { task_id, attempt, .. } => {
                    eprintln!("[task: {}] attempt {}", task_id, attempt);
                }
                WorkflowEvent::TaskCompleted { task_id, elapsed_ms, .. } => {
                    eprintln!("[task: {}: ok] {}ms", task_id, elapsed_ms);
                }
                WorkflowEvent::TaskRetrying { task_id, remaining_retries, error, .. } => {
                    eprintln!("[task: {}: retry, {} left] {}", task_id, remaining_retries, error);
                }
                WorkflowEvent::TaskFailed { task_id, error, .. } => {
                    eprintln!("[task: {}: ERROR] {}", task_id, error);
                }
                WorkflowEvent::WorkflowCompleted { workflow_id, elapsed_ms } => {
                    eprintln!("[workflow {}] completed in {}ms", workflow_id, elapsed_ms);
                }
                WorkflowEvent::WorkflowFailed { workflow_id, error } => {
                    eprintln!("[workflow {}] failed: {}", workflow_id, error);
                }
                WorkflowEvent::WorkflowCancelled { workflow_id } => {
                    eprintln!("[workflow {}] cancelled", workflow_id);
                }
            }
        }
    })
}

fn request_text(words: &[String]) -> String {
    let text = words.join(" ");
    if !text.is_empty() {
        return text;
    }
    io::stdin()
        .lock()
        .lines()
        .map_while(|l| l.ok())
        .collect::<Vec<_>>()
        .join("\n")
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
