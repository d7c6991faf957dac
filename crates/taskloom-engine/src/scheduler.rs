//! Dependency-graph workflow scheduler.
//!
//! A workflow is validated with [`DependencyGraphBuilder`], then driven by a
//! single control loop per workflow: ready tasks are dispatched (highest
//! priority first, declaration order breaking ties) as tokio tasks up to the
//! workflow's parallelism cap, and the loop waits on whichever comes first:
//! a dispatch completing, the workflow deadline, or a cancel request.
//!
//! Failure policy is fail-fast: once a task exhausts its retry budget the whole
//! workflow aborts, even if unrelated branches could still finish. Neither a
//! timeout nor an abort interrupts dispatches already in flight; they run to
//! completion detached from the workflow.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskloom_core::error::{LoomError, Result};
use taskloom_core::event::EventBus;
use taskloom_core::types::{Payload, WorkflowEvent};
use taskloom_core::workflow::{
    ExecutionMetrics, ExecutionResult, Priority, Task, TaskStatus, WorkflowDefinition,
    WorkflowState, WorkflowStatus,
};

use crate::dependency::{DependencyGraph, DependencyGraphBuilder};
use crate::registry::ProcessorRegistry;

/// Registered workflow: its definition (task state mutates during execution),
/// its pollable status, and its cancel signal.
struct WorkflowEntry {
    definition: Mutex<WorkflowDefinition>,
    status: Mutex<WorkflowStatus>,
    cancel: CancellationToken,
}

impl WorkflowEntry {
    fn with_status<R>(&self, f: impl FnOnce(&mut WorkflowStatus) -> R) -> R {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status)
    }

    fn with_task<R>(&self, index: usize, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut def = self.definition.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut def.tasks[index])
    }
}

/// Immutable per-task facts the control loop needs without taking locks.
struct TaskPlan {
    id: String,
    agent_type: String,
    payload: Payload,
    priority: Priority,
    timeout: Duration,
    retries_left: u32,
    attempts: u32,
}

/// A finished dispatch, reported back to the control loop.
struct Completion {
    index: usize,
    elapsed: Duration,
    outcome: Result<Payload>,
}

/// Executes workflows of dependent tasks against registered processors.
pub struct WorkflowScheduler {
    registry: Arc<ProcessorRegistry>,
    workflows: RwLock<HashMap<String, Arc<WorkflowEntry>>>,
    event_bus: Option<Arc<EventBus>>,
}

impl WorkflowScheduler {
    pub fn new(registry: Arc<ProcessorRegistry>) -> Self {
        Self {
            registry,
            workflows: RwLock::new(HashMap::new()),
            event_bus: None,
        }
    }

    /// Publish lifecycle events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    /// Register a workflow. Nothing runs until [`execute`](Self::execute).
    pub fn create(&self, definition: WorkflowDefinition) -> Result<String> {
        if definition.max_parallel == 0 {
            return Err(LoomError::InvalidWorkflow(
                "max_parallel must be at least 1".into(),
            ));
        }

        let id = definition.id.clone();
        let mut workflows = self.workflows.write().unwrap_or_else(|e| e.into_inner());
        if workflows.contains_key(&id) {
            return Err(LoomError::InvalidWorkflow(format!(
                "workflow '{}' already exists",
                id
            )));
        }

        let status = WorkflowStatus::created(definition.tasks.len());
        workflows.insert(
            id.clone(),
            Arc::new(WorkflowEntry {
                definition: Mutex::new(definition),
                status: Mutex::new(status),
                cancel: CancellationToken::new(),
            }),
        );

        debug!(workflow_id = %id, "Workflow created");
        Ok(id)
    }

    /// Create and execute in one step.
    pub async fn run(&self, definition: WorkflowDefinition) -> Result<ExecutionResult> {
        let id = self.create(definition)?;
        self.execute(&id).await
    }

    /// Point-in-time snapshot of a workflow's status.
    pub fn status(&self, workflow_id: &str) -> Result<WorkflowStatus> {
        Ok(self.entry(workflow_id)?.with_status(|s| s.clone()))
    }

    /// Snapshot of a workflow's tasks, including their live status.
    pub fn tasks(&self, workflow_id: &str) -> Result<Vec<Task>> {
        let entry = self.entry(workflow_id)?;
        let def = entry.definition.lock().unwrap_or_else(|e| e.into_inner());
        Ok(def.tasks.clone())
    }

    /// All registered workflows with their status, sorted by id.
    pub fn list(&self) -> Vec<(String, WorkflowStatus)> {
        let workflows = self.workflows.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<(String, WorkflowStatus)> = workflows
            .iter()
            .map(|(id, entry)| (id.clone(), entry.with_status(|s| s.clone())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Request cancellation of a running workflow.
    ///
    /// Takes effect at the control loop's next scheduling boundary; tasks
    /// already dispatched are not interrupted. Returns false if the workflow
    /// is unknown or not running.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let Ok(entry) = self.entry(workflow_id) else {
            return false;
        };

        let cancelled = entry.with_status(|s| {
            if s.state != WorkflowState::Running {
                return false;
            }
            s.state = WorkflowState::Cancelled;
            s.ended_at = Some(Utc::now());
            true
        });

        if cancelled {
            entry.cancel.cancel();
            info!(workflow_id, "Workflow cancelled");
            self.publish(WorkflowEvent::WorkflowCancelled {
                workflow_id: workflow_id.to_string(),
            });
        }
        cancelled
    }

    /// Remove terminal workflows that ended at least `older_than` ago.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut workflows = self.workflows.write().unwrap_or_else(|e| e.into_inner());
        let before = workflows.len();
        workflows.retain(|_, entry| {
            entry.with_status(|s| {
                let expired = s.ended_at.map(|end| end <= cutoff).unwrap_or(false);
                !(s.state.is_terminal() && expired)
            })
        });
        let removed = before - workflows.len();
        if removed > 0 {
            info!(removed, "Cleaned up finished workflows");
        }
        removed
    }

    /// Run a created workflow to completion.
    ///
    /// Validation errors are reported before any task runs. Afterwards the
    /// first permanently failed task, the workflow timeout, or a cancel
    /// request ends the run with an error.
    pub async fn execute(&self, workflow_id: &str) -> Result<ExecutionResult> {
        let entry = self.entry(workflow_id)?;

        // Claim the workflow under one lock so concurrent callers cannot both
        // drive it.
        let claimed = entry.with_status(|s| {
            if s.state != WorkflowState::Created {
                return Err(s.state);
            }
            s.state = WorkflowState::Running;
            s.started_at = Some(Utc::now());
            Ok(())
        });
        if let Err(state) = claimed {
            return Err(LoomError::InvalidWorkflow(format!(
                "workflow '{}' is {} and cannot be executed",
                workflow_id, state
            )));
        }

        let definition = {
            let def = entry.definition.lock().unwrap_or_else(|e| e.into_inner());
            def.clone()
        };

        let graph = match DependencyGraphBuilder::build(&definition.tasks) {
            Ok(graph) => graph,
            Err(e) => {
                error!(workflow_id, error = %e, "Workflow validation failed");
                self.finish_failed(&entry, workflow_id, &e);
                return Err(e);
            }
        };

        info!(
            workflow_id,
            name = %definition.name,
            tasks = definition.tasks.len(),
            max_parallel = definition.max_parallel,
            "Workflow started"
        );
        self.publish(WorkflowEvent::WorkflowStarted {
            workflow_id: workflow_id.to_string(),
            total_tasks: definition.tasks.len(),
        });

        let start = Instant::now();
        match self.drive(&entry, &definition, &graph).await {
            Ok(task_elapsed) => self.finish_completed(&entry, &definition, start, task_elapsed),
            Err(LoomError::WorkflowCancelled(id)) => {
                warn!(workflow_id = %id, "Workflow stopped after cancel request");
                abandon_in_flight(&entry);
                Err(LoomError::WorkflowCancelled(id))
            }
            Err(e) => {
                error!(workflow_id, error = %e, "Workflow failed");
                self.finish_failed(&entry, workflow_id, &e);
                Err(e)
            }
        }
    }

    /// The control loop. Returns per-task elapsed times once every task completed.
    async fn drive(
        &self,
        entry: &WorkflowEntry,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
    ) -> Result<HashMap<String, Duration>> {
        let workflow_id = definition.id.as_str();
        let mut plans: Vec<TaskPlan> = definition
            .tasks
            .iter()
            .map(|t| TaskPlan {
                id: t.id.clone(),
                agent_type: t.agent_type.clone(),
                payload: t.payload.clone(),
                priority: t.priority,
                timeout: Duration::from_secs(t.timeout_secs),
                retries_left: t.retries,
                attempts: t.attempts,
            })
            .collect();

        let deadline = deadline_after(definition.timeout_secs);
        let mut completed: HashSet<String> = HashSet::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut retry_front: VecDeque<usize> = VecDeque::new();
        let mut task_elapsed: HashMap<String, Duration> = HashMap::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Completion>> =
            FuturesUnordered::new();

        loop {
            if entry.cancel.is_cancelled() {
                return Err(LoomError::WorkflowCancelled(workflow_id.to_string()));
            }
            if completed.len() == plans.len() {
                return Ok(task_elapsed);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(self.timeout_error(definition));
            }

            let ready = ready_order(&plans, graph, &completed, &running, &retry_front);
            for index in ready {
                if running.len() >= definition.max_parallel {
                    break;
                }
                retry_front.retain(|i| *i != index);
                let dispatch = self.dispatch(entry, workflow_id, index, &mut plans[index])?;
                running.insert(plans[index].id.clone());
                in_flight.push(dispatch);
            }

            if in_flight.is_empty() {
                // Validation rules out cycles and dangling references, so an
                // idle loop with unfinished tasks means the model is broken.
                return Err(LoomError::InvalidWorkflow(format!(
                    "workflow '{}' has no runnable tasks",
                    workflow_id
                )));
            }

            tokio::select! {
                biased;
                _ = entry.cancel.cancelled() => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.timeout_error(definition));
                }
                Some(done) = in_flight.next() => {
                    let plan = &mut plans[done.index];
                    running.remove(&plan.id);
                    match done.outcome {
                        Ok(output) => {
                            self.record_success(entry, workflow_id, done.index, plan, output, done.elapsed);
                            completed.insert(plan.id.clone());
                            task_elapsed.insert(plan.id.clone(), done.elapsed);
                        }
                        Err(e) => {
                            self.record_failure(entry, workflow_id, done.index, plan, e)?;
                            retry_front.push_front(done.index);
                        }
                    }
                }
            }
        }
    }

    /// Mark a task running and spawn its processor call.
    fn dispatch(
        &self,
        entry: &WorkflowEntry,
        workflow_id: &str,
        index: usize,
        plan: &mut TaskPlan,
    ) -> Result<BoxFuture<'static, Completion>> {
        let processor = match self.registry.get(&plan.agent_type) {
            Some(p) => p,
            None => {
                let err = LoomError::UnknownAgentType(plan.agent_type.clone());
                error!(workflow_id, task_id = %plan.id, agent_type = %plan.agent_type, "No processor for task");
                entry.with_task(index, |t| {
                    t.status = TaskStatus::Failed;
                    t.error = Some(err.to_string());
                    t.ended_at = Some(Utc::now());
                });
                entry.with_status(|s| s.failed_tasks += 1);
                self.publish(WorkflowEvent::TaskFailed {
                    workflow_id: workflow_id.to_string(),
                    task_id: plan.id.clone(),
                    error: err.to_string(),
                });
                return Err(err);
            }
        };

        plan.attempts += 1;
        let attempt = plan.attempts;
        entry.with_task(index, |t| {
            t.status = TaskStatus::Running;
            t.attempts = attempt;
            t.started_at = Some(Utc::now());
            t.ended_at = None;
        });
        entry.with_status(|s| s.running_tasks += 1);

        debug!(workflow_id, task_id = %plan.id, agent_type = %plan.agent_type, attempt, "Dispatching task");
        self.publish(WorkflowEvent::TaskStarted {
            workflow_id: workflow_id.to_string(),
            task_id: plan.id.clone(),
            attempt,
        });

        let payload = plan.payload.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move { processor.execute(payload).await });

        Ok(async move {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(LoomError::Processor(format!("processor task aborted: {}", e))),
            };
            Completion {
                index,
                elapsed: started.elapsed(),
                outcome,
            }
        }
        .boxed())
    }

    fn record_success(
        &self,
        entry: &WorkflowEntry,
        workflow_id: &str,
        index: usize,
        plan: &TaskPlan,
        output: Payload,
        elapsed: Duration,
    ) {
        let value = serde_json::Value::Object(output.into_iter().collect());
        let elapsed_ms = elapsed.as_millis() as u64;

        entry.with_task(index, |t| {
            t.status = TaskStatus::Completed;
            t.result = Some(value.clone());
            t.error = None;
            t.ended_at = Some(Utc::now());
        });
        entry.with_status(|s| {
            s.running_tasks = s.running_tasks.saturating_sub(1);
            s.completed_tasks += 1;
            s.progress = progress(s.completed_tasks, s.total_tasks);
            s.results.insert(plan.id.clone(), value);
        });

        if elapsed > plan.timeout {
            warn!(
                workflow_id,
                task_id = %plan.id,
                elapsed_ms,
                timeout_secs = plan.timeout.as_secs(),
                "Task finished after its timeout"
            );
        }
        debug!(workflow_id, task_id = %plan.id, elapsed_ms, "Task completed");
        self.publish(WorkflowEvent::TaskCompleted {
            workflow_id: workflow_id.to_string(),
            task_id: plan.id.clone(),
            elapsed_ms,
        });
    }

    /// Spend one retry or fail the workflow.
    fn record_failure(
        &self,
        entry: &WorkflowEntry,
        workflow_id: &str,
        index: usize,
        plan: &mut TaskPlan,
        err: LoomError,
    ) -> Result<()> {
        let message = err.to_string();
        entry.with_status(|s| {
            s.running_tasks = s.running_tasks.saturating_sub(1);
            s.errors
                .push(format!("{} (attempt {}): {}", plan.id, plan.attempts, message));
        });

        if plan.retries_left > 0 && err.is_retryable() {
            plan.retries_left -= 1;
            let remaining = plan.retries_left;
            entry.with_task(index, |t| {
                t.status = TaskStatus::Retrying;
                t.retries = remaining;
                t.error = Some(message.clone());
                t.ended_at = Some(Utc::now());
            });
            warn!(workflow_id, task_id = %plan.id, remaining_retries = remaining, error = %message, "Task failed, retrying");
            self.publish(WorkflowEvent::TaskRetrying {
                workflow_id: workflow_id.to_string(),
                task_id: plan.id.clone(),
                remaining_retries: remaining,
                error: message,
            });
            return Ok(());
        }

        entry.with_task(index, |t| {
            t.status = TaskStatus::Failed;
            t.error = Some(message.clone());
            t.ended_at = Some(Utc::now());
        });
        entry.with_status(|s| s.failed_tasks += 1);
        error!(workflow_id, task_id = %plan.id, attempts = plan.attempts, error = %message, "Task failed permanently");
        self.publish(WorkflowEvent::TaskFailed {
            workflow_id: workflow_id.to_string(),
            task_id: plan.id.clone(),
            error: message.clone(),
        });

        Err(LoomError::TaskExecution {
            task_id: plan.id.clone(),
            attempts: plan.attempts,
            message,
        })
    }

    fn finish_completed(
        &self,
        entry: &WorkflowEntry,
        definition: &WorkflowDefinition,
        start: Instant,
        task_elapsed: HashMap<String, Duration>,
    ) -> Result<ExecutionResult> {
        let elapsed = start.elapsed();
        let (results, completed_tasks) = {
            let mut status = entry.status.lock().unwrap_or_else(|e| e.into_inner());
            // A cancel that raced the last completion wins.
            if status.state == WorkflowState::Cancelled {
                return Err(LoomError::WorkflowCancelled(definition.id.clone()));
            }
            status.state = WorkflowState::Completed;
            status.progress = 1.0;
            status.running_tasks = 0;
            status.ended_at = Some(Utc::now());
            (status.results.clone(), status.completed_tasks)
        };

        let metrics = compute_metrics(definition.tasks.len(), completed_tasks, elapsed, task_elapsed);
        info!(
            workflow_id = %definition.id,
            elapsed_ms = metrics.total_elapsed_ms,
            parallel_efficiency = metrics.parallel_efficiency,
            "Workflow completed"
        );
        self.publish(WorkflowEvent::WorkflowCompleted {
            workflow_id: definition.id.clone(),
            elapsed_ms: metrics.total_elapsed_ms,
        });

        Ok(ExecutionResult {
            workflow_id: definition.id.clone(),
            state: WorkflowState::Completed,
            results,
            metrics,
        })
    }

    fn finish_failed(&self, entry: &WorkflowEntry, workflow_id: &str, err: &LoomError) {
        abandon_in_flight(entry);
        entry.with_status(|s| {
            s.state = WorkflowState::Failed;
            s.ended_at = Some(Utc::now());
            s.errors.push(err.to_string());
        });
        self.publish(WorkflowEvent::WorkflowFailed {
            workflow_id: workflow_id.to_string(),
            error: err.to_string(),
        });
    }

    fn timeout_error(&self, definition: &WorkflowDefinition) -> LoomError {
        LoomError::WorkflowTimeout {
            workflow_id: definition.id.clone(),
            timeout_secs: definition.timeout_secs,
        }
    }

    fn entry(&self, workflow_id: &str) -> Result<Arc<WorkflowEntry>> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| LoomError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Mark dispatches still in flight as cancelled once the workflow has stopped
/// waiting for them. The detached processor calls keep running.
fn abandon_in_flight(entry: &WorkflowEntry) {
    let abandoned = {
        let mut def = entry.definition.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut count = 0;
        for task in def.tasks.iter_mut().filter(|t| t.status == TaskStatus::Running) {
            task.status = TaskStatus::Cancelled;
            task.ended_at = Some(now);
            count += 1;
        }
        count
    };
    entry.with_status(|s| s.running_tasks = 0);
    if abandoned > 0 {
        debug!(abandoned, "Left in-flight tasks running detached");
    }
}

/// Dispatch order for this round: retried tasks first (most recent failure
/// first), then the remaining ready tasks by priority, ties by declaration order.
fn ready_order(
    plans: &[TaskPlan],
    graph: &DependencyGraph,
    completed: &HashSet<String>,
    running: &HashSet<String>,
    retry_front: &VecDeque<usize>,
) -> Vec<usize> {
    let mut fresh: Vec<usize> = plans
        .iter()
        .enumerate()
        .filter(|(i, p)| {
            !completed.contains(&p.id)
                && !running.contains(&p.id)
                && !retry_front.contains(i)
                && graph.is_ready(&p.id, completed)
        })
        .map(|(i, _)| i)
        .collect();
    fresh.sort_by(|a, b| plans[*b].priority.cmp(&plans[*a].priority).then(a.cmp(b)));

    retry_front.iter().copied().chain(fresh).collect()
}

/// Wall-clock deadline `timeout_secs` from now, clamped to a century so
/// "no limit" values like `u64::MAX` stay representable.
fn deadline_after(timeout_secs: u64) -> tokio::time::Instant {
    const CENTURY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
    tokio::time::Instant::now() + Duration::from_secs(timeout_secs).min(CENTURY)
}

fn progress(completed: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        completed as f64 / total as f64
    }
}

fn compute_metrics(
    total: usize,
    completed: usize,
    elapsed: Duration,
    task_elapsed: HashMap<String, Duration>,
) -> ExecutionMetrics {
    let busy: f64 = task_elapsed.values().map(Duration::as_secs_f64).sum();
    let wall = elapsed.as_secs_f64();
    ExecutionMetrics {
        total_elapsed_ms: elapsed.as_millis() as u64,
        tasks_total: total,
        tasks_completed: completed,
        success_ratio: progress(completed, total),
        parallel_efficiency: if wall > 0.0 { busy / wall } else { 0.0 },
        task_elapsed_ms: task_elapsed
            .into_iter()
            .map(|(id, d)| (id, d.as_millis() as u64))
            .collect(),
    }
}
