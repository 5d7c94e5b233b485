//! Layered plan execution with bounded concurrency.
//!
//! Layers run strictly one after another. Inside a layer, steps run
//! concurrently under a semaphore unless two of them write the same file,
//! in which case the whole layer runs sequentially. A failing or panicking
//! step only fails itself.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflicts::{detect_conflicts, FileConflict};
use super::context::ExecutionContext;
use super::layers::{group_steps_by_layer, Layer, LayerPriority};
use crate::actor::panic_message;
use crate::core::{ImplementationPlan, ImplementationStep, StepId};
use crate::Result;

/// Default number of steps running at once within a layer.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default plan size below which everything runs sequentially.
pub const DEFAULT_MIN_PARALLEL_STEPS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub min_parallel_steps: usize,
    /// Skip the remaining layers once a layer has a failed step.
    pub stop_on_failure: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            min_parallel_steps: DEFAULT_MIN_PARALLEL_STEPS,
            stop_on_failure: false,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_min_parallel_steps(mut self, min: usize) -> Self {
        self.min_parallel_steps = min;
        self
    }

    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }
}

/// What a successful step reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    pub files_modified: Vec<String>,
    pub summary: Option<String>,
}

/// Executes a single step. Implementors typically call a model with the
/// step's skill instructions and write the resulting file.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(&self, step: &ImplementationStep, ctx: &ExecutionContext)
        -> Result<StepOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StepStatus {
    Succeeded { files_modified: Vec<String> },
    Failed { error: String },
    /// Interrupted, or never started because the plan was cancelled.
    Cancelled,
    /// Not started because an earlier layer failed under `stop_on_failure`.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub file_path: String,
    pub layer: LayerPriority,
    pub status: StepStatus,
    pub duration_ms: u64,
}

impl StepResult {
    fn not_run(step: &ImplementationStep, layer: LayerPriority, status: StepStatus) -> Self {
        Self {
            step_id: step.id.clone(),
            file_path: step.file_path.clone(),
            layer,
            status,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, StepStatus::Succeeded { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            StepStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Sequential => write!(f, "sequential"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    Completed,
    Cancelled,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub priority: LayerPriority,
    pub mode: ExecutionMode,
    pub steps: Vec<StepId>,
    pub conflicts: Vec<FileConflict>,
    pub status: LayerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepError {
    pub step_id: StepId,
    pub file_path: String,
    pub message: String,
}

/// Merged result of a plan execution.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub mode: ExecutionMode,
    pub layers: Vec<LayerReport>,
    /// One entry per step, in layer order.
    pub results: Vec<StepResult>,
    /// Union of files reported by successful steps.
    pub files_modified: BTreeSet<String>,
    /// One entry per failed step.
    pub errors: Vec<StepError>,
    pub cancelled: bool,
}

impl PlanOutcome {
    fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            layers: Vec::new(),
            results: Vec::new(),
            files_modified: BTreeSet::new(),
            errors: Vec::new(),
            cancelled: false,
        }
    }

    fn absorb(&mut self, report: LayerReport, results: Vec<StepResult>) {
        for result in &results {
            match &result.status {
                StepStatus::Succeeded { files_modified } => {
                    self.files_modified.extend(files_modified.iter().cloned());
                }
                StepStatus::Failed { error } => self.errors.push(StepError {
                    step_id: result.step_id.clone(),
                    file_path: result.file_path.clone(),
                    message: error.clone(),
                }),
                StepStatus::Cancelled | StepStatus::Skipped => {}
            }
        }
        self.layers.push(report);
        self.results.extend(results);
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }

    pub fn result(&self, step_id: &StepId) -> Option<&StepResult> {
        self.results.iter().find(|r| &r.step_id == step_id)
    }
}

/// Progress notifications, sent best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    LayerStarted {
        priority: LayerPriority,
        mode: ExecutionMode,
        steps: usize,
    },
    StepStarted {
        step_id: StepId,
    },
    StepFinished {
        step_id: StepId,
        success: bool,
    },
    LayerFinished {
        priority: LayerPriority,
        status: LayerStatus,
    },
    PlanFinished {
        files_modified: usize,
        errors: usize,
        cancelled: bool,
    },
}

/// Whether a grouped plan is worth running in parallel.
///
/// Small plans and plans whose layers all hold a single step run
/// sequentially.
pub fn should_parallelize(layers: &[Layer], min_parallel_steps: usize) -> bool {
    let total: usize = layers.iter().map(Layer::len).sum();
    total >= min_parallel_steps && layers.iter().any(|l| l.len() >= 2)
}

struct LayerRun {
    results: Vec<StepResult>,
    cancelled: bool,
}

/// Runs implementation plans layer by layer.
pub struct ParallelScheduler {
    config: SchedulerConfig,
    runner: Arc<dyn StepRunner>,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl ParallelScheduler {
    pub fn new(config: SchedulerConfig, runner: Arc<dyn StepRunner>) -> Self {
        Self {
            config,
            runner,
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a plan. Errors only for an invalid plan; step failures are
    /// reported in the outcome.
    pub async fn execute(
        &self,
        plan: &ImplementationPlan,
        ctx: Arc<ExecutionContext>,
    ) -> Result<PlanOutcome> {
        let layers = group_steps_by_layer(plan)?;
        let mode = if should_parallelize(&layers, self.config.min_parallel_steps) {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        };
        info!(
            task_id = ?plan.task_id,
            steps = plan.len(),
            layers = layers.len(),
            %mode,
            "executing plan"
        );

        let mut outcome = PlanOutcome::new(mode);
        let mut halted: Option<LayerStatus> = None;

        for layer in &layers {
            let conflicts = detect_conflicts(layer);
            let layer_mode = if mode == ExecutionMode::Parallel
                && conflicts.is_empty()
                && layer.len() > 1
            {
                ExecutionMode::Parallel
            } else {
                ExecutionMode::Sequential
            };

            if halted.is_none() && self.cancel.is_cancelled() {
                outcome.cancelled = true;
                halted = Some(LayerStatus::Cancelled);
            }

            if let Some(status) = halted {
                let step_status = match status {
                    LayerStatus::Skipped => StepStatus::Skipped,
                    _ => StepStatus::Cancelled,
                };
                let results = layer
                    .steps
                    .iter()
                    .map(|s| StepResult::not_run(s, layer.priority, step_status.clone()))
                    .collect();
                outcome.absorb(report(layer, layer_mode, conflicts, status), results);
                continue;
            }

            if !conflicts.is_empty() {
                warn!(
                    layer = %layer.priority,
                    conflicts = conflicts.len(),
                    "write conflicts in layer, running sequentially"
                );
            }
            self.emit(SchedulerEvent::LayerStarted {
                priority: layer.priority,
                mode: layer_mode,
                steps: layer.len(),
            });

            let run = match layer_mode {
                ExecutionMode::Parallel => self.run_layer_parallel(layer, &ctx).await,
                ExecutionMode::Sequential => self.run_layer_sequential(layer, &ctx).await,
            };

            let status = if run.cancelled {
                LayerStatus::Cancelled
            } else {
                LayerStatus::Completed
            };
            let failed = run.results.iter().filter(|r| r.error().is_some()).count();
            debug!(layer = %layer.priority, ?status, failed, "layer finished");
            self.emit(SchedulerEvent::LayerFinished {
                priority: layer.priority,
                status,
            });
            outcome.absorb(report(layer, layer_mode, conflicts, status), run.results);

            if run.cancelled {
                warn!(layer = %layer.priority, "plan cancelled");
                outcome.cancelled = true;
                halted = Some(LayerStatus::Cancelled);
            } else if failed > 0 && self.config.stop_on_failure {
                warn!(layer = %layer.priority, failed, "stopping after failed layer");
                halted = Some(LayerStatus::Skipped);
            }
        }

        info!(
            files_modified = outcome.files_modified.len(),
            errors = outcome.errors.len(),
            cancelled = outcome.cancelled,
            "plan finished"
        );
        self.emit(SchedulerEvent::PlanFinished {
            files_modified: outcome.files_modified.len(),
            errors: outcome.errors.len(),
            cancelled: outcome.cancelled,
        });
        Ok(outcome)
    }

    /// Run every step of a layer concurrently, at most `max_concurrency` at once.
    async fn run_layer_parallel(&self, layer: &Layer, ctx: &Arc<ExecutionContext>) -> LayerRun {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut workers = JoinSet::new();

        for step in &layer.steps {
            let semaphore = Arc::clone(&semaphore);
            let runner = Arc::clone(&self.runner);
            let ctx = Arc::clone(ctx);
            let events = self.event_tx.clone();
            let step = step.clone();
            let priority = layer.priority;

            workers.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return StepResult::not_run(&step, priority, StepStatus::Cancelled),
                };
                run_guarded(runner.as_ref(), &step, &ctx, priority, events.as_ref()).await
            });
        }

        let mut results = Vec::with_capacity(layer.len());
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancelled => {
                    warn!(layer = %layer.priority, "cancelling in-flight steps");
                    workers.abort_all();
                    cancelled = true;
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(result)) => results.push(result),
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => warn!(error = %e, "step worker did not complete"),
                    None => break,
                },
            }
        }

        fill_missing(layer, &mut results, cancelled);
        LayerRun { results, cancelled }
    }

    /// Run steps one at a time in `order`.
    async fn run_layer_sequential(&self, layer: &Layer, ctx: &Arc<ExecutionContext>) -> LayerRun {
        let mut results = Vec::with_capacity(layer.len());
        let mut cancelled = false;

        for step in &layer.steps {
            if cancelled || self.cancel.is_cancelled() {
                cancelled = true;
                results.push(StepResult::not_run(step, layer.priority, StepStatus::Cancelled));
                continue;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    results.push(StepResult::not_run(step, layer.priority, StepStatus::Cancelled));
                }
                result = run_guarded(
                    self.runner.as_ref(),
                    step,
                    ctx,
                    layer.priority,
                    self.event_tx.as_ref(),
                ) => results.push(result),
            }
        }

        LayerRun { results, cancelled }
    }

    fn emit(&self, event: SchedulerEvent) {
        emit(self.event_tx.as_ref(), event);
    }
}

fn emit(tx: Option<&mpsc::Sender<SchedulerEvent>>, event: SchedulerEvent) {
    if let Some(tx) = tx {
        let _ = tx.try_send(event);
    }
}

fn report(
    layer: &Layer,
    mode: ExecutionMode,
    conflicts: Vec<FileConflict>,
    status: LayerStatus,
) -> LayerReport {
    LayerReport {
        priority: layer.priority,
        mode,
        steps: layer.steps.iter().map(|s| s.id.clone()).collect(),
        conflicts,
        status,
    }
}

/// Run one step, turning errors and panics into a failed result.
async fn run_guarded(
    runner: &dyn StepRunner,
    step: &ImplementationStep,
    ctx: &ExecutionContext,
    layer: LayerPriority,
    events: Option<&mpsc::Sender<SchedulerEvent>>,
) -> StepResult {
    emit(
        events,
        SchedulerEvent::StepStarted {
            step_id: step.id.clone(),
        },
    );
    debug!(step = %step.id, file = %step.file_path, %layer, "step started");
    let started = Instant::now();

    let status = match AssertUnwindSafe(runner.run_step(step, ctx))
        .catch_unwind()
        .await
    {
        Ok(Ok(output)) => StepStatus::Succeeded {
            files_modified: output.files_modified,
        },
        Ok(Err(e)) => StepStatus::Failed {
            error: e.to_string(),
        },
        Err(panic) => StepStatus::Failed {
            error: panic_message("step", panic.as_ref()),
        },
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match &status {
        StepStatus::Failed { error } => {
            warn!(step = %step.id, file = %step.file_path, duration_ms, %error, "step failed")
        }
        _ => debug!(step = %step.id, duration_ms, "step completed"),
    }
    emit(
        events,
        SchedulerEvent::StepFinished {
            step_id: step.id.clone(),
            success: matches!(status, StepStatus::Succeeded { .. }),
        },
    );

    StepResult {
        step_id: step.id.clone(),
        file_path: step.file_path.clone(),
        layer,
        status,
        duration_ms,
    }
}

/// Give every step of the layer exactly one result, in layer order.
fn fill_missing(layer: &Layer, results: &mut Vec<StepResult>, cancelled: bool) {
    for step in &layer.steps {
        if results.iter().any(|r| r.step_id == step.id) {
            continue;
        }
        let status = if cancelled {
            StepStatus::Cancelled
        } else {
            StepStatus::Failed {
                error: "step worker terminated unexpectedly".to_string(),
            }
        };
        results.push(StepResult::not_run(step, layer.priority, status));
    }
    results.sort_by_key(|r| layer.steps.iter().position(|s| s.id == r.step_id));
}
