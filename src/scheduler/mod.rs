//! Dependency-aware parallel execution of implementation plans.
//!
//! A plan is grouped into priority layers (`layers`), each layer is checked
//! for write conflicts (`conflicts`) and then executed with bounded
//! concurrency behind a barrier (`executor`). Per-run state such as the
//! skill activation cache lives in an `ExecutionContext`.

pub mod conflicts;
pub mod context;
pub mod executor;
pub mod layers;

pub use conflicts::{detect_conflicts, FileConflict};
pub use context::ExecutionContext;
pub use executor::{
    should_parallelize, ExecutionMode, LayerReport, LayerStatus, ParallelScheduler, PlanOutcome,
    SchedulerConfig, SchedulerEvent, StepError, StepOutput, StepResult, StepRunner, StepStatus,
};
pub use layers::{group_steps_by_layer, layer_priority, Layer, LayerPriority};
