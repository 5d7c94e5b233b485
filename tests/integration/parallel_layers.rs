//! Scheduler tests: layered plan execution with barriers, conflicts,
//! failures and cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentflow::core::{ImplementationPlan, ImplementationStep, StepId};
use agentflow::scheduler::{
    ExecutionMode, LayerPriority, LayerStatus, ParallelScheduler, SchedulerConfig, SchedulerEvent,
    StepStatus,
};

use crate::fixtures::{execution_context, five_step_plan, FileWriteRunner};

fn scheduler(runner: &Arc<FileWriteRunner>) -> ParallelScheduler {
    ParallelScheduler::new(SchedulerConfig::default(), runner.clone())
}

/// Test: Layers run in order, steps within a layer run together
/// Given a schema step, two library steps, an API route and a page
/// When the plan is executed
/// Then each layer starts after the previous one ends and both libraries overlap
#[tokio::test]
async fn test_layer_barriers_and_parallel_libraries() {
    let runner = Arc::new(FileWriteRunner::with_delay(Duration::from_millis(30)));
    let outcome = scheduler(&runner)
        .execute(&five_step_plan(), execution_context())
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.mode, ExecutionMode::Parallel);
    let priorities: Vec<LayerPriority> = outcome.layers.iter().map(|l| l.priority).collect();
    assert_eq!(
        priorities,
        vec![
            LayerPriority::SCHEMA,
            LayerPriority::SHARED_LIBRARY,
            LayerPriority::API,
            LayerPriority::PAGE,
        ]
    );

    let schema_end = runner.position("end:schema");
    let auth_start = runner.position("start:lib-auth");
    let email_start = runner.position("start:lib-email");
    let auth_end = runner.position("end:lib-auth");
    let email_end = runner.position("end:lib-email");
    assert!(schema_end < auth_start && schema_end < email_start);
    assert!(auth_start < email_end && email_start < auth_end);
    assert!(auth_end.max(email_end) < runner.position("start:api-users"));
    assert!(runner.position("end:api-users") < runner.position("start:page-users"));
    assert_eq!(runner.max_active(), 2);

    assert_eq!(outcome.files_modified.len(), 5);
    assert!(outcome.files_modified.contains("src/app/users/page.tsx"));
}

/// Test: Steps writing the same file never overlap
/// Given a library layer where two steps target one file
/// When the plan is executed
/// Then the layer runs sequentially, reports the conflict and no write races
#[tokio::test]
async fn test_conflicting_layer_runs_sequentially() {
    let plan = ImplementationPlan::new(vec![
        ImplementationStep::new("auth-session", 1, "src/lib/auth.ts"),
        ImplementationStep::new("auth-tokens", 2, "src/lib/auth.ts"),
        ImplementationStep::new("email", 3, "src/lib/email.ts"),
        ImplementationStep::new("cache", 4, "src/lib/cache.ts"),
    ]);
    let runner = Arc::new(FileWriteRunner::with_delay(Duration::from_millis(20)));
    let outcome = scheduler(&runner)
        .execute(&plan, execution_context())
        .await
        .unwrap();

    assert_eq!(runner.races(), 0);
    assert_eq!(runner.max_active(), 1);
    assert_eq!(outcome.layers.len(), 1);

    let layer = &outcome.layers[0];
    assert_eq!(layer.mode, ExecutionMode::Sequential);
    assert_eq!(layer.conflicts.len(), 1);
    assert_eq!(layer.conflicts[0].path, "src/lib/auth.ts");
    assert_eq!(
        layer.conflicts[0].steps,
        vec![StepId::from("auth-session"), StepId::from("auth-tokens")]
    );
    assert!(runner.position("end:auth-session") < runner.position("start:auth-tokens"));
    assert_eq!(outcome.files_modified.len(), 3);
}

/// Test: A failed step is reported without stopping its siblings
/// Given a plan whose email library step fails
/// When the plan is executed with the default configuration
/// Then every other step runs and the error names the failed step and file
#[tokio::test]
async fn test_failed_step_reported() {
    let runner = Arc::new(FileWriteRunner::default().failing("lib-email"));
    let outcome = scheduler(&runner)
        .execute(&five_step_plan(), execution_context())
        .await
        .unwrap();

    assert!(!outcome.is_success());
    assert_eq!(outcome.errors.len(), 1);
    let error = &outcome.errors[0];
    assert_eq!(error.step_id, StepId::from("lib-email"));
    assert_eq!(error.file_path, "src/lib/email.ts");
    assert!(error.message.contains("could not write src/lib/email.ts"));

    let expected: Vec<&str> = vec![
        "prisma/schema.prisma",
        "src/app/api/users/route.ts",
        "src/app/users/page.tsx",
        "src/lib/auth.ts",
    ];
    assert_eq!(
        outcome.files_modified.iter().map(String::as_str).collect::<Vec<_>>(),
        expected
    );
    assert!(outcome
        .result(&StepId::from("page-users"))
        .unwrap()
        .is_success());
}

/// Test: Later layers are skipped after a failure when configured to stop
/// Given a plan whose schema step fails and stop_on_failure set
/// When the plan is executed
/// Then no later step runs and their layers are reported as skipped
#[tokio::test]
async fn test_stop_on_failure_skips_later_layers() {
    let runner = Arc::new(FileWriteRunner::default().failing("schema"));
    let outcome = ParallelScheduler::new(
        SchedulerConfig::default().with_stop_on_failure(true),
        runner.clone(),
    )
    .execute(&five_step_plan(), execution_context())
    .await
    .unwrap();

    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.files_modified.is_empty());
    assert!(outcome.layers[1..]
        .iter()
        .all(|l| l.status == LayerStatus::Skipped));
    assert_eq!(
        outcome.result(&StepId::from("lib-auth")).unwrap().status,
        StepStatus::Skipped
    );
    assert!(!outcome.cancelled);
}

/// Test: Cancellation stops the plan at the current layer
/// Given slow steps and an external cancellation token
/// When the token is cancelled while the schema step is running
/// Then the plan reports cancellation and no step completes
#[tokio::test]
async fn test_cancellation_mid_plan() {
    let runner = Arc::new(FileWriteRunner::with_delay(Duration::from_millis(500)));
    let cancel = CancellationToken::new();
    let scheduler = scheduler(&runner).with_cancellation(cancel.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        scheduler.execute(&five_step_plan(), execution_context()),
    )
    .await
    .expect("plan stopped promptly")
    .unwrap();
    trigger.await.unwrap();

    assert!(outcome.cancelled);
    assert!(outcome.files_modified.is_empty());
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.results.len(), 5);
    assert!(outcome
        .results
        .iter()
        .all(|r| r.status == StepStatus::Cancelled));
    assert!(outcome.layers.iter().all(|l| l.status == LayerStatus::Cancelled));
}

/// Test: Small plans run sequentially
/// Given a plan with two independent library steps
/// When the plan is executed with the default minimum of four steps
/// Then the plan and its layer run sequentially
#[tokio::test]
async fn test_small_plan_runs_sequentially() {
    let plan = ImplementationPlan::new(vec![
        ImplementationStep::new("auth", 1, "src/lib/auth.ts"),
        ImplementationStep::new("email", 2, "src/lib/email.ts"),
    ]);
    let runner = Arc::new(FileWriteRunner::with_delay(Duration::from_millis(10)));
    let outcome = scheduler(&runner)
        .execute(&plan, execution_context())
        .await
        .unwrap();

    assert_eq!(outcome.mode, ExecutionMode::Sequential);
    assert_eq!(outcome.layers[0].mode, ExecutionMode::Sequential);
    assert_eq!(runner.max_active(), 1);
    assert!(runner.position("end:auth") < runner.position("start:email"));
}

/// Test: Progress events bracket the run
/// Given an event channel attached to the scheduler
/// When the five-step plan is executed
/// Then one start and one finish event is sent per layer and step, then the plan summary
#[tokio::test]
async fn test_progress_events() {
    let (tx, mut rx) = mpsc::channel(64);
    let runner = Arc::new(FileWriteRunner::default());
    let outcome = scheduler(&runner)
        .with_events(tx)
        .execute(&five_step_plan(), execution_context())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert_eq!(
        events.first(),
        Some(&SchedulerEvent::LayerStarted {
            priority: LayerPriority::SCHEMA,
            mode: ExecutionMode::Sequential,
            steps: 1,
        })
    );
    assert_eq!(
        events.last(),
        Some(&SchedulerEvent::PlanFinished {
            files_modified: outcome.files_modified.len(),
            errors: 0,
            cancelled: false,
        })
    );
    let count = |f: fn(&SchedulerEvent) -> bool| events.iter().filter(|e| f(e)).count();
    assert_eq!(count(|e| matches!(e, SchedulerEvent::StepStarted { .. })), 5);
    assert_eq!(
        count(|e| matches!(e, SchedulerEvent::StepFinished { success: true, .. })),
        5
    );
    assert_eq!(count(|e| matches!(e, SchedulerEvent::LayerFinished { .. })), 4);
}
