//! Board tests: WIP limits, workflow policies and story dispatch.

use std::sync::Arc;
use std::time::Duration;

use agentflow::core::{AgentRole, ProjectId};
use agentflow::kanban::columns::{ANALYSIS, BACKLOG, DONE, IN_PROGRESS};
use agentflow::kanban::{AdmissionController, KanbanBoard, WipLimit, WorkItem, WorkflowPolicy};

use crate::fixtures::{wait_until, Harness};

fn board_with_items(project: ProjectId, count: usize) -> (Arc<KanbanBoard>, Vec<agentflow::kanban::WorkItemId>) {
    let board = Arc::new(KanbanBoard::new(Arc::new(AdmissionController::new())));
    let ids = (0..count)
        .map(|i| board.add_item(WorkItem::new(project, &format!("story {}", i), BACKLOG)))
        .collect();
    (board, ids)
}

/// Test: Hard WIP limit holds under concurrent requests
/// Given a hard limit of 3 on InProgress and ten backlog stories
/// When all ten are moved to InProgress at once
/// Then exactly three moves are admitted and the rest cite the limit
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hard_limit_concurrent_moves() {
    let project = ProjectId::new();
    let (board, ids) = board_with_items(project, 10);
    board
        .controller()
        .set_wip_limit(WipLimit::hard(project, IN_PROGRESS, 3));

    let mut moves = Vec::new();
    for id in ids {
        let board = board.clone();
        moves.push(tokio::spawn(async move {
            board.move_item(&id, IN_PROGRESS, None).await.unwrap()
        }));
    }
    let mut decisions = Vec::new();
    for handle in moves {
        decisions.push(handle.await.unwrap());
    }

    assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 3);
    for rejected in decisions.iter().filter(|d| !d.allowed) {
        assert_eq!(
            rejected.reason.as_deref(),
            Some("WIP limit reached for InProgress (3/3)")
        );
    }
    assert_eq!(board.items_in(&project, IN_PROGRESS).len(), 3);
    assert_eq!(
        board.controller().counters().occupancy(&project, IN_PROGRESS),
        3
    );
}

/// Test: Soft WIP limit warns but admits
/// Given a soft limit of 3 on InProgress with three stories already there
/// When a fourth story is moved in
/// Then the move is admitted with a warning
#[tokio::test]
async fn test_soft_limit_warns() {
    let project = ProjectId::new();
    let (board, ids) = board_with_items(project, 4);
    board
        .controller()
        .set_wip_limit(WipLimit::soft(project, IN_PROGRESS, 3));

    for id in &ids[..3] {
        let decision = board.move_item(id, IN_PROGRESS, None).await.unwrap();
        assert!(decision.allowed && !decision.is_warning());
    }
    let decision = board.move_item(&ids[3], IN_PROGRESS, None).await.unwrap();
    assert!(decision.is_warning());
    assert_eq!(
        decision.reason.as_deref(),
        Some("WIP soft limit exceeded for InProgress (4/3)")
    );
    assert_eq!(board.items_in(&project, IN_PROGRESS).len(), 4);
}

/// Test: Leaving a column frees capacity
/// Given a hard limit of 1 on InProgress held by one story
/// When that story moves to Done
/// Then the next story is admitted
#[tokio::test]
async fn test_capacity_released_on_exit() {
    let project = ProjectId::new();
    let (board, ids) = board_with_items(project, 2);
    board
        .controller()
        .set_wip_limit(WipLimit::hard(project, IN_PROGRESS, 1));

    assert!(board.move_item(&ids[0], IN_PROGRESS, None).await.unwrap().allowed);
    assert!(!board.move_item(&ids[1], IN_PROGRESS, None).await.unwrap().allowed);
    assert!(board.move_item(&ids[0], DONE, None).await.unwrap().allowed);
    assert!(board.move_item(&ids[1], IN_PROGRESS, None).await.unwrap().allowed);
}

/// Test: Policies gate transitions before WIP is counted
/// Given a Backlog -> InProgress policy requiring an assignee and no open blockers
/// When an unassigned, then a blocked, then a ready story is moved
/// Then only the ready story is admitted and occupancy counts it alone
#[tokio::test]
async fn test_policy_gates_transition() {
    let harness = Harness::new();
    let developer = harness.agent(AgentRole::Developer).await;
    let project = harness.project;
    let (board, ids) = board_with_items(project, 1);
    board.controller().set_policy(
        WorkflowPolicy::new(project, BACKLOG, IN_PROGRESS)
            .require_assignee()
            .require_no_blockers(),
    );

    let rejected = board.move_item(&ids[0], IN_PROGRESS, None).await.unwrap();
    assert!(!rejected.allowed);
    assert_eq!(
        rejected.reason.as_deref(),
        Some("transition Backlog -> InProgress requires an assignee")
    );

    let blocker = board.add_item(WorkItem::new(project, "schema", ANALYSIS));
    board.assign(&ids[0], developer).unwrap();
    board.add_blocker(&ids[0], blocker).unwrap();
    let blocked = board.move_item(&ids[0], IN_PROGRESS, None).await.unwrap();
    assert_eq!(
        blocked.reason.as_deref(),
        Some("transition Backlog -> InProgress blocked by 1 open item(s)")
    );

    assert!(board.move_item(&blocker, DONE, None).await.unwrap().allowed);
    assert!(board.move_item(&ids[0], IN_PROGRESS, None).await.unwrap().allowed);
    assert_eq!(
        board.controller().counters().occupancy(&project, IN_PROGRESS),
        1
    );
}

/// Test: An admitted move dispatches work to the column's role
/// Given a board publishing to the broker, a running router and an assigned developer
/// When the story is moved to InProgress
/// Then the developer receives an implement_story task for it
#[tokio::test]
async fn test_admitted_move_routes_to_developer() {
    let harness = Harness::new();
    let developer = harness.agent(AgentRole::Developer).await;
    harness.agent(AgentRole::Tester).await;
    let router = harness
        .router()
        .spawn(Arc::new(harness.broker.clone()))
        .await
        .unwrap();

    let board = KanbanBoard::new(Arc::new(AdmissionController::new()))
        .with_broker(Arc::new(harness.broker.clone()));
    let story = board.add_item(
        WorkItem::new(harness.project, "password reset", BACKLOG).assigned_to(developer),
    );

    assert!(board.move_item(&story, IN_PROGRESS, None).await.unwrap().allowed);
    wait_until(|| async { !harness.routed_tasks().is_empty() }).await;

    let task = &harness.routed_tasks()[0];
    assert_eq!(task.agent_id, developer);
    assert_eq!(task.task_type, "implement_story");
    assert_eq!(task.context_str("work_item_id"), Some(story.to_string().as_str()));
    assert_eq!(task.context_str("title"), Some("password reset"));

    router.stop(Duration::from_secs(1)).await.unwrap();
}
