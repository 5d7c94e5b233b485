//! Routing tests: inbound events through the router actor to `agent-tasks`.

use std::sync::Arc;
use std::time::Duration;

use agentflow::broker::memory::partition_for;
use agentflow::broker::topics;
use agentflow::core::{AgentRole, AgentStatus, EventType, TaskPriority};
use agentflow::directory::AgentDirectory;
use agentflow::router::ROUTER_GROUP;

use crate::fixtures::{wait_until, Harness, RecordingHandler};

/// Test: User message reaches the coordinator
/// Given a coordinator and a developer in one project
/// When a user message without a target is published
/// Then exactly one task is routed, keyed by the coordinator's id
#[tokio::test]
async fn test_user_message_routed_to_coordinator() {
    let harness = Harness::new();
    let coordinator = harness.agent(AgentRole::Coordinator).await;
    harness.agent(AgentRole::Developer).await;
    let router = harness
        .router()
        .spawn(Arc::new(harness.broker.clone()))
        .await
        .unwrap();

    harness
        .publish(&harness.event(EventType::UserMessage).with_field("content", "build a login page"))
        .await;
    wait_until(|| async { !harness.routed_tasks().is_empty() }).await;

    let messages = harness.broker.messages(topics::AGENT_TASKS);
    assert_eq!(messages.len(), 1);
    let key = coordinator.to_string();
    assert_eq!(messages[0].key.as_deref(), Some(key.as_str()));
    assert_eq!(messages[0].partition, partition_for(&key, 4));

    let task = &harness.routed_tasks()[0];
    assert_eq!(task.agent_id, coordinator);
    assert_eq!(task.project_id, harness.project);
    assert_eq!(task.priority, TaskPriority::High);
    assert_eq!(task.context_str("content"), Some("build a login page"));

    router.stop(Duration::from_secs(1)).await.unwrap();
}

/// Test: Every event is consumed, routed or not
/// Given a router with the default handlers
/// When an unmatched agent response and a user message are published
/// Then only the user message yields a task and both offsets are committed
#[tokio::test]
async fn test_unmatched_events_are_committed() {
    let harness = Harness::new();
    harness.agent(AgentRole::Coordinator).await;
    let router = harness
        .router()
        .spawn(Arc::new(harness.broker.clone()))
        .await
        .unwrap();

    let plain_response = harness.event(EventType::AgentResponse).with_field("content", "ok");
    harness.publish(&plain_response).await;
    harness.publish(&harness.event(EventType::UserMessage)).await;

    let broker = harness.broker.clone();
    wait_until(|| {
        let broker = broker.clone();
        async move {
            let committed = |topic: &str| -> u64 {
                (0..4)
                    .map(|p| broker.committed_offset(ROUTER_GROUP, topic, p))
                    .sum()
            };
            committed(topics::AGENT_RESPONSES) == 1 && committed(topics::USER_MESSAGES) == 1
        }
    })
    .await;

    assert_eq!(harness.routed_tasks().len(), 1);
    router.stop(Duration::from_secs(1)).await.unwrap();
}

/// Test: Analyst hands work to a developer
/// Given an analyst and a developer
/// When the analyst's response names a handoff role
/// Then the developer receives a task of the named type
#[tokio::test]
async fn test_handoff_between_roles() {
    let harness = Harness::new();
    let analyst = harness.agent(AgentRole::Analyst).await;
    let developer = harness.agent(AgentRole::Developer).await;
    let router = harness
        .router()
        .spawn(Arc::new(harness.broker.clone()))
        .await
        .unwrap();

    harness
        .publish(
            &harness
                .event(EventType::AgentResponse)
                .with_field("agent_id", analyst.to_string())
                .with_field("handoff_role", "developer")
                .with_field("task_type", "implement_story"),
        )
        .await;
    wait_until(|| async { !harness.routed_tasks().is_empty() }).await;

    let task = &harness.routed_tasks()[0];
    assert_eq!(task.agent_id, developer);
    assert_eq!(task.task_type, "implement_story");
    assert_eq!(task.source_event_type, EventType::AgentResponse);
    router.stop(Duration::from_secs(1)).await.unwrap();
}

/// Test: A failing agent triggers recovery
/// Given a developer whose handler always fails and a coordinator
/// When the developer fails three tasks in a row
/// Then it enters error and the coordinator is sent a recover_agent task
#[tokio::test]
async fn test_agent_error_routes_recovery_task() {
    let harness = Harness::new();
    let coordinator = harness.agent(AgentRole::Coordinator).await;
    let developer = harness.agent(AgentRole::Developer).await;
    let router = harness
        .router()
        .spawn(Arc::new(harness.broker.clone()))
        .await
        .unwrap();
    let consumer = harness
        .consumer(developer, Arc::new(RecordingHandler::failing()))
        .await
        .spawn(Arc::new(harness.broker.clone()))
        .await
        .unwrap();

    let dispatcher = harness.dispatcher();
    for _ in 0..3 {
        let task = agentflow::core::TaskRequest::new("implement_story", EventType::StoryTransition);
        assert!(dispatcher.assign(task, developer, harness.project).await);
    }

    wait_until(|| async {
        harness
            .routed_tasks()
            .iter()
            .any(|t| t.task_type == "recover_agent")
    })
    .await;

    let recovery = harness
        .routed_tasks()
        .into_iter()
        .find(|t| t.task_type == "recover_agent")
        .unwrap();
    assert_eq!(recovery.agent_id, coordinator);
    assert_eq!(recovery.priority, TaskPriority::Urgent);
    assert_eq!(recovery.context_str("agent_id"), Some(developer.to_string().as_str()));
    assert_eq!(
        harness.directory.get(&developer).await.unwrap().status,
        AgentStatus::Error
    );

    consumer.stop(Duration::from_secs(1)).await.unwrap();
    router.stop(Duration::from_secs(1)).await.unwrap();
}

/// Test: Unroutable events do not stop the router
/// Given no agents at all
/// When a user message is published, then an agent joins and another arrives
/// Then the first fails to route and the second is routed
#[tokio::test]
async fn test_router_survives_handler_failure() {
    let harness = Harness::new();
    let router = harness
        .router()
        .spawn(Arc::new(harness.broker.clone()))
        .await
        .unwrap();

    harness.publish(&harness.event(EventType::UserMessage)).await;
    let broker = harness.broker.clone();
    wait_until(|| {
        let broker = broker.clone();
        async move {
            (0..4)
                .map(|p| broker.committed_offset(ROUTER_GROUP, topics::USER_MESSAGES, p))
                .sum::<u64>()
                == 1
        }
    })
    .await;
    assert!(harness.routed_tasks().is_empty());

    let coordinator = harness.agent(AgentRole::Coordinator).await;
    harness.publish(&harness.event(EventType::UserMessage)).await;
    wait_until(|| async { !harness.routed_tasks().is_empty() }).await;
    assert_eq!(harness.routed_tasks()[0].agent_id, coordinator);

    router.stop(Duration::from_secs(1)).await.unwrap();
}
