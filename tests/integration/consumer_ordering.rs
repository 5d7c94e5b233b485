//! Consumer tests: per-agent ordering, mutual exclusion and redelivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use agentflow::broker::{topics, Broker};
use agentflow::consumer::{consumer_group, ProcessOutcome};
use agentflow::conversation::{ArtifactStore, ConversationLog, RecordKind};
use agentflow::core::{AgentRole, EventType, TaskRequest};

use crate::fixtures::{wait_until, Harness, RecordingHandler, ReportingHandler};

/// Test: Tasks for one agent execute in publish order
/// Given a developer consumer
/// When twenty numbered tasks are dispatched to it
/// Then they execute in exactly that order
#[tokio::test]
async fn test_per_agent_fifo() {
    let harness = Harness::new();
    let developer = harness.agent(AgentRole::Developer).await;
    let handler = Arc::new(RecordingHandler::default());
    let consumer = harness
        .consumer(developer, handler.clone())
        .await
        .spawn(Arc::new(harness.broker.clone()))
        .await
        .unwrap();

    let dispatcher = harness.dispatcher();
    for sequence in 0..20u64 {
        let task = TaskRequest::new("implement_story", EventType::StoryTransition)
            .with_context_field("sequence", sequence);
        assert!(dispatcher.assign(task, developer, harness.project).await);
    }

    wait_until(|| async { handler.count() == 20 }).await;
    let order: Vec<u64> = handler
        .executions()
        .iter()
        .map(|e| e.sequence.unwrap())
        .collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());

    consumer.stop(Duration::from_secs(1)).await.unwrap();
}

/// Test: One agent never runs two tasks at once
/// Given two consumer instances for the same agent sharing an execution lock
/// When ten slow tasks are dispatched
/// Then the handler never sees two of the agent's tasks in flight and runs each once
#[tokio::test]
async fn test_no_overlap_across_instances() {
    let harness = Harness::new();
    let developer = harness.agent(AgentRole::Developer).await;
    let handler = Arc::new(RecordingHandler::with_delay(Duration::from_millis(10)));
    let lock = Arc::new(Mutex::new(()));

    let mut consumers = Vec::new();
    for _ in 0..2 {
        let consumer = harness
            .consumer(developer, handler.clone())
            .await
            .with_execution_lock(lock.clone())
            .spawn(Arc::new(harness.broker.clone()))
            .await
            .unwrap();
        consumers.push(consumer);
    }

    let dispatcher = harness.dispatcher();
    for _ in 0..10 {
        let task = TaskRequest::new("implement_story", EventType::StoryTransition);
        assert!(dispatcher.assign(task, developer, harness.project).await);
    }

    wait_until(|| async { handler.count() >= 10 }).await;
    assert_eq!(handler.max_active_per_agent(), 1);
    assert_eq!(handler.count(), 10);

    for consumer in consumers {
        consumer.stop(Duration::from_secs(1)).await.unwrap();
    }
}

/// Test: A redelivered task runs once
/// Given a running consumer
/// When the same task bytes are published twice
/// Then the handler runs once and both deliveries are committed
#[tokio::test]
async fn test_redelivery_executes_once() {
    let harness = Harness::new();
    let developer = harness.agent(AgentRole::Developer).await;
    let handler = Arc::new(RecordingHandler::default());
    let consumer = harness
        .consumer(developer, handler.clone())
        .await
        .spawn(Arc::new(harness.broker.clone()))
        .await
        .unwrap();

    let task = TaskRequest::new("test_story", EventType::StoryTransition)
        .stamp(developer, harness.project);
    let key = developer.to_string();
    for _ in 0..2 {
        harness
            .broker
            .publish(topics::AGENT_TASKS, Some(&key), task.to_bytes().unwrap())
            .await
            .unwrap();
    }

    let group = consumer_group(&developer);
    let broker = harness.broker.clone();
    wait_until(|| {
        let broker = broker.clone();
        let group = group.clone();
        async move {
            (0..4)
                .map(|p| broker.committed_offset(&group, topics::AGENT_TASKS, p))
                .sum::<u64>()
                == 2
        }
    })
    .await;

    assert_eq!(handler.count(), 1);
    assert_eq!(handler.executions()[0].task_id, task.task_id);
    consumer.stop(Duration::from_secs(1)).await.unwrap();
}

/// Test: A restarted consumer does not run a finished task again
/// Given a user-origin task already processed by one consumer instance
/// When a fresh instance for the same agent receives it again
/// Then it is discarded and the conversation holds one record of each kind
#[tokio::test]
async fn test_user_message_recorded_once() {
    let harness = Harness::new();
    let coordinator = harness.agent(AgentRole::Coordinator).await;
    let handler = Arc::new(RecordingHandler::default());

    let task = TaskRequest::new("respond_to_user", EventType::UserMessage)
        .with_context_field("content", "add password reset")
        .stamp(coordinator, harness.project);

    let mut first = harness.consumer(coordinator, handler.clone()).await;
    assert_eq!(first.process(&task).await, ProcessOutcome::Completed);
    assert_eq!(first.process(&task).await, ProcessOutcome::Duplicate);

    let mut second = harness.consumer(coordinator, handler.clone()).await;
    assert_eq!(second.process(&task).await, ProcessOutcome::Duplicate);

    let records = harness.conversations.records_for_task(&task.task_id).await;
    let user_messages: Vec<_> = records
        .iter()
        .filter(|r| r.kind == RecordKind::UserMessage)
        .collect();
    assert_eq!(user_messages.len(), 1);
    assert_eq!(user_messages[0].content, "add password reset");
    let agent_messages = records
        .iter()
        .filter(|r| r.kind == RecordKind::AgentMessage)
        .count();
    assert_eq!(agent_messages, 1);
    assert_eq!(handler.count(), 1);
}

/// Test: Tool writes survive a crash mid-task without duplicates
/// Given a consumer that dies after its handler wrote a message, a question and an artifact
/// When a fresh consumer for the same agent runs the redelivered task to completion
/// Then the conversation and artifact store hold each write once
#[tokio::test]
async fn test_redelivery_after_crash_does_not_duplicate_tool_writes() {
    let harness = Harness::new();
    let analyst = harness.agent(AgentRole::Analyst).await;
    let task = TaskRequest::new("analyze_story", EventType::UserMessage)
        .with_context_field("content", "add password reset")
        .stamp(analyst, harness.project);

    let stalled = Arc::new(ReportingHandler::stalling(Duration::from_secs(60)));
    let mut crashed = harness.consumer(analyst, stalled.clone()).await;
    let interrupted =
        tokio::time::timeout(Duration::from_millis(100), crashed.process(&task)).await;
    assert!(interrupted.is_err());
    drop(crashed);
    assert_eq!(stalled.runs(), 1);

    let finishing = Arc::new(ReportingHandler::default());
    let mut restarted = harness.consumer(analyst, finishing.clone()).await;
    assert_eq!(restarted.process(&task).await, ProcessOutcome::Completed);
    assert_eq!(finishing.runs(), 1);

    let records = harness.conversations.records_for_task(&task.task_id).await;
    let kinds: Vec<RecordKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![RecordKind::UserMessage, RecordKind::AgentMessage, RecordKind::Question]
    );
    assert_eq!(
        harness.artifacts.artifacts_for_project(&harness.project).await.len(),
        1
    );

    // Delivered once more after completion: discarded outright.
    let mut third = harness.consumer(analyst, finishing.clone()).await;
    assert_eq!(third.process(&task).await, ProcessOutcome::Duplicate);
    assert_eq!(finishing.runs(), 1);
}

/// Test: Tasks for other agents are skipped
/// Given consumers for two developers
/// When tasks are dispatched to each
/// Then every task runs only on its addressee
#[tokio::test]
async fn test_tasks_only_reach_their_agent() {
    let harness = Harness::new();
    let first = harness.agent(AgentRole::Developer).await;
    let second = harness.agent(AgentRole::Developer).await;
    let handler = Arc::new(RecordingHandler::default());

    let mut consumers = Vec::new();
    for agent in [first, second] {
        consumers.push(
            harness
                .consumer(agent, handler.clone())
                .await
                .spawn(Arc::new(harness.broker.clone()))
                .await
                .unwrap(),
        );
    }

    let dispatcher = harness.dispatcher();
    for target in [first, second, first] {
        let task = TaskRequest::new("implement_story", EventType::StoryTransition);
        assert!(dispatcher.assign(task, target, harness.project).await);
    }

    wait_until(|| async { handler.count() == 3 }).await;
    let on_first = handler
        .executions()
        .iter()
        .filter(|e| e.agent_id == first)
        .count();
    assert_eq!(on_first, 2);

    for consumer in consumers {
        consumer.stop(Duration::from_secs(1)).await.unwrap();
    }
}
