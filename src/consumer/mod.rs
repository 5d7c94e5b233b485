//! Agent instance consumer.
//!
//! One consumer runs per agent. It pulls `agent-tasks` in its own consumer
//! group, discards tasks addressed to other agents and runs its own tasks
//! one at a time through a [`TaskHandler`]:
//!
//! ```text
//! idle -> claiming -> executing -> idle
//!                              \-> error   (after N consecutive failures)
//! ```
//!
//! In `error` the consumer stops pulling until [`ConsumerHandle::reset`].

pub mod tools;

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actor::{panic_message, ActorHandle};
use crate::broker::{publish_json, topics, Broker};
use crate::conversation::{ArtifactStore, ConversationLog, ConversationRecord, RecordKind};
use crate::core::{
    Agent, AgentId, AgentStatus, EventType, InboundEvent, ProjectId, RoutedTask, TaskId,
};
use crate::directory::AgentDirectory;
use crate::{Error, Result};

pub use tools::AgentToolContext;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consumer group used by an agent's consumer.
pub fn consumer_group(agent_id: &AgentId) -> String {
    format!("agent-{}", agent_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    #[default]
    Idle,
    Claiming,
    Executing,
    Error,
}

/// Runs one task for an agent. Usually backed by an LLM.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &RoutedTask, tools: &AgentToolContext) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consecutive failures before the consumer enters `error`.
    pub failure_threshold: u32,
    /// How many processed task ids are remembered for redelivery checks.
    pub dedup_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

impl ConsumerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity.max(1);
        self
    }
}

/// What happened to one delivered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Addressed to another agent.
    NotAddressed,
    /// Already processed; a redelivery.
    Duplicate,
    Completed,
    Failed { error: String },
}

/// Bounded memory of processed task ids, oldest evicted first.
struct RecentTasks {
    order: VecDeque<TaskId>,
    seen: HashSet<TaskId>,
    capacity: usize,
}

impl RecentTasks {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(DEFAULT_DEDUP_CAPACITY)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &TaskId) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: TaskId) {
        if !self.seen.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

pub struct AgentConsumer {
    agent_id: AgentId,
    project_id: ProjectId,
    directory: Arc<dyn AgentDirectory>,
    handler: Arc<dyn TaskHandler>,
    conversations: Arc<dyn ConversationLog>,
    tools: AgentToolContext,
    status_broker: Option<Arc<dyn Broker>>,
    execution_lock: Arc<Mutex<()>>,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
    reset: Arc<Notify>,
    recent: RecentTasks,
    consecutive_failures: u32,
}

impl AgentConsumer {
    pub fn new(
        agent: &Agent,
        directory: Arc<dyn AgentDirectory>,
        handler: Arc<dyn TaskHandler>,
        conversations: Arc<dyn ConversationLog>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let config = ConsumerConfig::default();
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            agent_id: agent.id,
            project_id: agent.project_id,
            tools: AgentToolContext::new(
                agent.id,
                agent.project_id,
                conversations.clone(),
                artifacts,
            ),
            directory,
            handler,
            conversations,
            status_broker: None,
            execution_lock: Arc::new(Mutex::new(())),
            recent: RecentTasks::new(config.dedup_capacity),
            config,
            state,
            reset: Arc::new(Notify::new()),
            consecutive_failures: 0,
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.recent = RecentTasks::new(config.dedup_capacity);
        self.config = config;
        self
    }

    /// Share the per-agent execution lock with other consumers of the same agent.
    pub fn with_execution_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.execution_lock = lock;
        self
    }

    /// Where `agent_status` events are published on entering `error`.
    pub fn with_status_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.status_broker = Some(broker);
        self
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Run one delivered task through the state machine.
    pub async fn process(&mut self, task: &RoutedTask) -> ProcessOutcome {
        if task.agent_id != self.agent_id {
            debug!(agent_id = %self.agent_id, task_id = %task.task_id, target = %task.agent_id, "task for another agent discarded");
            return ProcessOutcome::NotAddressed;
        }
        if self.recent.contains(&task.task_id) {
            info!(agent_id = %self.agent_id, task_id = %task.task_id, "duplicate task discarded");
            return ProcessOutcome::Duplicate;
        }

        self.set_state(ConsumerState::Claiming);
        let _guard = self.execution_lock.clone().lock_owned().await;

        // Another consumer of this agent, or an earlier run of this one, may
        // have finished the task while we waited for the lock.
        if self.conversations.is_processed(&task.task_id).await {
            info!(agent_id = %self.agent_id, task_id = %task.task_id, "task already processed, discarded");
            self.recent.insert(task.task_id);
            self.set_state(ConsumerState::Idle);
            return ProcessOutcome::Duplicate;
        }

        if let Err(e) = self
            .directory
            .set_status(&self.agent_id, AgentStatus::Busy)
            .await
        {
            warn!(agent_id = %self.agent_id, error = %e, "failed to mark agent busy");
        }
        if task.is_user_origin() {
            self.record_user_message(task).await;
        }

        self.set_state(ConsumerState::Executing);
        info!(
            agent_id = %self.agent_id,
            task_id = %task.task_id,
            task_type = %task.task_type,
            priority = %task.priority,
            "task started"
        );
        let started = Instant::now();
        let tools = self.tools.for_task(task);
        let result = AssertUnwindSafe(self.handler.handle(task, &tools))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(Ok(())) => ProcessOutcome::Completed,
            Ok(Err(e)) => ProcessOutcome::Failed {
                error: e.to_string(),
            },
            Err(panic) => ProcessOutcome::Failed {
                error: panic_message("task handler", panic.as_ref()),
            },
        };

        self.recent.insert(task.task_id);
        if let Err(e) = self.conversations.mark_processed(task.task_id).await {
            warn!(agent_id = %self.agent_id, task_id = %task.task_id, error = %e, "processed marker not stored");
        }
        if let Err(e) = self.directory.complete_assignment(&self.agent_id).await {
            debug!(agent_id = %self.agent_id, error = %e, "load not tracked");
        }

        match &outcome {
            ProcessOutcome::Failed { error } => {
                self.consecutive_failures += 1;
                warn!(
                    agent_id = %self.agent_id,
                    task_id = %task.task_id,
                    elapsed_ms,
                    failures = self.consecutive_failures,
                    %error,
                    "task failed"
                );
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.enter_error().await;
                } else {
                    self.become_idle().await;
                }
            }
            _ => {
                self.consecutive_failures = 0;
                info!(agent_id = %self.agent_id, task_id = %task.task_id, elapsed_ms, "task completed");
                self.become_idle().await;
            }
        }
        outcome
    }

    /// Leave `error` after an external reset.
    pub async fn recover(&mut self) {
        info!(agent_id = %self.agent_id, "consumer reset");
        self.consecutive_failures = 0;
        self.become_idle().await;
    }

    async fn become_idle(&self) {
        if let Err(e) = self
            .directory
            .set_status(&self.agent_id, AgentStatus::Idle)
            .await
        {
            warn!(agent_id = %self.agent_id, error = %e, "failed to mark agent idle");
        }
        self.set_state(ConsumerState::Idle);
    }

    async fn enter_error(&self) {
        error!(
            agent_id = %self.agent_id,
            failures = self.consecutive_failures,
            "consumer entering error state"
        );
        if let Err(e) = self
            .directory
            .set_status(&self.agent_id, AgentStatus::Error)
            .await
        {
            warn!(agent_id = %self.agent_id, error = %e, "failed to mark agent errored");
        }
        self.set_state(ConsumerState::Error);

        if let Some(broker) = &self.status_broker {
            let event = InboundEvent::new(EventType::AgentStatus, self.project_id)
                .with_field("status", "error")
                .with_field("agent_id", self.agent_id.to_string())
                .with_field("consecutive_failures", self.consecutive_failures);
            let key = self.project_id.to_string();
            if let Err(e) =
                publish_json(broker.as_ref(), topics::AGENT_STATUS, Some(&key), &event).await
            {
                warn!(agent_id = %self.agent_id, error = %e, "agent status not published");
            }
        }
    }

    async fn record_user_message(&self, task: &RoutedTask) {
        let content = match task
            .context_str("content")
            .or_else(|| task.context_str("message"))
        {
            Some(content) => content.to_string(),
            None => serde_json::Value::Object(task.context.clone()).to_string(),
        };
        let record =
            ConversationRecord::new(self.project_id, self.agent_id, RecordKind::UserMessage, &content)
                .for_task(task.task_id);
        if let Err(e) = self.conversations.record(record).await {
            warn!(agent_id = %self.agent_id, task_id = %task.task_id, error = %e, "user message not recorded");
        }
    }

    /// Subscribe to `agent-tasks` and process until cancelled.
    pub async fn spawn(mut self, broker: Arc<dyn Broker>) -> Result<ConsumerHandle> {
        let group = consumer_group(&self.agent_id);
        let mut subscription = broker.subscribe(&[topics::AGENT_TASKS], &group).await?;
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let state = self.state.subscribe();
        let reset = self.reset.clone();
        let agent_id = self.agent_id;
        info!(%agent_id, %group, "agent consumer started");

        let task = tokio::spawn(async move {
            loop {
                if self.state() == ConsumerState::Error {
                    let reset = self.reset.clone();
                    tokio::select! {
                        biased;
                        _ = cancel_clone.cancelled() => break,
                        _ = reset.notified() => {}
                    }
                    self.recover().await;
                    continue;
                }

                let received = tokio::select! {
                    biased;
                    _ = cancel_clone.cancelled() => break,
                    received = subscription.recv() => received,
                };
                let message = match received {
                    Ok(message) => message,
                    Err(Error::BrokerClosed) => {
                        info!(agent_id = %self.agent_id, "broker closed, consumer stopping");
                        break;
                    }
                    Err(e) => {
                        warn!(agent_id = %self.agent_id, error = %e, "task receive failed");
                        tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                        continue;
                    }
                };

                match RoutedTask::from_bytes(&message.payload) {
                    Ok(task) => {
                        self.process(&task).await;
                    }
                    Err(e) => {
                        warn!(agent_id = %self.agent_id, offset = message.offset, error = %e, "undecodable task skipped")
                    }
                }
                if let Err(e) = subscription.commit(&message).await {
                    warn!(agent_id = %self.agent_id, offset = message.offset, error = %e, "task commit failed");
                }
            }
            debug!(agent_id = %self.agent_id, "agent consumer stopped");
        });

        Ok(ConsumerHandle {
            agent_id,
            actor: ActorHandle::new(cancel, task),
            state,
            reset,
        })
    }
}

/// Control surface of a running consumer.
pub struct ConsumerHandle {
    agent_id: AgentId,
    actor: ActorHandle,
    state: watch::Receiver<ConsumerState>,
    reset: Arc<Notify>,
}

impl ConsumerHandle {
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Bring a consumer out of `error`. No effect in any other state.
    pub fn reset(&self) {
        if self.state() == ConsumerState::Error {
            self.reset.notify_one();
        }
    }

    /// Wait until the consumer reports `target`.
    pub async fn wait_for_state(&self, target: ConsumerState, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|s| *s == target))
            .await
            .map_err(|_| Error::Timeout(timeout))?
            .map_err(|_| Error::TaskJoin(format!("consumer for {} stopped", self.agent_id)))?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.actor.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.actor.is_finished()
    }

    pub async fn stop(self, timeout: Duration) -> Result<()> {
        self.actor.stop(timeout).await
    }
}
