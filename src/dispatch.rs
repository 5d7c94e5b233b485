//! Task dispatcher: publishes routed tasks onto `agent-tasks`.
//!
//! Publishing is keyed by the target agent id, so every task for one agent
//! lands on the same partition and is consumed in publish order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::{topics, Broker};
use crate::core::{Agent, AgentId, AgentRole, ProjectId, RoutedTask, TaskRequest};
use crate::directory::AgentDirectory;

/// How to pick one agent among several idle candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// First candidate in registration order.
    #[default]
    FirstIdle,
    /// Fewest in-flight tasks; earliest registered on a tie.
    LeastLoaded,
}

impl SelectionStrategy {
    pub fn select<'a>(&self, candidates: &'a [Agent]) -> Option<&'a Agent> {
        match self {
            SelectionStrategy::FirstIdle => candidates.first(),
            // min_by_key keeps the first of equal minima.
            SelectionStrategy::LeastLoaded => candidates.iter().min_by_key(|a| a.load),
        }
    }
}

pub struct TaskDispatcher {
    broker: Arc<dyn Broker>,
    directory: Arc<dyn AgentDirectory>,
    strategy: SelectionStrategy,
}

impl TaskDispatcher {
    pub fn new(broker: Arc<dyn Broker>, directory: Arc<dyn AgentDirectory>) -> Self {
        Self {
            broker,
            directory,
            strategy: SelectionStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn directory(&self) -> &Arc<dyn AgentDirectory> {
        &self.directory
    }

    /// Stamp the task with its target and publish it.
    ///
    /// Returns whether the publish succeeded. Retrying is up to the caller.
    pub async fn assign(&self, task: TaskRequest, agent_id: AgentId, project_id: ProjectId) -> bool {
        self.publish(&task.stamp(agent_id, project_id)).await
    }

    /// Send the task to one idle agent with `role`.
    ///
    /// Returns `false` when no agent is idle or the publish fails.
    pub async fn broadcast(&self, task: TaskRequest, role: AgentRole, project_id: ProjectId) -> bool {
        match self.select_idle(&project_id, role).await {
            Some(agent_id) => self.assign(task, agent_id, project_id).await,
            None => {
                warn!(%role, %project_id, task_type = %task.task_type, "no idle agent for broadcast");
                false
            }
        }
    }

    /// Pick an idle agent with the configured strategy.
    pub async fn select_idle(&self, project_id: &ProjectId, role: AgentRole) -> Option<AgentId> {
        let candidates = self.directory.idle_agents(project_id, role).await;
        let selected = self.strategy.select(&candidates).map(|a| a.id);
        debug!(%role, candidates = candidates.len(), ?selected, "agent selection");
        selected
    }

    /// Publish an already stamped task.
    pub async fn publish(&self, task: &RoutedTask) -> bool {
        let payload = match task.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "failed to encode task");
                return false;
            }
        };
        let key = task.agent_id.to_string();

        match self
            .broker
            .publish(topics::AGENT_TASKS, Some(&key), payload)
            .await
        {
            Ok(delivery) => {
                if let Err(e) = self.directory.record_assignment(&task.agent_id).await {
                    debug!(agent_id = %task.agent_id, error = %e, "load not tracked");
                }
                info!(
                    task_id = %task.task_id,
                    agent_id = %task.agent_id,
                    task_type = %task.task_type,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "task dispatched"
                );
                true
            }
            Err(e) => {
                warn!(task_id = %task.task_id, agent_id = %task.agent_id, error = %e, "task publish failed");
                false
            }
        }
    }
}
