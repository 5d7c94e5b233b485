//! Agent directory: where agents, their status and their load live.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::{Agent, AgentId, AgentRole, AgentStatus, ProjectId};
use crate::{Error, Result};

/// Read and update agent records.
///
/// Listing methods return agents in registration order, which is what makes
/// agent selection deterministic.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get(&self, id: &AgentId) -> Option<Agent>;

    /// Every agent, retired ones included.
    async fn agents(&self) -> Vec<Agent>;

    async fn set_status(&self, id: &AgentId, status: AgentStatus) -> Result<()>;

    /// A task was published to the agent.
    async fn record_assignment(&self, id: &AgentId) -> Result<()>;

    /// A task addressed to the agent finished.
    async fn complete_assignment(&self, id: &AgentId) -> Result<()>;

    async fn agents_in_project(&self, project_id: &ProjectId) -> Vec<Agent> {
        self.agents()
            .await
            .into_iter()
            .filter(|a| &a.project_id == project_id)
            .collect()
    }

    /// Idle, non-retired agents with the role.
    async fn idle_agents(&self, project_id: &ProjectId, role: AgentRole) -> Vec<Agent> {
        self.agents_in_project(project_id)
            .await
            .into_iter()
            .filter(|a| a.role == role && a.is_idle())
            .collect()
    }
}

/// Directory backed by a vector in memory.
#[derive(Default)]
pub struct InMemoryAgentDirectory {
    agents: RwLock<Vec<Agent>>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent. Re-registering an id replaces the record in place.
    pub async fn register(&self, agent: Agent) -> AgentId {
        let id = agent.id;
        let mut agents = self.agents.write().await;
        match agents.iter_mut().find(|a| a.id == id) {
            Some(existing) => *existing = agent,
            None => agents.push(agent),
        }
        debug!(agent_id = %id, "agent registered");
        id
    }

    /// Soft-retire an agent. It keeps its record but gets no new work.
    pub async fn retire(&self, id: &AgentId) -> Result<()> {
        self.update(id, |agent| agent.retired = true).await
    }

    async fn update<F>(&self, id: &AgentId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Agent) + Send,
    {
        let mut agents = self.agents.write().await;
        let agent = agents
            .iter_mut()
            .find(|a| &a.id == id)
            .ok_or(Error::AgentNotFound { id: *id })?;
        f(agent);
        Ok(())
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn get(&self, id: &AgentId) -> Option<Agent> {
        self.agents.read().await.iter().find(|a| &a.id == id).cloned()
    }

    async fn agents(&self) -> Vec<Agent> {
        self.agents.read().await.clone()
    }

    async fn set_status(&self, id: &AgentId, status: AgentStatus) -> Result<()> {
        self.update(id, |agent| agent.status = status).await
    }

    async fn record_assignment(&self, id: &AgentId) -> Result<()> {
        self.update(id, |agent| agent.load = agent.load.saturating_add(1))
            .await
    }

    async fn complete_assignment(&self, id: &AgentId) -> Result<()> {
        self.update(id, |agent| agent.load = agent.load.saturating_sub(1))
            .await
    }
}
