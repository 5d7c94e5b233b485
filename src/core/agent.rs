//! Agent identity, role and status.
//!
//! Agents are provisioned per project and never deleted while the project
//! exists; they are soft-retired instead. Status is owned by the agent's
//! consumer, which flips it between `idle` and `busy` around each task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::uuid_id;

uuid_id!(
    /// Unique identifier for an agent.
    AgentId
);

uuid_id!(
    /// Unique identifier for a project.
    ProjectId
);

/// The job an agent performs within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Owns the conversation with the user and recovers failed agents.
    Coordinator,
    /// Turns requests into requirements and stories.
    Analyst,
    /// Implements stories.
    Developer,
    /// Verifies implemented stories.
    Tester,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::Analyst => "analyst",
            AgentRole::Developer => "developer",
            AgentRole::Tester => "tester",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coordinator" => Ok(AgentRole::Coordinator),
            "analyst" => Ok(AgentRole::Analyst),
            "developer" => Ok(AgentRole::Developer),
            "tester" => Ok(AgentRole::Tester),
            other => Err(crate::Error::Validation(format!("unknown agent role: {}", other))),
        }
    }
}

/// Availability of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Waiting for work.
    #[default]
    Idle,
    /// Executing a task.
    Busy,
    /// Stopped after repeated failures; needs an external reset.
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// A worker provisioned for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier for this agent.
    pub id: AgentId,
    /// Project this agent belongs to.
    pub project_id: ProjectId,
    /// Role the agent plays.
    pub role: AgentRole,
    /// Current availability.
    pub status: AgentStatus,
    /// Capability tags, e.g. `frontend` or `postgres`.
    pub capabilities: Vec<String>,
    /// Tasks published to this agent that have not finished yet.
    pub load: u32,
    /// Soft-retired agents keep their record but receive no new work.
    pub retired: bool,
    /// When the agent was provisioned.
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Create an idle agent for a project.
    pub fn new(project_id: ProjectId, role: AgentRole) -> Self {
        Self {
            id: AgentId::new(),
            project_id,
            role,
            status: AgentStatus::Idle,
            capabilities: Vec::new(),
            load: 0,
            retired: false,
            created_at: Utc::now(),
        }
    }

    /// Attach capability tags.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Check whether the agent carries a capability tag (case-insensitive).
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag))
    }

    /// Idle and not retired.
    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle && !self.retired
    }

    /// Able to receive queued work: not retired and not in error.
    pub fn is_active(&self) -> bool {
        !self.retired && self.status != AgentStatus::Error
    }
}
