//! Routed tasks: the unit of work published to `agent-tasks`.
//!
//! A `TaskRequest` describes work before a target is known. Stamping it with
//! an agent and a project produces an immutable `RoutedTask`, which is what
//! travels over the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::agent::{AgentId, ProjectId};
use super::event::EventType;
use super::uuid_id;
use crate::Result;

uuid_id!(
    /// Unique identifier for a routed task.
    TaskId
);

/// Scheduling priority carried on a routed task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Work that still needs a target agent.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_type: String,
    pub priority: TaskPriority,
    pub routing_reason: String,
    pub source_event_type: EventType,
    pub context: Map<String, Value>,
}

impl TaskRequest {
    pub fn new(task_type: &str, source_event_type: EventType) -> Self {
        Self {
            task_type: task_type.to_string(),
            priority: TaskPriority::Normal,
            routing_reason: String::new(),
            source_event_type,
            context: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.routing_reason = reason.into();
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_context_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Stamp the request with its target, producing a publishable task.
    pub fn stamp(self, agent_id: AgentId, project_id: ProjectId) -> RoutedTask {
        RoutedTask {
            task_id: TaskId::new(),
            agent_id,
            project_id,
            task_type: self.task_type,
            priority: self.priority,
            routing_reason: self.routing_reason,
            source_event_type: self.source_event_type,
            context: self.context,
            timestamp: Utc::now(),
        }
    }
}

/// A task addressed to one agent.
///
/// Immutable once published. Under at-least-once delivery the same task may
/// arrive more than once, so consumers key idempotence on `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedTask {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub project_id: ProjectId,
    pub task_type: String,
    pub priority: TaskPriority,
    pub routing_reason: String,
    pub source_event_type: EventType,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl RoutedTask {
    /// Whether the task was triggered by a human.
    pub fn is_user_origin(&self) -> bool {
        self.source_event_type.is_user_origin()
    }

    /// String field from the context payload.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    /// Encode for the broker.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from a broker payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
