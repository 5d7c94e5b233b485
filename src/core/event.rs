//! Inbound events consumed by the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::agent::{AgentId, AgentRole, ProjectId};
use super::uuid_id;
use crate::broker::topics;
use crate::{Error, Result};

uuid_id!(
    /// Unique identifier for an inbound event.
    EventId
);

/// Classification of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A user wrote to an agent.
    UserMessage,
    /// An agent finished a piece of work and may hand off.
    AgentResponse,
    /// A user answered an approval request.
    ApprovalResponse,
    /// An agent reported a status change.
    AgentStatus,
    /// A work item moved between board columns.
    StoryTransition,
}

impl EventType {
    /// Events that originate from a human rather than an agent.
    pub fn is_user_origin(&self) -> bool {
        matches!(self, EventType::UserMessage | EventType::ApprovalResponse)
    }

    /// The broker topic this event type is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            EventType::UserMessage => topics::USER_MESSAGES,
            EventType::AgentResponse => topics::AGENT_RESPONSES,
            EventType::ApprovalResponse => topics::APPROVAL_RESPONSES,
            EventType::AgentStatus => topics::AGENT_STATUS,
            EventType::StoryTransition => topics::STORY_EVENTS,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::UserMessage => "user_message",
            EventType::AgentResponse => "agent_response",
            EventType::ApprovalResponse => "approval_response",
            EventType::AgentStatus => "agent_status",
            EventType::StoryTransition => "story_transition",
        };
        write!(f, "{}", name)
    }
}

/// An event arriving on one of the router's input topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_id: EventId,
    pub event_type: EventType,
    pub project_id: ProjectId,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(event_type: EventType, project_id: ProjectId) -> Self {
        Self {
            event_id: EventId::new(),
            event_type,
            project_id,
            payload: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Builder-style payload field.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// String payload field, if present.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Parse an agent id from a payload field.
    ///
    /// Missing fields are `Ok(None)`; malformed ids are validation errors.
    pub fn agent_id_field(&self, key: &str) -> Result<Option<AgentId>> {
        match self.field_str(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| Error::Validation(format!("{} is not an agent id: {}", key, raw))),
        }
    }

    /// Parse an agent role from a payload field.
    pub fn role_field(&self, key: &str) -> Result<Option<AgentRole>> {
        self.field_str(key).map(str::parse).transpose()
    }
}
