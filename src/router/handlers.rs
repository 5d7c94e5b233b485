//! Built-in route handlers.

use async_trait::async_trait;

use super::{RouteContext, RouteHandler};
use crate::core::{AgentId, AgentRole, EventType, InboundEvent, RoutedTask, TaskPriority, TaskRequest};
use crate::kanban::columns;
use crate::{Error, Result};

/// Board column a story enters, and who picks it up there.
fn stage_for(column: &str) -> Option<(AgentRole, &'static str)> {
    match column {
        columns::ANALYSIS => Some((AgentRole::Analyst, "analyze_story")),
        columns::IN_PROGRESS => Some((AgentRole::Developer, "implement_story")),
        columns::TESTING => Some((AgentRole::Tester, "test_story")),
        _ => None,
    }
}

/// Payload fields are carried into the task context, along with the event id.
fn request_for(event: &InboundEvent, task_type: &str) -> TaskRequest {
    TaskRequest::new(task_type, event.event_type)
        .with_context(event.payload.clone())
        .with_context_field("event_id", event.event_id.to_string())
}

/// User messages go to the addressed agent, or to an agent of the
/// requested role (coordinator by default).
pub struct UserMessageHandler;

#[async_trait]
impl RouteHandler for UserMessageHandler {
    fn name(&self) -> &'static str {
        "user_message"
    }

    fn should_handle(&self, event: &InboundEvent) -> bool {
        event.event_type == EventType::UserMessage
    }

    async fn handle(&self, event: &InboundEvent, ctx: &RouteContext) -> Result<RoutedTask> {
        let (agent_id, reason) = match event.agent_id_field("agent_id")? {
            Some(id) => {
                ctx.require_agent(&id, &event.project_id).await?;
                (id, "user addressed agent".to_string())
            }
            None => {
                let role = event.role_field("role")?.unwrap_or(AgentRole::Coordinator);
                let id = ctx.resolve_role(&event.project_id, role).await?;
                (id, format!("user message for {}", role))
            }
        };
        Ok(request_for(event, "respond_to_user")
            .with_priority(TaskPriority::High)
            .with_reason(reason)
            .stamp(agent_id, event.project_id))
    }
}

/// Approval answers go back to the agent that asked.
pub struct ApprovalResponseHandler;

#[async_trait]
impl RouteHandler for ApprovalResponseHandler {
    fn name(&self) -> &'static str {
        "approval_response"
    }

    fn should_handle(&self, event: &InboundEvent) -> bool {
        event.event_type == EventType::ApprovalResponse
    }

    async fn handle(&self, event: &InboundEvent, ctx: &RouteContext) -> Result<RoutedTask> {
        let agent_id = event
            .agent_id_field("requesting_agent_id")?
            .ok_or_else(|| {
                Error::Validation("approval response without requesting_agent_id".to_string())
            })?;
        ctx.require_agent(&agent_id, &event.project_id).await?;
        Ok(request_for(event, "approval_received")
            .with_priority(TaskPriority::High)
            .with_reason("approval answered")
            .stamp(agent_id, event.project_id))
    }
}

/// Agent responses that hand work to another agent or role.
pub struct HandoffHandler;

#[async_trait]
impl RouteHandler for HandoffHandler {
    fn name(&self) -> &'static str {
        "handoff"
    }

    fn should_handle(&self, event: &InboundEvent) -> bool {
        event.event_type == EventType::AgentResponse
            && (event.payload.contains_key("handoff_agent_id")
                || event.payload.contains_key("handoff_role"))
    }

    async fn handle(&self, event: &InboundEvent, ctx: &RouteContext) -> Result<RoutedTask> {
        let agent_id = match event.agent_id_field("handoff_agent_id")? {
            Some(id) => {
                ctx.require_agent(&id, &event.project_id).await?;
                id
            }
            None => {
                let role = event
                    .role_field("handoff_role")?
                    .ok_or_else(|| Error::Validation("handoff without target".to_string()))?;
                ctx.resolve_role(&event.project_id, role).await?
            }
        };
        let task_type = event.field_str("task_type").unwrap_or("handoff");
        let from = event.field_str("agent_id").unwrap_or("unknown agent");
        Ok(request_for(event, task_type)
            .with_reason(format!("handoff from {}", from))
            .stamp(agent_id, event.project_id))
    }
}

/// Agents that report an error get a recovery task for the coordinator.
pub struct AgentStatusHandler;

#[async_trait]
impl RouteHandler for AgentStatusHandler {
    fn name(&self) -> &'static str {
        "agent_status"
    }

    fn should_handle(&self, event: &InboundEvent) -> bool {
        event.event_type == EventType::AgentStatus && event.field_str("status") == Some("error")
    }

    async fn handle(&self, event: &InboundEvent, ctx: &RouteContext) -> Result<RoutedTask> {
        let failed: Option<AgentId> = event.agent_id_field("agent_id")?;
        let coordinator = ctx
            .resolve_role(&event.project_id, AgentRole::Coordinator)
            .await?;
        let reason = match failed {
            Some(id) => format!("agent {} entered error state", id.short()),
            None => "agent entered error state".to_string(),
        };
        Ok(request_for(event, "recover_agent")
            .with_priority(TaskPriority::Urgent)
            .with_reason(reason)
            .stamp(coordinator, event.project_id))
    }
}

/// Admitted board moves into a working column.
pub struct StoryTransitionHandler;

#[async_trait]
impl RouteHandler for StoryTransitionHandler {
    fn name(&self) -> &'static str {
        "story_transition"
    }

    fn should_handle(&self, event: &InboundEvent) -> bool {
        event.event_type == EventType::StoryTransition
            && event.field_str("to").and_then(stage_for).is_some()
    }

    async fn handle(&self, event: &InboundEvent, ctx: &RouteContext) -> Result<RoutedTask> {
        let to = event.field_str("to").unwrap_or_default();
        let (role, task_type) = stage_for(to)
            .ok_or_else(|| Error::Validation(format!("no stage for column {}", to)))?;

        // Keep the story with its assignee when the assignee fits the stage.
        let assignee = match event.agent_id_field("assignee")? {
            Some(id) => ctx
                .directory()
                .get(&id)
                .await
                .filter(|a| a.role == role && a.project_id == event.project_id && a.is_active())
                .map(|a| a.id),
            None => None,
        };
        let agent_id = match assignee {
            Some(id) => id,
            None => ctx.resolve_role(&event.project_id, role).await?,
        };

        Ok(request_for(event, task_type)
            .with_reason(format!("story entered {}", to))
            .stamp(agent_id, event.project_id))
    }
}
