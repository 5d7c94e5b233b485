//! Event router: turns inbound events into tasks for exactly one agent.
//!
//! Handlers are tried in registration order and the first whose
//! `should_handle` accepts the event builds the task. The task is then
//! handed to the `TaskDispatcher`. A failing or panicking handler is logged
//! and reported as a `RouteOutcome`; it never stops the router.

pub mod handlers;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actor::{panic_message, ActorHandle};
use crate::broker::{topics, Broker};
use crate::core::{Agent, AgentId, AgentRole, InboundEvent, ProjectId, RoutedTask, TaskId};
use crate::directory::AgentDirectory;
use crate::dispatch::{SelectionStrategy, TaskDispatcher};
use crate::{Error, Result};

pub use handlers::{
    AgentStatusHandler, ApprovalResponseHandler, HandoffHandler, StoryTransitionHandler,
    UserMessageHandler,
};

/// Consumer group of the router actor.
pub const ROUTER_GROUP: &str = "event-router";

const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What handlers may use to pick a target agent.
pub struct RouteContext {
    directory: Arc<dyn AgentDirectory>,
    strategy: SelectionStrategy,
}

impl RouteContext {
    pub fn new(directory: Arc<dyn AgentDirectory>, strategy: SelectionStrategy) -> Self {
        Self {
            directory,
            strategy,
        }
    }

    pub fn directory(&self) -> &Arc<dyn AgentDirectory> {
        &self.directory
    }

    /// Pick an agent with `role` in the project.
    ///
    /// Idle agents are preferred and chosen with the selection strategy.
    /// Without one, the first active agent of the role is used and the task
    /// waits on its partition.
    pub async fn resolve_role(&self, project_id: &ProjectId, role: AgentRole) -> Result<AgentId> {
        let idle = self.directory.idle_agents(project_id, role).await;
        if let Some(agent) = self.strategy.select(&idle) {
            return Ok(agent.id);
        }
        self.directory
            .agents_in_project(project_id)
            .await
            .into_iter()
            .find(|a| a.role == role && a.is_active())
            .map(|a| a.id)
            .ok_or_else(|| Error::Handler(format!("no active {} in project {}", role, project_id)))
    }

    /// Look up an explicitly addressed agent.
    pub async fn require_agent(&self, id: &AgentId, project_id: &ProjectId) -> Result<Agent> {
        let agent = self
            .directory
            .get(id)
            .await
            .ok_or(Error::AgentNotFound { id: *id })?;
        if &agent.project_id != project_id || agent.retired {
            return Err(Error::Handler(format!(
                "agent {} is not available in project {}",
                id, project_id
            )));
        }
        Ok(agent)
    }
}

/// One routing rule.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_handle(&self, event: &InboundEvent) -> bool;

    async fn handle(&self, event: &InboundEvent, ctx: &RouteContext) -> Result<RoutedTask>;
}

/// The routing decision for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed {
        handler: &'static str,
        task_id: TaskId,
        agent_id: AgentId,
    },
    Unmatched,
    HandlerFailed {
        handler: &'static str,
        error: String,
    },
    PublishFailed {
        handler: &'static str,
        task_id: TaskId,
        agent_id: AgentId,
    },
}

impl RouteOutcome {
    pub fn is_routed(&self) -> bool {
        matches!(self, RouteOutcome::Routed { .. })
    }
}

pub struct EventRouter {
    handlers: Vec<Box<dyn RouteHandler>>,
    dispatcher: Arc<TaskDispatcher>,
    context: RouteContext,
}

impl EventRouter {
    /// A router with no handlers.
    pub fn new(dispatcher: Arc<TaskDispatcher>) -> Self {
        let context = RouteContext::new(dispatcher.directory().clone(), dispatcher.strategy());
        Self {
            handlers: Vec::new(),
            dispatcher,
            context,
        }
    }

    /// A router with the built-in handlers.
    pub fn with_default_handlers(dispatcher: Arc<TaskDispatcher>) -> Self {
        Self::new(dispatcher)
            .with_handler(UserMessageHandler)
            .with_handler(ApprovalResponseHandler)
            .with_handler(HandoffHandler)
            .with_handler(AgentStatusHandler)
            .with_handler(StoryTransitionHandler)
    }

    /// Append a handler. Earlier handlers win.
    pub fn register(&mut self, handler: Box<dyn RouteHandler>) {
        debug!(handler = handler.name(), "route handler registered");
        self.handlers.push(handler);
    }

    pub fn with_handler(mut self, handler: impl RouteHandler + 'static) -> Self {
        self.register(Box::new(handler));
        self
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Route one event to at most one agent.
    pub async fn route(&self, event: &InboundEvent) -> RouteOutcome {
        let Some(handler) = self.select_handler(event) else {
            warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                project_id = %event.project_id,
                "no route handler matched event"
            );
            return RouteOutcome::Unmatched;
        };
        let name = handler.name();

        let task = match AssertUnwindSafe(handler.handle(event, &self.context))
            .catch_unwind()
            .await
        {
            Ok(Ok(task)) => task,
            Ok(Err(e)) => {
                error!(handler = name, event_id = %event.event_id, event_type = %event.event_type, error = %e, "route handler failed");
                return RouteOutcome::HandlerFailed {
                    handler: name,
                    error: e.to_string(),
                };
            }
            Err(panic) => {
                let message = panic_message("route handler", panic.as_ref());
                error!(handler = name, event_id = %event.event_id, event_type = %event.event_type, error = %message, "route handler panicked");
                return RouteOutcome::HandlerFailed {
                    handler: name,
                    error: message,
                };
            }
        };

        if self.dispatcher.publish(&task).await {
            debug!(handler = name, task_id = %task.task_id, agent_id = %task.agent_id, "event routed");
            RouteOutcome::Routed {
                handler: name,
                task_id: task.task_id,
                agent_id: task.agent_id,
            }
        } else {
            RouteOutcome::PublishFailed {
                handler: name,
                task_id: task.task_id,
                agent_id: task.agent_id,
            }
        }
    }

    fn select_handler(&self, event: &InboundEvent) -> Option<&dyn RouteHandler> {
        self.handlers.iter().map(|h| &**h).find(|handler| {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler.should_handle(event))) {
                Ok(matched) => matched,
                Err(panic) => {
                    error!(
                        handler = handler.name(),
                        event_type = %event.event_type,
                        error = %panic_message("should_handle", panic.as_ref()),
                        "route handler skipped"
                    );
                    false
                }
            }
        })
    }

    /// Subscribe to the router inputs and route until cancelled.
    ///
    /// Every message is committed after routing, whatever the outcome.
    pub async fn spawn(self, broker: Arc<dyn Broker>) -> Result<ActorHandle> {
        let mut subscription = broker
            .subscribe(&topics::ROUTER_INPUTS, ROUTER_GROUP)
            .await?;
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        info!(handlers = ?self.handler_names(), "event router started");

        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel_clone.cancelled() => {
                        debug!("event router cancelled");
                        break;
                    }
                    received = subscription.recv() => received,
                };

                let message = match received {
                    Ok(message) => message,
                    Err(Error::BrokerClosed) => {
                        info!("broker closed, event router stopping");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "event router receive failed");
                        tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                        continue;
                    }
                };

                match message.decode::<InboundEvent>() {
                    Ok(event) => {
                        self.route(&event).await;
                    }
                    Err(e) => {
                        warn!(topic = %message.topic, offset = message.offset, error = %e, "undecodable event skipped")
                    }
                }

                if let Err(e) = subscription.commit(&message).await {
                    warn!(topic = %message.topic, offset = message.offset, error = %e, "event commit failed");
                }
            }
        });

        Ok(ActorHandle::new(cancel, task))
    }
}
