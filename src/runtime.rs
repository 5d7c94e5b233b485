//! Wires the router, the dispatcher and one consumer per agent together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::actor::ActorHandle;
use crate::broker::Broker;
use crate::config::Config;
use crate::consumer::{AgentConsumer, ConsumerHandle, TaskHandler};
use crate::conversation::{
    ArtifactStore, ConversationLog, InMemoryArtifactStore, InMemoryConversationLog,
};
use crate::core::AgentId;
use crate::directory::AgentDirectory;
use crate::dispatch::TaskDispatcher;
use crate::router::EventRouter;
use crate::{Error, Result};

pub struct AgentRuntime {
    config: Config,
    broker: Arc<dyn Broker>,
    directory: Arc<dyn AgentDirectory>,
    conversations: Arc<dyn ConversationLog>,
    artifacts: Arc<dyn ArtifactStore>,
    handler: Arc<dyn TaskHandler>,
    dispatcher: Arc<TaskDispatcher>,
    router: Option<ActorHandle>,
    consumers: HashMap<AgentId, ConsumerHandle>,
    execution_locks: HashMap<AgentId, Arc<Mutex<()>>>,
}

impl AgentRuntime {
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        directory: Arc<dyn AgentDirectory>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let dispatcher = Arc::new(
            TaskDispatcher::new(broker.clone(), directory.clone())
                .with_strategy(config.router.selection),
        );
        Self {
            config,
            broker,
            directory,
            conversations: Arc::new(InMemoryConversationLog::new()),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
            handler,
            dispatcher,
            router: None,
            consumers: HashMap::new(),
            execution_locks: HashMap::new(),
        }
    }

    pub fn with_conversation_log(mut self, conversations: Arc<dyn ConversationLog>) -> Self {
        self.conversations = conversations;
        self
    }

    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn consumer(&self, agent_id: &AgentId) -> Option<&ConsumerHandle> {
        self.consumers.get(agent_id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Start the router and a consumer for every active agent.
    pub async fn start(&mut self) -> Result<()> {
        if self.router.is_none() {
            let router = EventRouter::with_default_handlers(self.dispatcher.clone());
            self.router = Some(router.spawn(self.broker.clone()).await?);
        }
        for agent in self.directory.agents().await {
            if agent.is_active() && !self.consumers.contains_key(&agent.id) {
                self.start_consumer(&agent.id).await?;
            }
        }
        info!(consumers = self.consumers.len(), "runtime started");
        Ok(())
    }

    /// Start consuming tasks for a registered agent.
    pub async fn start_consumer(&mut self, agent_id: &AgentId) -> Result<()> {
        let agent = self
            .directory
            .get(agent_id)
            .await
            .ok_or(Error::AgentNotFound { id: *agent_id })?;
        if self.consumers.contains_key(agent_id) {
            return Ok(());
        }
        let lock = self
            .execution_locks
            .entry(agent.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let handle = AgentConsumer::new(
            &agent,
            self.directory.clone(),
            self.handler.clone(),
            self.conversations.clone(),
            self.artifacts.clone(),
        )
        .with_config(self.config.consumer.clone())
        .with_execution_lock(lock)
        .with_status_broker(self.broker.clone())
        .spawn(self.broker.clone())
        .await?;
        self.consumers.insert(agent.id, handle);
        Ok(())
    }

    pub async fn stop_consumer(&mut self, agent_id: &AgentId, timeout: Duration) -> Result<()> {
        match self.consumers.remove(agent_id) {
            Some(handle) => handle.stop(timeout).await,
            None => Err(Error::AgentNotFound { id: *agent_id }),
        }
    }

    /// Stop the router, then every consumer. Returns the first failure.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<()> {
        let mut first_error = None;
        if let Some(router) = self.router.take() {
            if let Err(e) = router.stop(timeout).await {
                warn!(error = %e, "event router did not stop cleanly");
                first_error.get_or_insert(e);
            }
        }
        for (agent_id, handle) in self.consumers.drain() {
            if let Err(e) = handle.stop(timeout).await {
                warn!(%agent_id, error = %e, "consumer did not stop cleanly");
                first_error.get_or_insert(e);
            }
        }
        info!("runtime stopped");
        first_error.map_or(Ok(()), Err)
    }
}
