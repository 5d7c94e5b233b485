//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A broker, agent directory and stores wired together (`Harness`)
//! - Task handlers that record order and detect overlap
//! - Step runners that detect concurrent writes to one file
//! - Predefined implementation plans

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use agentflow::broker::{publish_json, MemoryBroker};
use agentflow::consumer::{AgentConsumer, AgentToolContext, ConsumerConfig, TaskHandler};
use agentflow::conversation::{InMemoryArtifactStore, InMemoryConversationLog};
use agentflow::core::{
    Agent, AgentId, AgentRole, EventType, ImplementationPlan, ImplementationStep, InboundEvent,
    ProjectId, RoutedTask, TaskId,
};
use agentflow::directory::{AgentDirectory, InMemoryAgentDirectory};
use agentflow::dispatch::TaskDispatcher;
use agentflow::router::EventRouter;
use agentflow::scheduler::{ExecutionContext, StepOutput, StepRunner};
use agentflow::skills::SkillRegistry;
use agentflow::{Error, Result};

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while !check().await {
        assert!(Instant::now() < deadline, "condition not met within {:?}", WAIT);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A broker, directory and stores for one project.
pub struct Harness {
    pub broker: MemoryBroker,
    pub directory: Arc<InMemoryAgentDirectory>,
    pub conversations: Arc<InMemoryConversationLog>,
    pub artifacts: Arc<InMemoryArtifactStore>,
    pub project: ProjectId,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(4),
            directory: Arc::new(InMemoryAgentDirectory::new()),
            conversations: Arc::new(InMemoryConversationLog::new()),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
            project: ProjectId::new(),
        }
    }

    pub async fn agent(&self, role: AgentRole) -> AgentId {
        self.directory.register(Agent::new(self.project, role)).await
    }

    pub fn dispatcher(&self) -> Arc<TaskDispatcher> {
        Arc::new(TaskDispatcher::new(
            Arc::new(self.broker.clone()),
            self.directory.clone(),
        ))
    }

    pub fn router(&self) -> EventRouter {
        EventRouter::with_default_handlers(self.dispatcher())
    }

    pub async fn consumer(&self, agent_id: AgentId, handler: Arc<dyn TaskHandler>) -> AgentConsumer {
        let agent = self
            .directory
            .get(&agent_id)
            .await
            .expect("agent registered");
        AgentConsumer::new(
            &agent,
            self.directory.clone(),
            handler,
            self.conversations.clone(),
            self.artifacts.clone(),
        )
        .with_config(ConsumerConfig::default())
        .with_status_broker(Arc::new(self.broker.clone()))
    }

    pub fn event(&self, event_type: EventType) -> InboundEvent {
        InboundEvent::new(event_type, self.project)
    }

    /// Publish an event on the topic of its type.
    pub async fn publish(&self, event: &InboundEvent) {
        publish_json(&self.broker, event.event_type.topic(), None, event)
            .await
            .expect("publish event");
    }

    /// Every task published on `agent-tasks`, decoded.
    pub fn routed_tasks(&self) -> Vec<RoutedTask> {
        self.broker
            .messages(agentflow::broker::topics::AGENT_TASKS)
            .iter()
            .map(|m| m.decode().expect("routed task"))
            .collect()
    }
}

/// One handler invocation.
#[derive(Debug, Clone)]
pub struct Execution {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub sequence: Option<u64>,
}

/// Handler that records every execution and the peak number of
/// simultaneous executions per agent.
#[derive(Default)]
pub struct RecordingHandler {
    delay: Duration,
    executions: Mutex<Vec<Execution>>,
    active: Mutex<HashMap<AgentId, usize>>,
    max_active: AtomicUsize,
    fail_all: bool,
}

impl RecordingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Default::default()
        }
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    /// Highest number of tasks seen running at once for any single agent.
    pub fn max_active_per_agent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, task: &RoutedTask, tools: &AgentToolContext) -> Result<()> {
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(task.agent_id).or_insert(0);
            *count += 1;
            self.max_active.fetch_max(*count, Ordering::SeqCst);
        }
        self.executions.lock().unwrap().push(Execution {
            agent_id: task.agent_id,
            task_id: task.task_id,
            sequence: task.context.get("sequence").and_then(|v| v.as_u64()),
        });

        tokio::time::sleep(self.delay).await;
        let result = if self.fail_all {
            Err(Error::Handler(format!("{} failed", task.task_type)))
        } else {
            tools
                .send_message(&format!("finished {}", task.task_type))
                .await
                .map(|_| ())
        };

        *self.active.lock().unwrap().get_mut(&task.agent_id).expect("active entry") -= 1;
        result
    }
}

/// Handler that posts a message, asks a question and writes an artifact,
/// then optionally stalls as if its process died mid-task.
#[derive(Default)]
pub struct ReportingHandler {
    stall: Option<Duration>,
    runs: AtomicUsize,
}

impl ReportingHandler {
    pub fn stalling(stall: Duration) -> Self {
        Self {
            stall: Some(stall),
            ..Default::default()
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for ReportingHandler {
    async fn handle(&self, task: &RoutedTask, tools: &AgentToolContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tools.send_message(&format!("working on {}", task.task_type)).await?;
        tools.ask_question("which email provider?").await?;
        tools
            .create_artifact("design.md", "document", "# Password reset")
            .await?;
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        Ok(())
    }
}

/// Step runner that fails the test run if two steps write one file at once.
#[derive(Default)]
pub struct FileWriteRunner {
    delay: Duration,
    writers: Mutex<HashMap<String, usize>>,
    races: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    log: Mutex<Vec<String>>,
    fail: Vec<String>,
}

impl FileWriteRunner {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing(mut self, step_id: &str) -> Self {
        self.fail.push(step_id.to_string());
        self
    }

    pub fn races(&self) -> usize {
        self.races.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Position of a `start:<id>` or `end:<id>` entry.
    pub fn position(&self, entry: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} not logged", entry))
    }
}

#[async_trait]
impl StepRunner for FileWriteRunner {
    async fn run_step(&self, step: &ImplementationStep, _ctx: &ExecutionContext) -> Result<StepOutput> {
        let path = step.file_path.clone();
        {
            let mut writers = self.writers.lock().unwrap();
            let count = writers.entry(path.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.races.fetch_add(1, Ordering::SeqCst);
            }
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("start:{}", step.id));

        tokio::time::sleep(self.delay).await;

        self.log.lock().unwrap().push(format!("end:{}", step.id));
        self.active.fetch_sub(1, Ordering::SeqCst);
        *self.writers.lock().unwrap().get_mut(&path).expect("writer entry") -= 1;

        if self.fail.iter().any(|id| id == step.id.as_str()) {
            return Err(Error::Handler(format!("could not write {}", path)));
        }
        Ok(StepOutput {
            files_modified: vec![path],
            summary: None,
        })
    }
}

pub fn execution_context() -> Arc<ExecutionContext> {
    Arc::new(ExecutionContext::new(Arc::new(SkillRegistry::builtin())))
}

/// One schema file, two independent library files, an API route and a page.
pub fn five_step_plan() -> ImplementationPlan {
    ImplementationPlan::new(vec![
        ImplementationStep::new("schema", 1, "prisma/schema.prisma")
            .with_description("User and Session models"),
        ImplementationStep::new("lib-auth", 2, "src/lib/auth.ts").depends_on("schema"),
        ImplementationStep::new("lib-email", 3, "src/lib/email.ts").depends_on("schema"),
        ImplementationStep::new("api-users", 4, "src/app/api/users/route.ts")
            .depends_on("lib-auth"),
        ImplementationStep::new("page-users", 5, "src/app/users/page.tsx").depends_on("api-users"),
    ])
}
