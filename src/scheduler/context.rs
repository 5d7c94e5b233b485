//! State shared by every step of one plan execution.

use std::sync::Arc;

use crate::core::{ImplementationStep, TaskId};
use crate::skills::{SkillActivation, SkillCache, SkillRegistry};

/// Per-execution context handed to each step runner.
///
/// Owns the skill activation cache, so two executions never share
/// activations and nothing outlives the run.
pub struct ExecutionContext {
    pub task_id: Option<TaskId>,
    registry: Arc<SkillRegistry>,
    skills: SkillCache,
}

impl ExecutionContext {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self {
            task_id: None,
            registry,
            skills: SkillCache::new(),
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Detect and activate the skill for a step, if any matches.
    ///
    /// `StepRunner` implementations call this to get the instructions they
    /// prepend to the step prompt. Activations are shared within the run.
    pub fn skill_for(&self, step: &ImplementationStep) -> Option<Arc<SkillActivation>> {
        self.registry
            .detect(&step.file_path, &step.description)
            .map(|skill| self.skills.activate(skill))
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub fn skill_cache(&self) -> &SkillCache {
        &self.skills
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task_id", &self.task_id)
            .field("skills", &self.registry.len())
            .field("activations", &self.skills.len())
            .finish()
    }
}
