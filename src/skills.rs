//! Skill selection for implementation steps.
//!
//! A skill is a capability profile (triggers, role, instructions, model tier)
//! matched against a step's file path and description. The registry is
//! read-only once built. Activations are cached per execution run by a
//! `SkillCache`, which the caller owns; there is no process-wide cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::AgentRole;
use crate::Result;

/// Relative cost/capability of the model a skill asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    #[default]
    Standard,
    Advanced,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Fast => write!(f, "fast"),
            ModelTier::Standard => write!(f, "standard"),
            ModelTier::Advanced => write!(f, "advanced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    /// Keywords matched case-insensitively against path and description.
    pub triggers: Vec<String>,
    pub role: AgentRole,
    #[serde(default)]
    pub prompt_fragments: Vec<String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub model_tier: ModelTier,
}

impl Skill {
    /// Number of triggers contained in the lowercase haystack.
    pub fn score(&self, haystack: &str) -> usize {
        self.triggers
            .iter()
            .filter(|t| !t.is_empty() && haystack.contains(&t.to_lowercase()))
            .count()
    }
}

/// Instructions produced by activating a skill.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillActivation {
    pub skill_id: String,
    pub role: AgentRole,
    pub model_tier: ModelTier,
    pub instructions: String,
}

#[derive(Debug, Deserialize)]
struct SkillFile {
    #[serde(default)]
    skills: Vec<Skill>,
}

/// Ordered set of skills. Registration order breaks scoring ties.
#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: Vec<Skill>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the default web-application skills.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for skill in builtin_skills() {
            registry.register(skill);
        }
        registry
    }

    /// Parse `[[skills]]` tables.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: SkillFile = toml::from_str(content)?;
        let mut registry = Self::new();
        for skill in file.skills {
            registry.register(skill);
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading skills");
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Add a skill. A skill with an existing id replaces it in place.
    pub fn register(&mut self, skill: Skill) {
        match self.skills.iter_mut().find(|s| s.id == skill.id) {
            Some(existing) => *existing = skill,
            None => self.skills.push(skill),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.id == id)
    }

    pub fn skills(&self) -> &[Skill] {
        &self.skills
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Best-matching skill for a file and description.
    ///
    /// Highest trigger count wins, the first registered wins a tie, and a
    /// zero score matches nothing.
    pub fn detect(&self, file_path: &str, description: &str) -> Option<&Skill> {
        let haystack = format!("{} {}", file_path, description).to_lowercase();
        let mut best: Option<(&Skill, usize)> = None;
        for skill in &self.skills {
            let score = skill.score(&haystack);
            if score == 0 {
                continue;
            }
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((skill, score));
            }
        }
        best.map(|(skill, _)| skill)
    }
}

/// Per-execution activation cache keyed by skill id.
#[derive(Debug, Default)]
pub struct SkillCache {
    activations: Mutex<HashMap<String, Arc<SkillActivation>>>,
    loads: AtomicUsize,
}

impl SkillCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a skill, reusing an earlier activation from this run.
    pub fn activate(&self, skill: &Skill) -> Arc<SkillActivation> {
        let mut activations = self.activations.lock();
        if let Some(existing) = activations.get(&skill.id) {
            return Arc::clone(existing);
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        let activation = Arc::new(SkillActivation {
            skill_id: skill.id.clone(),
            role: skill.role,
            model_tier: skill.model_tier,
            instructions: skill.prompt_fragments.join("\n\n"),
        });
        activations.insert(skill.id.clone(), Arc::clone(&activation));
        debug!(skill = %skill.id, "skill activated");
        activation
    }

    /// How many activations were built (cache misses).
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.activations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.lock().is_empty()
    }
}

fn skill(
    id: &str,
    namespace: &str,
    role: AgentRole,
    tier: ModelTier,
    triggers: &[&str],
    fragment: &str,
) -> Skill {
    Skill {
        id: id.to_string(),
        triggers: triggers.iter().map(|t| t.to_string()).collect(),
        role,
        prompt_fragments: vec![fragment.to_string()],
        namespace: namespace.to_string(),
        model_tier: tier,
    }
}

fn builtin_skills() -> Vec<Skill> {
    vec![
        skill(
            "database-schema",
            "data",
            AgentRole::Developer,
            ModelTier::Advanced,
            &["schema", "prisma", "migration", "table", "sql"],
            "Design the data model and keep migrations reversible.",
        ),
        skill(
            "api-route",
            "backend",
            AgentRole::Developer,
            ModelTier::Standard,
            &["api", "route", "endpoint", "handler", "request"],
            "Implement the endpoint with input validation and typed responses.",
        ),
        skill(
            "server-action",
            "backend",
            AgentRole::Developer,
            ModelTier::Standard,
            &["action", "mutation", "form", "server"],
            "Implement the server action and revalidate affected views.",
        ),
        skill(
            "ui-component",
            "frontend",
            AgentRole::Developer,
            ModelTier::Fast,
            &["component", "button", "modal", "card", "tsx"],
            "Build a reusable component with accessible markup.",
        ),
        skill(
            "page-route",
            "frontend",
            AgentRole::Developer,
            ModelTier::Standard,
            &["page", "layout", "view", "screen"],
            "Compose the page from existing components and data loaders.",
        ),
        skill(
            "test-suite",
            "quality",
            AgentRole::Tester,
            ModelTier::Fast,
            &["test", "spec", "assert", "coverage"],
            "Cover the acceptance criteria with focused tests.",
        ),
    ]
}
