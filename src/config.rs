use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::broker::memory::DEFAULT_PARTITIONS;
use crate::consumer::ConsumerConfig;
use crate::core::{AgentRole, ProjectId};
use crate::dispatch::SelectionStrategy;
use crate::scheduler::SchedulerConfig;
use crate::skills::SkillRegistry;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Partitions per topic of the in-memory broker.
    pub partitions: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    pub selection: SelectionStrategy,
}

/// An agent created at startup by `agentflow serve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSeed {
    pub role: AgentRole,
    /// Agents without a project join the default project.
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    /// TOML file with extra `[[skills]]`, layered over the built-in set.
    pub skills_file: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentSeed>,
}

impl Config {
    pub fn agentflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".agentflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::agentflow_dir()?.join("agentflow.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            partitions = config.broker.partitions,
            max_concurrency = config.scheduler.max_concurrency,
            agents = config.agents.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::agentflow_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "creating agentflow directory");
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.partitions == 0 {
            return Err(Error::Validation("broker.partitions must be at least 1".to_string()));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(Error::Validation(
                "scheduler.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.consumer.failure_threshold == 0 {
            return Err(Error::Validation(
                "consumer.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Built-in skills plus any from `skills_file`.
    pub fn skill_registry(&self) -> Result<SkillRegistry> {
        let mut registry = SkillRegistry::builtin();
        if let Some(file) = &self.skills_file {
            for skill in SkillRegistry::load(&expand_tilde(file))?.skills() {
                registry.register(skill.clone());
            }
        }
        Ok(registry)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
