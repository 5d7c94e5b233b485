//! Layer priorities and grouping of plan steps into layers.
//!
//! Every step gets a priority from its file path. Lower priorities run
//! first: schema, types, shared library, API, UI actions, components, pages.
//! A step is pushed past every step it depends on, so a page that imports a
//! component built in the same plan lands in a later layer than that component.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{ImplementationPlan, ImplementationStep, PlanGraph, StepId};
use crate::Result;

/// Ordering key of a layer, displayed as `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerPriority {
    pub major: u16,
    pub minor: u16,
}

impl LayerPriority {
    pub const SCHEMA: Self = Self::new(1, 0);
    pub const TYPES: Self = Self::new(2, 0);
    pub const SHARED_LIBRARY: Self = Self::new(3, 0);
    pub const API: Self = Self::new(4, 0);
    pub const UI_ACTION: Self = Self::new(5, 0);
    /// Primitives under `components/ui/`.
    pub const COMPONENT_PRIMITIVE: Self = Self::new(6, 0);
    /// Composed components, which may import primitives.
    pub const COMPONENT: Self = Self::new(6, 1);
    pub const PAGE: Self = Self::new(7, 0);
    /// Files the table does not recognise.
    pub const UNCLASSIFIED: Self = Self::UI_ACTION;

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// The smallest priority that still sorts after `self`.
    pub fn next_minor(self) -> Self {
        Self::new(self.major, self.minor + 1)
    }
}

impl std::fmt::Display for LayerPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Path rules, first match wins: `src/lib/api/` is API, not shared library.
static LAYER_RULES: LazyLock<Vec<(Regex, LayerPriority)>> = LazyLock::new(|| {
    [
        (
            r"(^|/)(prisma|migrations?|db/schema)(/|$)|(^|/)schema\.(prisma|sql|graphql)$|\.sql$",
            LayerPriority::SCHEMA,
        ),
        (r"(^|/)api(/|$)|(^|/)routes?(/|$)|(^|/)route\.(ts|js)$", LayerPriority::API),
        (r"(^|/)(types?|interfaces|models)/|\.d\.ts$|(^|/)types\.(ts|js)$", LayerPriority::TYPES),
        (r"(^|/)components/ui/", LayerPriority::COMPONENT_PRIMITIVE),
        (r"(^|/)components/", LayerPriority::COMPONENT),
        (
            r"(^|/)(actions|hooks|stores?|context)/|(^|/)actions?\.(ts|js)$",
            LayerPriority::UI_ACTION,
        ),
        (r"(^|/)(lib|utils?|helpers|services|shared|config)/", LayerPriority::SHARED_LIBRARY),
        (
            r"(^|/)pages/|(^|/)app/(.*/)?(page|layout)\.(tsx|jsx|ts|js)$",
            LayerPriority::PAGE,
        ),
    ]
    .into_iter()
    .map(|(pattern, priority)| (Regex::new(pattern).expect("valid layer pattern"), priority))
    .collect()
});

/// Normalize a path for matching and comparison.
///
/// Uses forward slashes, drops a leading `./` and repeated separators.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let trimmed = unified.trim_start_matches("./");
    trimmed
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Base priority for a file path.
pub fn layer_priority(file_path: &str) -> LayerPriority {
    let path = normalize_path(file_path).to_lowercase();
    LAYER_RULES
        .iter()
        .find(|(pattern, _)| pattern.is_match(&path))
        .map(|(_, priority)| *priority)
        .unwrap_or(LayerPriority::UNCLASSIFIED)
}

/// Steps that run together between two barriers.
#[derive(Debug, Clone)]
pub struct Layer {
    pub priority: LayerPriority,
    /// Sorted by `order`.
    pub steps: Vec<ImplementationStep>,
}

impl Layer {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_ids(&self) -> Vec<&StepId> {
        self.steps.iter().map(|s| &s.id).collect()
    }
}

/// Effective priority of every step after honouring `depends_on`.
pub fn effective_priorities(plan: &ImplementationPlan) -> Result<HashMap<StepId, LayerPriority>> {
    let graph = PlanGraph::build(plan)?;
    let base: HashMap<&StepId, LayerPriority> = plan
        .steps
        .iter()
        .map(|s| (&s.id, layer_priority(&s.file_path)))
        .collect();

    let mut effective: HashMap<StepId, LayerPriority> = HashMap::new();
    for id in graph.topological_order()? {
        let mut priority = base[id];
        for dep in graph.dependencies(id) {
            if let Some(dep_priority) = effective.get(dep) {
                priority = priority.max(dep_priority.next_minor());
            }
        }
        effective.insert(id.clone(), priority);
    }
    Ok(effective)
}

/// Group a plan into layers, ordered by ascending priority.
pub fn group_steps_by_layer(plan: &ImplementationPlan) -> Result<Vec<Layer>> {
    let priorities = effective_priorities(plan)?;
    let mut buckets: BTreeMap<LayerPriority, Vec<ImplementationStep>> = BTreeMap::new();
    for step in plan.ordered_steps() {
        let priority = priorities
            .get(&step.id)
            .copied()
            .unwrap_or(LayerPriority::UNCLASSIFIED);
        buckets.entry(priority).or_default().push(step.clone());
    }
    Ok(buckets
        .into_iter()
        .map(|(priority, steps)| Layer { priority, steps })
        .collect())
}
