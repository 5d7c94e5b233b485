//! Core domain models for agentflow.
//!
//! This module contains the data structures shared by the router, the
//! per-agent consumers, the layer scheduler and the Kanban board: agents,
//! inbound events, routed tasks and implementation plans.

pub mod agent;
pub mod event;
pub mod plan;
pub mod task;

/// Declare a UUID-backed identifier newtype with short display and parsing.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            /// Create a new unique identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Return first 8 characters of the UUID for display.
            pub fn short(&self) -> String {
                self.0.to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }
    };
}

pub(crate) use uuid_id;

pub use agent::{Agent, AgentId, AgentRole, AgentStatus, ProjectId};
pub use event::{EventId, EventType, InboundEvent};
pub use plan::{ImplementationPlan, ImplementationStep, PlanGraph, StepAction, StepId};
pub use task::{RoutedTask, TaskId, TaskPriority, TaskRequest};
