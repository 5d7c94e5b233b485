pub mod actor;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod conversation;
pub mod core;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod kanban;
pub mod log;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod skills;

pub use error::{Error, Result};
