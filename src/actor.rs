//! Handles to long-running background loops.
//!
//! The event router and every agent consumer run as an independent tokio
//! task. Each one is spawned with a `CancellationToken` and hands back an
//! `ActorHandle` used for graceful shutdown.

use std::any::Any;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ActorHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the actor's task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the actor's task to exit.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| Error::TaskJoin(e.to_string())),
            None => Ok(()),
        }
    }

    /// Request shutdown and wait up to `timeout` for the actor to exit.
    pub async fn stop(self, timeout: Duration) -> Result<()> {
        self.shutdown();
        tokio::time::timeout(timeout, self.join())
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }
}

/// Describe a caught panic payload.
pub(crate) fn panic_message(what: &str, payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("{} panicked: {}", what, msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("{} panicked: {}", what, msg)
    } else {
        format!("{} panicked", what)
    }
}
