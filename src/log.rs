//! Logging setup for agentflow.
//!
//! Log levels:
//! - ERROR: an agent entered the error state, a route handler failed
//! - WARN: unmatched events, failed publishes, failed steps
//! - INFO: task lifecycle, dispatches, admission rejections
//! - DEBUG: selection decisions, broker commits, layer scheduling
//!
//! Debug mode can be enabled with the `--debug` flag or `AGENTFLOW_DEBUG=1`.
//! `RUST_LOG` overrides both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "AGENTFLOW_DEBUG";

/// Path of the log file, `~/.agentflow/agentflow.log`.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".agentflow").join("agentflow.log"))
}

/// Whether debug logging was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "agentflow=debug"
    } else {
        "agentflow=info"
    }
}

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

/// Install the global subscriber.
///
/// The log file is truncated on startup. Without a home directory, or when
/// the file cannot be created, logs go to stderr.
pub fn init(debug: bool) {
    let filter = filter(debug || env_debug());

    let file = log_path().and_then(|path| {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).ok()?;
        }
        File::create(&path).ok()
    });

    let result = match file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    installed(result);
}

type InitResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;

/// Report whether our subscriber became the global one.
///
/// Failing means another subscriber was installed first (an embedding
/// application, or an earlier test); that one keeps receiving events.
fn installed(result: InitResult) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "global subscriber already set, keeping it");
            false
        }
    }
}
