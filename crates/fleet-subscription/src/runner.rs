//! Seam to the external workflow engine that executes process trees.

use serde_json::Value;

/// Scheduling priority handed to the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// What the runner reports after accepting (or refusing) a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    pub message: String,
}

impl RunOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// External process runner, injected so the ledger can be driven in tests.
///
/// Progress of a started process is owned by the runner; callers ask it by
/// handle instead of keeping their own copy of the status.
pub trait ProcessRunner: Send + Sync {
    /// Start the process graph stored under `handle`.
    fn run(&self, handle: &str, tree: &Value, priority: Priority) -> RunOutcome;
    /// Whether the process under `handle` is still executing.
    fn is_running(&self, handle: &str) -> bool;
}
