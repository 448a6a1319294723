//! Event type tags for the per-run log.
//!
//! Events are written once by the scheduler and tool invoker and read by
//! clients polling `events?since=N`.

use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Worktree prepared for the run.
    Setup,
    /// Assistant subprocess spawned.
    AiStart,
    /// Incremental assistant output.
    AiChunk,
    /// Assistant subprocess exited.
    AiEnd,
    /// Changes committed; message carries the commit SHA.
    Commit,
    /// Pull request opened; message carries the URL.
    Pr,
    /// Working tree was clean after the assistant finished.
    NoChanges,
    /// Run reached COMPLETED.
    Complete,
    /// Run failed; message carries the reason.
    Error,
    /// Emitted at startup for runs orphaned by a previous process.
    Recovery,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::AiStart => "ai_start",
            Self::AiChunk => "ai_chunk",
            Self::AiEnd => "ai_end",
            Self::Commit => "commit",
            Self::Pr => "pr",
            Self::NoChanges => "no_changes",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
