//! Core types for the Fog control plane.
//!
//! Sessions bind a repo, a branch, and a tool; runs are single
//! prompt-to-commit cycles inside a session; events are the append-only
//! per-run log streamed to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for sessions and runs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Run lifecycle state.
///
/// Forward transitions move left to right; any non-terminal state may
/// transition to FAILED or CANCELED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    Setup,
    AiRunning,
    Validating,
    Committed,
    PrCreated,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Setup => "SETUP",
            Self::AiRunning => "AI_RUNNING",
            Self::Validating => "VALIDATING",
            Self::Committed => "COMMITTED",
            Self::PrCreated => "PR_CREATED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(Self::Created),
            "SETUP" => Some(Self::Setup),
            "AI_RUNNING" => Some(Self::AiRunning),
            "VALIDATING" => Some(Self::Validating),
            "COMMITTED" => Some(Self::Committed),
            "PR_CREATED" => Some(Self::PrCreated),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Session lifecycle status.
///
/// Mirrors the latest run outcome; ARCHIVED is the only state reached
/// by explicit user action and is terminal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(Self::Idle),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Supported AI coding assistants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Cursor,
    Claude,
    Gemini,
    Aider,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cursor => "cursor",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Aider => "aider",
        }
    }

    /// Parse a tool name; `claude-code` is an accepted alias for claude.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cursor" => Some(Self::Cursor),
            "claude" | "claude-code" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            "aider" => Some(Self::Aider),
            _ => None,
        }
    }

    /// Detection order when no tool is requested.
    pub fn all() -> [Self; 4] {
        [Self::Cursor, Self::Claude, Self::Gemini, Self::Aider]
    }
}

// --- Core records ---

/// A registered repository with its managed clone layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRecord {
    /// Canonical `owner/name`.
    pub name: String,
    /// Clone URL.
    pub url: String,
    /// Hosting service (e.g. `github.com`).
    pub host: String,
    pub owner: String,
    pub repo: String,
    /// Path to the bare clone (`.../repo.git`).
    pub bare_path: String,
    /// Path to the base worktree checked out at the default branch.
    pub base_path: String,
    pub default_branch: String,
}

/// A long-lived conversation bound to one branch of one repo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Id,
    /// Canonical name of the registered repo.
    pub repo_name: String,
    /// Branch owned by this session.
    pub branch: String,
    pub tool: ToolKind,
    pub status: SessionStatus,
    /// True while a run on this session is non-terminal.
    pub busy: bool,
    /// Open a pull request after a successful push.
    pub autopr: bool,
    pub pr_url: Option<String>,
    /// Path to the session worktree, set on first acquire.
    pub worktree: Option<String>,
    /// Assistant-side conversation token, frozen at first capture.
    pub continuation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single prompt-to-commit unit inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub session_id: Id,
    pub prompt: String,
    pub state: RunState,
    /// Short human-readable exit summary.
    pub summary: Option<String>,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An ordered, immutable log entry for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Id,
    /// Contiguous per-run sequence number, starting at 1.
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub message: String,
    /// Opaque JSON payload.
    pub payload: Option<String>,
}
