//! Post-run pipeline: detect changes, commit, push, optionally open a PR.
//!
//! Runs after the assistant exits, with the run in VALIDATING. Every state
//! transition is persisted before the next side effect. A failure in any
//! step surfaces the step name and leaves the worktree in place for
//! inspection.

use crate::git::{self, GitError};
use crate::storage::{Storage, StorageError};
use fog_core::{resolve_commit_title, EventType, Run, RunState, Session};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{step} failed: {source}")]
    Git {
        step: &'static str,
        #[source]
        source: GitError,
    },
    #[error("pr failed: {0}")]
    Pr(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PipelineError {
    /// Name of the pipeline step that failed.
    pub fn step(&self) -> &'static str {
        match self {
            Self::Git { step, .. } => step,
            Self::Pr(_) => "pr",
            Self::Storage(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Post-run finalization over a session worktree.
pub struct Pipeline {
    storage: Arc<Storage>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Finalize a run sitting in VALIDATING. Returns the terminal state
    /// reached (always COMPLETED on the Ok path).
    pub async fn finalize(
        &self,
        run: &Run,
        session: &Session,
        workdir: &Path,
        title_hint: Option<&str>,
    ) -> Result<RunState> {
        let clean = git::is_working_tree_clean(workdir)
            .map_err(|source| PipelineError::Git { step: "status", source })?;

        if clean {
            self.storage
                .append_event(&run.id, EventType::NoChanges, "working tree clean", None)
                .await?;
            self.storage
                .advance_run_state(&run.id, RunState::Validating, RunState::Completed)
                .await?;
            self.storage
                .append_event(&run.id, EventType::Complete, "run complete (no changes)", None)
                .await?;
            return Ok(RunState::Completed);
        }

        // Commit.
        let title = resolve_commit_title(title_hint.unwrap_or(""), &run.prompt);
        git::stage_all(workdir).map_err(|source| PipelineError::Git { step: "commit", source })?;
        git::commit(workdir, &title)
            .map_err(|source| PipelineError::Git { step: "commit", source })?;
        let sha = git::head_sha(workdir)
            .map_err(|source| PipelineError::Git { step: "commit", source })?;

        self.storage.set_run_commit(&run.id, &sha).await?;
        self.storage
            .advance_run_state(&run.id, RunState::Validating, RunState::Committed)
            .await?;
        self.storage
            .append_event(&run.id, EventType::Commit, &sha, None)
            .await?;
        info!(run_id = %run.id, sha = %sha, title = %title, "committed changes");

        // Push.
        git::push(workdir, &session.branch)
            .map_err(|source| PipelineError::Git { step: "push", source })?;

        let mut state = RunState::Committed;

        // Pull request.
        if session.autopr {
            let url = open_pull_request(workdir, &session.branch, &title, &pr_body(&run.prompt))?;
            self.storage
                .advance_run_state(&run.id, RunState::Committed, RunState::PrCreated)
                .await?;
            self.storage
                .append_event(&run.id, EventType::Pr, &url, None)
                .await?;
            self.storage.set_session_pr_url(&session.id, &url).await?;
            info!(run_id = %run.id, url = %url, "opened pull request");
            state = RunState::PrCreated;
        }

        self.storage
            .advance_run_state(&run.id, state, RunState::Completed)
            .await?;
        self.storage
            .append_event(&run.id, EventType::Complete, "run complete", None)
            .await?;

        Ok(RunState::Completed)
    }
}

/// Body for an auto-opened pull request.
fn pr_body(prompt: &str) -> String {
    format!("Automated change produced by Fog.\n\n## Prompt\n\n{}\n", prompt.trim())
}

/// Open a PR via the GitHub CLI, returning its URL.
fn open_pull_request(workdir: &Path, branch: &str, title: &str, body: &str) -> Result<String> {
    let output = Command::new("gh")
        .args(["pr", "create", "--head", branch, "--title", title, "--body", body])
        .current_dir(workdir)
        .output()
        .map_err(|e| PipelineError::Pr(format!("gh unavailable: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::Pr(stderr.trim().to_string()));
    }

    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if url.is_empty() {
        return Err(PipelineError::Pr("gh returned no PR URL".to_string()));
    }
    Ok(url)
}
