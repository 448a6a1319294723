//! Session worktree lifecycle.
//!
//! Each session owns one worktree at `<repo>/sessions/<sessionID>` on the
//! session branch. Git serializes worktree mutations poorly, so all
//! operations against one bare repo go through a per-repo async mutex.

use crate::git::{self, GitError};
use fog_core::{is_protected_branch, RepoRecord, Session};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("branch name is protected: {0}")]
    ProtectedBranch(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Manager for session-scoped worktrees.
#[derive(Debug, Default)]
pub struct WorktreeManager {
    /// Per-bare-repo locks; guards git's own worktree bookkeeping.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn repo_lock(&self, bare_path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(bare_path.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Path of the worktree for a session.
    pub fn session_path(repo: &RepoRecord, session: &Session) -> PathBuf {
        Path::new(&repo.bare_path)
            .parent()
            .unwrap_or_else(|| Path::new(&repo.bare_path))
            .join("sessions")
            .join(session.id.as_ref())
    }

    /// Create (or reuse) the worktree for a session.
    ///
    /// The session branch is created from the repo's default branch the
    /// first time the session runs.
    pub async fn acquire(&self, repo: &RepoRecord, session: &Session) -> Result<PathBuf> {
        if is_protected_branch(&session.branch) {
            return Err(WorktreeError::ProtectedBranch(session.branch.clone()));
        }

        let lock = self.repo_lock(&repo.bare_path).await;
        let _guard = lock.lock().await;

        let bare = Path::new(&repo.bare_path);
        let path = Self::session_path(repo, session);

        if path.exists() {
            return Ok(path);
        }

        info!(
            session_id = %session.id,
            branch = %session.branch,
            path = %path.display(),
            "creating session worktree"
        );
        git::add_worktree_new_branch(bare, &path, &session.branch, &repo.default_branch)?;
        Ok(path)
    }

    /// Remove a session's worktree and, optionally, its branch.
    ///
    /// Branch deletion is configuration-gated; the default is to retain
    /// branches and garbage-collect later.
    pub async fn release(
        &self,
        repo: &RepoRecord,
        session: &Session,
        delete_branch: bool,
    ) -> Result<()> {
        let lock = self.repo_lock(&repo.bare_path).await;
        let _guard = lock.lock().await;

        let bare = Path::new(&repo.bare_path);
        let path = Self::session_path(repo, session);

        if path.exists() {
            git::remove_worktree_force(bare, &path)?;
        }

        if delete_branch {
            if let Err(e) = git::delete_branch(bare, &session.branch) {
                warn!(
                    session_id = %session.id,
                    branch = %session.branch,
                    error = %e,
                    "branch deletion failed"
                );
            }
        }

        Ok(())
    }
}
