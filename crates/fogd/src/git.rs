//! Git operations for the Fog daemon.
//!
//! All repository state lives in a managed bare clone per repo; session
//! checkouts are git worktrees of that bare clone. Everything shells out
//! to the `git` binary.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run a git command in `dir`, returning trimmed stdout.
fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Check whether the `git` binary is runnable at all.
pub fn is_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Clone a repository as a bare clone at `dest`.
pub fn clone_bare(url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("create clone parent: {e}")))?;
    }

    let output = Command::new("git")
        .args(["clone", "--bare", url])
        .arg(dest)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git clone --bare {url}: {}",
            stderr.trim()
        )));
    }

    Ok(())
}

/// Detect the default branch of a repository.
///
/// Reads `HEAD` first (correct for fresh bare clones), then checks for
/// `main` and `master`, defaulting to `main`.
pub fn detect_default_branch(repo: &Path) -> Result<String> {
    if let Ok(full_ref) = git(repo, &["symbolic-ref", "HEAD"]) {
        if let Some(branch) = full_ref.strip_prefix("refs/heads/") {
            if !branch.is_empty() {
                return Ok(branch.to_string());
            }
        }
    }

    if branch_exists(repo, "main")? {
        return Ok("main".to_string());
    }
    if branch_exists(repo, "master")? {
        return Ok("master".to_string());
    }

    Ok("main".to_string())
}

/// Check if a branch exists.
pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(repo)
        .output()?;

    Ok(output.status.success())
}

/// Create a new branch from base without checking it out.
pub fn create_branch(repo: &Path, branch: &str, base: &str) -> Result<()> {
    git(repo, &["branch", branch, base]).map(|_| ())
}

/// Force-delete a branch.
pub fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    git(repo, &["branch", "-D", branch]).map(|_| ())
}

/// Add a worktree at `path` for an existing branch.
pub fn add_worktree(repo: &Path, path: &Path, branch: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("create worktree parent: {e}")))?;
    }

    git(
        repo,
        &["worktree", "add", path.to_string_lossy().as_ref(), branch],
    )
    .map(|_| ())
}

/// Add a worktree at `path`, creating `branch` from `base` if missing.
pub fn add_worktree_new_branch(repo: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
    if !branch_exists(repo, branch)? {
        create_branch(repo, branch, base)?;
    }
    add_worktree(repo, path, branch)
}

/// Remove a worktree even when it has local changes.
pub fn remove_worktree_force(repo: &Path, path: &Path) -> Result<()> {
    git(
        repo,
        &[
            "worktree",
            "remove",
            "--force",
            path.to_string_lossy().as_ref(),
        ],
    )
    .map(|_| ())
}

/// Check if the working tree is clean (no uncommitted changes).
pub fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    let stdout = git(dir, &["status", "--porcelain"])?;
    Ok(stdout.is_empty())
}

/// Stage every change in the working tree.
pub fn stage_all(dir: &Path) -> Result<()> {
    git(dir, &["add", "-A"]).map(|_| ())
}

/// Create a commit with the given message.
pub fn commit(dir: &Path, message: &str) -> Result<()> {
    git(dir, &["commit", "-m", message]).map(|_| ())
}

/// Resolve the current HEAD commit SHA.
pub fn head_sha(dir: &Path) -> Result<String> {
    git(dir, &["rev-parse", "HEAD"])
}

/// Push a branch to origin.
pub fn push(dir: &Path, branch: &str) -> Result<()> {
    git(dir, &["push", "origin", branch]).map(|_| ())
}
