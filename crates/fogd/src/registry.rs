//! Repo registry: maps `owner/name` to a managed bare clone and base worktree.
//!
//! Registration is re-entrant: existing clones and worktrees are reused,
//! and re-registering an already consistent repo is a no-op.

use crate::git::{self, GitError};
use crate::storage::{Storage, StorageError};
use fog_core::{split_repo_full_name, NamingError, RepoRecord};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid repo name: {0}")]
    InvalidName(#[from] NamingError),
    #[error("git unavailable: {0}")]
    VcsUnavailable(String),
    #[error("filesystem error: {0}")]
    Fs(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry over the managed repos directory.
pub struct Registry {
    storage: Arc<Storage>,
    repos_dir: PathBuf,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("repos_dir", &self.repos_dir)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(storage: Arc<Storage>, repos_dir: PathBuf) -> Self {
        Self { storage, repos_dir }
    }

    /// Register a repository, cloning and preparing its base worktree.
    ///
    /// Layout: `<repos_dir>/<owner>/<name>/{repo.git, base}`.
    pub async fn register(&self, full_name: &str, url: &str) -> Result<RepoRecord> {
        let (owner, repo) = split_repo_full_name(full_name)?;
        let name = format!("{owner}/{repo}");

        let repo_dir = self.repos_dir.join(&owner).join(&repo);
        let bare_path = repo_dir.join("repo.git");
        let base_path = repo_dir.join("base");

        std::fs::create_dir_all(&repo_dir)
            .map_err(|e| RegistryError::Fs(format!("create {}: {e}", repo_dir.display())))?;

        if !bare_path.exists() {
            info!(repo = %name, url = %url, "cloning bare repo");
            git::clone_bare(url, &bare_path).map_err(map_git_err)?;
        }

        let default_branch = git::detect_default_branch(&bare_path).map_err(map_git_err)?;

        if !base_path.exists() {
            info!(repo = %name, branch = %default_branch, "adding base worktree");
            git::add_worktree(&bare_path, &base_path, &default_branch).map_err(map_git_err)?;
        }

        let record = RepoRecord {
            name: name.clone(),
            url: url.to_string(),
            host: host_from_url(url),
            owner,
            repo,
            bare_path: bare_path.to_string_lossy().to_string(),
            base_path: base_path.to_string_lossy().to_string(),
            default_branch,
        };

        self.storage.upsert_repo(&record).await?;
        Ok(record)
    }

    /// Look up a registered repo by canonical name.
    pub async fn lookup(&self, full_name: &str) -> Result<Option<RepoRecord>> {
        match self.storage.get_repo(full_name).await {
            Ok(record) => Ok(Some(record)),
            Err(StorageError::RepoNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List every registered repo.
    pub async fn list(&self) -> Result<Vec<RepoRecord>> {
        Ok(self.storage.list_repos().await?)
    }
}

fn map_git_err(e: GitError) -> RegistryError {
    RegistryError::VcsUnavailable(e.to_string())
}

/// Extract the host segment from a clone URL.
///
/// Handles `https://host/...` and `git@host:...`; anything else (local
/// paths included) yields `local`.
fn host_from_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://")) {
        if let Some(host) = rest.split('/').next() {
            if !host.is_empty() {
                return host.to_string();
            }
        }
    }
    if let Some(rest) = url.strip_prefix("git@") {
        if let Some(host) = rest.split(':').next() {
            if !host.is_empty() {
                return host.to_string();
            }
        }
    }
    "local".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_origin() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# Origin").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "init"], vec!["branch", "-M", "main"]] {
            Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        dir
    }

    async fn setup_registry() -> (Registry, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("fog.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let registry = Registry::new(Arc::new(storage), dir.path().join("repos"));
        (registry, dir)
    }

    #[tokio::test]
    async fn register_clones_and_prepares_layout() {
        let origin = setup_origin();
        let (registry, home) = setup_registry().await;

        let record = registry
            .register("acme/api", origin.path().to_string_lossy().as_ref())
            .await
            .unwrap();

        assert_eq!(record.name, "acme/api");
        assert_eq!(record.owner, "acme");
        assert_eq!(record.repo, "api");
        assert_eq!(record.default_branch, "main");
        assert!(home.path().join("repos/acme/api/repo.git/HEAD").exists());
        assert!(home.path().join("repos/acme/api/base/README.md").exists());
    }

    #[tokio::test]
    async fn register_is_reentrant() {
        let origin = setup_origin();
        let (registry, _home) = setup_registry().await;
        let url = origin.path().to_string_lossy().to_string();

        let first = registry.register("acme/api", &url).await.unwrap();
        let second = registry.register("acme/api", &url).await.unwrap();

        assert_eq!(first.bare_path, second.bare_path);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn register_rejects_invalid_names() {
        let (registry, _home) = setup_registry().await;
        for bad in ["../repo", "./x", "a/b/c", "a/"] {
            let result = registry.register(bad, "https://example.com/x.git").await;
            assert!(
                matches!(result, Err(RegistryError::InvalidName(_))),
                "expected InvalidName for {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn register_surfaces_clone_failure() {
        let (registry, _home) = setup_registry().await;
        let result = registry
            .register("acme/api", "/nonexistent/origin/repo")
            .await;
        assert!(matches!(result, Err(RegistryError::VcsUnavailable(_))));
    }

    #[tokio::test]
    async fn lookup_returns_none_for_unknown() {
        let (registry, _home) = setup_registry().await;
        assert!(registry.lookup("none/such").await.unwrap().is_none());
    }

    #[test]
    fn host_parsing() {
        assert_eq!(host_from_url("https://github.com/acme/api.git"), "github.com");
        assert_eq!(host_from_url("git@github.com:acme/api.git"), "github.com");
        assert_eq!(host_from_url("/tmp/local/repo"), "local");
    }
}
