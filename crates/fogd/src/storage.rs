//! SQLite storage for the Fog daemon.
//!
//! The store exclusively owns the database handle; all mutators in the
//! daemon go through it. Run state changes use compare-and-swap on the
//! `state` column so a stale supervisor cannot clobber a later one, and
//! event sequence numbers are assigned atomically per run.

use chrono::{DateTime, Utc};
use fog_core::{EventType, Id, RepoRecord, Run, RunEvent, RunState, Session, SessionStatus, ToolKind};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("repo not found: {0}")]
    RepoNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("stale run state: {run_id} is not {expected}")]
    StaleState { run_id: String, expected: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Enable WAL mode
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations to initialize/update the schema.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            // Ignore expected idempotent errors.
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Repo operations ---

    /// Insert or update a repo record, keyed by canonical name.
    pub async fn upsert_repo(&self, repo: &RepoRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repos (name, url, host, owner, repo, bare_path, base_path, default_branch)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(name) DO UPDATE SET
                url = excluded.url,
                host = excluded.host,
                bare_path = excluded.bare_path,
                base_path = excluded.base_path,
                default_branch = excluded.default_branch
            "#,
        )
        .bind(&repo.name)
        .bind(&repo.url)
        .bind(&repo.host)
        .bind(&repo.owner)
        .bind(&repo.repo)
        .bind(&repo.bare_path)
        .bind(&repo.base_path)
        .bind(&repo.default_branch)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a repo by canonical name.
    pub async fn get_repo(&self, name: &str) -> Result<RepoRecord> {
        let row = sqlx::query_as::<_, RepoRow>("SELECT * FROM repos WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RepoNotFound(name.to_string()))?;

        Ok(row.into_record())
    }

    /// List all registered repos.
    pub async fn list_repos(&self) -> Result<Vec<RepoRecord>> {
        let rows = sqlx::query_as::<_, RepoRow>("SELECT * FROM repos ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(RepoRow::into_record).collect())
    }

    // --- Session operations ---

    /// Insert a new session.
    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, repo_name, branch, tool, status, busy, autopr, pr_url,
                                  worktree, continuation_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(session.id.as_ref())
        .bind(&session.repo_name)
        .bind(&session.branch)
        .bind(session.tool.as_str())
        .bind(session.status.as_str())
        .bind(i64::from(session.busy))
        .bind(i64::from(session.autopr))
        .bind(&session.pr_url)
        .bind(&session.worktree)
        .bind(&session.continuation_id)
        .bind(session.created_at.timestamp_millis())
        .bind(session.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &Id) -> Result<Session> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::SessionNotFound(id.to_string()))?;

        Ok(row.into_session())
    }

    /// List sessions, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let rows =
            sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(SessionRow::into_session).collect())
    }

    /// Atomically claim a session for a new run.
    ///
    /// Returns false when the session is already busy.
    pub async fn try_claim_session(&self, id: &Id) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE sessions SET busy = 1, status = ?1, updated_at = ?2 \
             WHERE id = ?3 AND busy = 0 AND status != 'ARCHIVED'",
        )
        .bind(SessionStatus::Running.as_str())
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release a session after its run reaches a terminal state.
    pub async fn release_session(&self, id: &Id, status: SessionStatus) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE sessions SET busy = 0, status = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record the session worktree path.
    pub async fn set_session_worktree(&self, id: &Id, worktree: &str) -> Result<()> {
        self.update_session_field(id, "worktree", Some(worktree))
            .await
    }

    /// Record the assistant conversation token for follow-up runs.
    pub async fn set_session_continuation(&self, id: &Id, continuation_id: &str) -> Result<()> {
        self.update_session_field(id, "continuation_id", Some(continuation_id))
            .await
    }

    /// Record the pull request URL.
    pub async fn set_session_pr_url(&self, id: &Id, pr_url: &str) -> Result<()> {
        self.update_session_field(id, "pr_url", Some(pr_url)).await
    }

    async fn update_session_field(
        &self,
        id: &Id,
        column: &'static str,
        value: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let query = format!("UPDATE sessions SET {column} = ?1, updated_at = ?2 WHERE id = ?3");
        let result = sqlx::query(&query)
            .bind(value)
            .bind(now)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Archive a session. Archived sessions accept no further runs.
    pub async fn archive_session(&self, id: &Id) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE sessions SET status = 'ARCHIVED', busy = 0, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Run operations ---

    /// Insert a new run.
    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, session_id, prompt, state, summary, commit_sha, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(run.session_id.as_ref())
        .bind(&run.prompt)
        .bind(run.state.as_str())
        .bind(&run.summary)
        .bind(&run.commit_sha)
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;

        Ok(row.into_run())
    }

    /// List runs for a session in enqueue order.
    pub async fn list_runs_for_session(&self, session_id: &Id) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    /// List every run in a non-terminal state (startup recovery scan).
    pub async fn list_nonterminal_runs(&self) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE state NOT IN ('COMPLETED', 'FAILED', 'CANCELED') \
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    /// Advance a run's state with compare-and-swap on the current state.
    pub async fn advance_run_state(&self, id: &Id, from: RunState, to: RunState) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("UPDATE runs SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4")
                .bind(to.as_str())
                .bind(now)
                .bind(id.as_ref())
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing run from a lost CAS race.
            self.get_run(id).await?;
            return Err(StorageError::StaleState {
                run_id: id.to_string(),
                expected: from.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Move a run to a terminal state with an exit summary.
    ///
    /// Used for failure and cancellation paths where the source state may
    /// vary; terminal runs are never overwritten.
    pub async fn finish_run(&self, id: &Id, state: RunState, summary: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE runs SET state = ?1, summary = ?2, updated_at = ?3 \
             WHERE id = ?4 AND state NOT IN ('COMPLETED', 'FAILED', 'CANCELED')",
        )
        .bind(state.as_str())
        .bind(summary)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.get_run(id).await?;
        }
        Ok(())
    }

    /// Record the commit SHA produced by the post-run pipeline.
    pub async fn set_run_commit(&self, id: &Id, sha: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("UPDATE runs SET commit_sha = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(sha)
                .bind(now)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Event operations ---

    /// Append an event, returning the assigned sequence number.
    ///
    /// The sequence is computed and inserted in one statement; SQLite's
    /// single-writer discipline keeps numbers contiguous under concurrency.
    pub async fn append_event(
        &self,
        run_id: &Id,
        event_type: EventType,
        message: &str,
        payload: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO events (run_id, seq, ts, type, message, payload)
            VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE run_id = ?1),
                    ?2, ?3, ?4, ?5)
            RETURNING seq
            "#,
        )
        .bind(run_id.as_ref())
        .bind(now)
        .bind(event_type.as_str())
        .bind(message)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(seq)
    }

    /// List events for a run with seq greater than `since`, in seq order.
    pub async fn list_events_since(&self, run_id: &Id, since: i64) -> Result<Vec<RunEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )
        .bind(run_id.as_ref())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    /// Get a session with all of its runs in enqueue order.
    pub async fn get_session_bundle(&self, id: &Id) -> Result<(Session, Vec<Run>)> {
        let session = self.get_session(id).await?;
        let runs = self.list_runs_for_session(id).await?;
        Ok((session, runs))
    }

    // --- Settings and secrets ---

    /// Set a settings key.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a settings key.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<(String,)> =
            sqlx::query_as("SELECT value FROM settings WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(|(v,)| v))
    }

    /// List all settings.
    pub async fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM settings ORDER BY key")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Store a secret's ciphertext.
    pub async fn put_secret(&self, key: &str, ciphertext: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO secrets (key, ciphertext) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET ciphertext = excluded.ciphertext",
        )
        .bind(key)
        .bind(ciphertext)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a secret's ciphertext.
    pub async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT ciphertext FROM secrets WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(|(v,)| v))
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct RepoRow {
    name: String,
    url: String,
    host: String,
    owner: String,
    repo: String,
    bare_path: String,
    base_path: String,
    default_branch: String,
}

impl RepoRow {
    fn into_record(self) -> RepoRecord {
        RepoRecord {
            name: self.name,
            url: self.url,
            host: self.host,
            owner: self.owner,
            repo: self.repo,
            bare_path: self.bare_path,
            base_path: self.base_path,
            default_branch: self.default_branch,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    repo_name: String,
    branch: String,
    tool: String,
    status: String,
    busy: i64,
    autopr: i64,
    pr_url: Option<String>,
    worktree: Option<String>,
    continuation_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl SessionRow {
    fn into_session(self) -> Session {
        Session {
            id: Id::from_string(self.id),
            repo_name: self.repo_name,
            branch: self.branch,
            tool: ToolKind::parse(&self.tool).unwrap_or(ToolKind::Claude),
            status: SessionStatus::parse(&self.status).unwrap_or(SessionStatus::Failed),
            busy: self.busy != 0,
            autopr: self.autopr != 0,
            pr_url: self.pr_url,
            worktree: self.worktree,
            continuation_id: self.continuation_id,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    session_id: String,
    prompt: String,
    state: String,
    summary: Option<String>,
    commit_sha: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> Run {
        Run {
            id: Id::from_string(self.id),
            session_id: Id::from_string(self.session_id),
            prompt: self.prompt,
            state: RunState::parse(&self.state).unwrap_or(RunState::Failed),
            summary: self.summary,
            commit_sha: self.commit_sha,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    run_id: String,
    seq: i64,
    ts: i64,
    #[sqlx(rename = "type")]
    event_type: String,
    message: String,
    payload: Option<String>,
}

impl EventRow {
    fn into_event(self) -> RunEvent {
        RunEvent {
            run_id: Id::from_string(self.run_id),
            seq: self.seq,
            ts: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            event_type: self.event_type,
            message: self.message,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn test_repo() -> RepoRecord {
        RepoRecord {
            name: "acme/api".to_string(),
            url: "https://github.com/acme/api.git".to_string(),
            host: "github.com".to_string(),
            owner: "acme".to_string(),
            repo: "api".to_string(),
            bare_path: "/fog/repos/acme/api/repo.git".to_string(),
            base_path: "/fog/repos/acme/api/base".to_string(),
            default_branch: "main".to_string(),
        }
    }

    fn test_session(repo_name: &str) -> Session {
        let now = Utc::now();
        Session {
            id: Id::new(),
            repo_name: repo_name.to_string(),
            branch: "fog/add-health-endpoint".to_string(),
            tool: ToolKind::Cursor,
            status: SessionStatus::Idle,
            busy: false,
            autopr: false,
            pr_url: None,
            worktree: None,
            continuation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_run(session_id: &Id) -> Run {
        let now = Utc::now();
        Run {
            id: Id::new(),
            session_id: session_id.clone(),
            prompt: "Add health endpoint".to_string(),
            state: RunState::Created,
            summary: None,
            commit_sha: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_repo_is_idempotent() {
        let ts = create_test_storage().await;
        let mut repo = test_repo();

        ts.storage.upsert_repo(&repo).await.unwrap();
        repo.default_branch = "develop".to_string();
        ts.storage.upsert_repo(&repo).await.unwrap();

        let fetched = ts.storage.get_repo("acme/api").await.unwrap();
        assert_eq!(fetched.default_branch, "develop");
        assert_eq!(ts.storage.list_repos().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_repo_not_found() {
        let ts = create_test_storage().await;
        let result = ts.storage.get_repo("none/such").await;
        assert!(matches!(result, Err(StorageError::RepoNotFound(_))));
    }

    #[tokio::test]
    async fn insert_and_get_session() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");

        ts.storage.insert_session(&session).await.unwrap();
        let fetched = ts.storage.get_session(&session.id).await.unwrap();

        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.repo_name, "acme/api");
        assert_eq!(fetched.tool, ToolKind::Cursor);
        assert_eq!(fetched.status, SessionStatus::Idle);
        assert!(!fetched.busy);
    }

    #[tokio::test]
    async fn claim_session_is_exclusive() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();

        assert!(ts.storage.try_claim_session(&session.id).await.unwrap());
        // Second claim while busy must lose.
        assert!(!ts.storage.try_claim_session(&session.id).await.unwrap());

        ts.storage
            .release_session(&session.id, SessionStatus::Completed)
            .await
            .unwrap();
        assert!(ts.storage.try_claim_session(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn archived_session_cannot_be_claimed() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();

        ts.storage.archive_session(&session.id).await.unwrap();
        assert!(!ts.storage.try_claim_session(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn session_field_updates_round_trip() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();

        ts.storage
            .set_session_worktree(&session.id, "/fog/repos/acme/api/sessions/s1")
            .await
            .unwrap();
        ts.storage
            .set_session_continuation(&session.id, "sess-123")
            .await
            .unwrap();
        ts.storage
            .set_session_pr_url(&session.id, "https://github.com/acme/api/pull/7")
            .await
            .unwrap();

        let fetched = ts.storage.get_session(&session.id).await.unwrap();
        assert_eq!(
            fetched.worktree.as_deref(),
            Some("/fog/repos/acme/api/sessions/s1")
        );
        assert_eq!(fetched.continuation_id.as_deref(), Some("sess-123"));
        assert_eq!(
            fetched.pr_url.as_deref(),
            Some("https://github.com/acme/api/pull/7")
        );
    }

    #[tokio::test]
    async fn advance_run_state_cas() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();
        let run = test_run(&session.id);
        ts.storage.insert_run(&run).await.unwrap();

        ts.storage
            .advance_run_state(&run.id, RunState::Created, RunState::Setup)
            .await
            .unwrap();

        // Stale transition from the old state must fail.
        let stale = ts
            .storage
            .advance_run_state(&run.id, RunState::Created, RunState::AiRunning)
            .await;
        assert!(matches!(stale, Err(StorageError::StaleState { .. })));

        let fetched = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(fetched.state, RunState::Setup);
    }

    #[tokio::test]
    async fn finish_run_does_not_clobber_terminal_state() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();
        let run = test_run(&session.id);
        ts.storage.insert_run(&run).await.unwrap();

        ts.storage
            .finish_run(&run.id, RunState::Canceled, "canceled by user")
            .await
            .unwrap();
        ts.storage
            .finish_run(&run.id, RunState::Failed, "late failure")
            .await
            .unwrap();

        let fetched = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(fetched.state, RunState::Canceled);
        assert_eq!(fetched.summary.as_deref(), Some("canceled by user"));
    }

    #[tokio::test]
    async fn append_event_assigns_contiguous_seq() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();
        let run = test_run(&session.id);
        ts.storage.insert_run(&run).await.unwrap();

        for i in 1..=5 {
            let seq = ts
                .storage
                .append_event(&run.id, EventType::AiChunk, &format!("chunk {i}"), None)
                .await
                .unwrap();
            assert_eq!(seq, i);
        }

        let events = ts.storage.list_events_since(&run.id, 0).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn append_event_seq_is_per_run() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();
        let run_a = test_run(&session.id);
        let run_b = test_run(&session.id);
        ts.storage.insert_run(&run_a).await.unwrap();
        ts.storage.insert_run(&run_b).await.unwrap();

        ts.storage
            .append_event(&run_a.id, EventType::Setup, "a", None)
            .await
            .unwrap();
        let seq_b = ts
            .storage
            .append_event(&run_b.id, EventType::Setup, "b", None)
            .await
            .unwrap();

        assert_eq!(seq_b, 1);
    }

    #[tokio::test]
    async fn concurrent_appends_stay_contiguous() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();
        let run = test_run(&session.id);
        ts.storage.insert_run(&run).await.unwrap();

        let storage = std::sync::Arc::new(ts.storage);
        let mut handles = Vec::new();
        for i in 0..20 {
            let storage = std::sync::Arc::clone(&storage);
            let run_id = run.id.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .append_event(&run_id, EventType::AiChunk, &format!("c{i}"), None)
                    .await
                    .unwrap()
            }));
        }
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn list_events_since_filters() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();
        let run = test_run(&session.id);
        ts.storage.insert_run(&run).await.unwrap();

        for i in 0..4 {
            ts.storage
                .append_event(&run.id, EventType::AiChunk, &format!("c{i}"), None)
                .await
                .unwrap();
        }

        let tail = ts.storage.list_events_since(&run.id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 3);
        assert_eq!(tail[1].seq, 4);
    }

    #[tokio::test]
    async fn session_bundle_orders_runs_by_enqueue() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();

        let now = Utc::now();
        for (i, offset) in [0i64, 100, 200].iter().enumerate() {
            let run = Run {
                id: Id::from_string(format!("run-{i}")),
                session_id: session.id.clone(),
                prompt: format!("prompt {i}"),
                state: RunState::Created,
                summary: None,
                commit_sha: None,
                created_at: now + chrono::Duration::milliseconds(*offset),
                updated_at: now,
            };
            ts.storage.insert_run(&run).await.unwrap();
        }

        let (_, runs) = ts.storage.get_session_bundle(&session.id).await.unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_ref()).collect();
        assert_eq!(ids, vec!["run-0", "run-1", "run-2"]);
    }

    #[tokio::test]
    async fn nonterminal_scan_skips_finished_runs() {
        let ts = create_test_storage().await;
        ts.storage.upsert_repo(&test_repo()).await.unwrap();
        let session = test_session("acme/api");
        ts.storage.insert_session(&session).await.unwrap();

        let running = test_run(&session.id);
        ts.storage.insert_run(&running).await.unwrap();
        ts.storage
            .advance_run_state(&running.id, RunState::Created, RunState::Setup)
            .await
            .unwrap();

        let finished = test_run(&session.id);
        ts.storage.insert_run(&finished).await.unwrap();
        ts.storage
            .finish_run(&finished.id, RunState::Completed, "done")
            .await
            .unwrap();

        let open = ts.storage.list_nonterminal_runs().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, running.id);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let ts = create_test_storage().await;
        assert_eq!(ts.storage.get_setting("default_tool").await.unwrap(), None);

        ts.storage.set_setting("default_tool", "cursor").await.unwrap();
        ts.storage.set_setting("branch_prefix", "fog").await.unwrap();
        ts.storage.set_setting("default_tool", "claude").await.unwrap();

        assert_eq!(
            ts.storage.get_setting("default_tool").await.unwrap(),
            Some("claude".to_string())
        );
        let all = ts.storage.list_settings().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn secrets_round_trip() {
        let ts = create_test_storage().await;
        ts.storage.put_secret("github_token", b"ciphertext").await.unwrap();
        assert_eq!(
            ts.storage.get_secret("github_token").await.unwrap(),
            Some(b"ciphertext".to_vec())
        );
        assert_eq!(ts.storage.get_secret("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();

        storage.migrate_embedded().await.unwrap();
        storage.migrate_embedded().await.unwrap();

        storage.upsert_repo(&test_repo()).await.unwrap();
    }
}
