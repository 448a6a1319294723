//! Run scheduling and supervision.
//!
//! One logical FIFO per session, a global semaphore capping concurrently
//! active runs, and one supervisor task per dispatched run. Supervisors
//! drive the run state machine, persisting every transition before its
//! side effects, and append events at each step. Cancellation is
//! cooperative through a per-run token; expiry of the run deadline takes
//! the same path and lands in FAILED("timeout").

use crate::ai::{self, ExecuteRequest, InvokerError};
use crate::pipeline::Pipeline;
use crate::storage::{Storage, StorageError};
use crate::worktree::WorktreeManager;
use fog_core::{EventType, Id, Run, RunState, SessionStatus, ToolKind};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default cap on concurrently active runs.
pub const DEFAULT_MAX_PARALLEL: usize = 4;
/// Default per-run deadline.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Capacity of the per-run chunk-to-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub run_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

/// Options for submitting a run.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Append behind the session's current run instead of conflicting.
    pub queue: bool,
    /// Client idempotency nonce.
    pub nonce: Option<String>,
    /// Model override passed to the tool.
    pub model: Option<String>,
    /// Commit/PR title hint.
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
struct QueuedRun {
    run_id: Id,
    model: Option<String>,
    title: Option<String>,
}

#[derive(Default)]
struct SchedulerInner {
    /// Pending runs per session, FIFO.
    queues: HashMap<String, VecDeque<QueuedRun>>,
    /// Sessions with an active dispatcher task.
    dispatching: HashSet<String>,
    /// Cancellation token per in-flight run.
    tokens: HashMap<String, CancellationToken>,
    /// Idempotency key to run id.
    nonces: HashMap<String, Id>,
}

type ToolResolver = dyn Fn(ToolKind) -> Option<PathBuf> + Send + Sync;

/// The run scheduler.
pub struct Scheduler {
    storage: Arc<Storage>,
    worktrees: Arc<WorktreeManager>,
    pipeline: Pipeline,
    permits: Arc<Semaphore>,
    config: SchedulerConfig,
    inner: Mutex<SchedulerInner>,
    shutdown: CancellationToken,
    resolver: Box<ToolResolver>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        worktrees: Arc<WorktreeManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_tool_resolver(storage, worktrees, config, |kind| {
            ai::path::command_path(ai::command_name(kind))
        })
    }

    /// Construct with a custom executable resolver (strategy seam, also
    /// used by tests to substitute fake assistants).
    pub fn with_tool_resolver(
        storage: Arc<Storage>,
        worktrees: Arc<WorktreeManager>,
        config: SchedulerConfig,
        resolver: impl Fn(ToolKind) -> Option<PathBuf> + Send + Sync + 'static,
    ) -> Self {
        Self {
            pipeline: Pipeline::new(Arc::clone(&storage)),
            storage,
            worktrees,
            permits: Arc::new(Semaphore::new(config.max_parallel)),
            config,
            inner: Mutex::new(SchedulerInner::default()),
            shutdown: CancellationToken::new(),
            resolver: Box::new(resolver),
        }
    }

    /// Signal every supervisor to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Submit a run for a session.
    ///
    /// Returns `Conflict` when the session has a non-terminal run and the
    /// caller did not set `queue`. Enqueue is idempotent on
    /// `(session, prompt-hash, nonce)` when a nonce is supplied.
    pub async fn submit_run(
        self: &Arc<Self>,
        session_id: &Id,
        prompt: &str,
        opts: SubmitOptions,
    ) -> Result<Id> {
        let session = self.storage.get_session(session_id).await.map_err(|e| match e {
            StorageError::SessionNotFound(id) => SchedulerError::NotFound(id),
            other => SchedulerError::Storage(other),
        })?;

        if session.status == SessionStatus::Archived {
            return Err(SchedulerError::Conflict(format!(
                "session {session_id} is archived"
            )));
        }

        let nonce_key = opts.nonce.as_deref().map(|nonce| {
            let mut hasher = Sha256::new();
            hasher.update(prompt.as_bytes());
            format!("{session_id}:{:x}:{nonce}", hasher.finalize())
        });

        let mut inner = self.inner.lock().await;

        if let Some(key) = &nonce_key {
            if let Some(existing) = inner.nonces.get(key) {
                return Ok(existing.clone());
            }
        }

        let session_key = session_id.to_string();
        let occupied = session.busy
            || inner.dispatching.contains(&session_key)
            || inner
                .queues
                .get(&session_key)
                .is_some_and(|q| !q.is_empty());
        if occupied && !opts.queue {
            return Err(SchedulerError::Conflict(format!(
                "session {session_id} has an active run"
            )));
        }

        let now = chrono::Utc::now();
        let run = Run {
            id: Id::new(),
            session_id: session_id.clone(),
            prompt: prompt.to_string(),
            state: RunState::Created,
            summary: None,
            commit_sha: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_run(&run).await?;

        inner
            .queues
            .entry(session_key.clone())
            .or_default()
            .push_back(QueuedRun {
                run_id: run.id.clone(),
                model: opts.model,
                title: opts.title,
            });
        if let Some(key) = nonce_key {
            inner.nonces.insert(key, run.id.clone());
        }

        if inner.dispatching.insert(session_key) {
            let scheduler = Arc::clone(self);
            let session_id = session_id.clone();
            tokio::spawn(async move {
                scheduler.dispatch_session(session_id).await;
            });
        }

        info!(run_id = %run.id, session_id = %session_id, "run enqueued");
        Ok(run.id)
    }

    /// Cancel a run. Idempotent: terminal runs are left untouched.
    pub async fn cancel_run(&self, run_id: &Id) -> Result<()> {
        let run = self.storage.get_run(run_id).await.map_err(|e| match e {
            StorageError::RunNotFound(id) => SchedulerError::NotFound(id),
            other => SchedulerError::Storage(other),
        })?;

        if run.state.is_terminal() {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.tokens.get(run_id.as_ref()) {
            token.cancel();
            return Ok(());
        }

        // Still queued: drop it from the FIFO and finish it directly.
        if let Some(queue) = inner.queues.get_mut(run.session_id.as_ref()) {
            queue.retain(|q| q.run_id != *run_id);
        }
        drop(inner);

        self.storage
            .finish_run(run_id, RunState::Canceled, "canceled before dispatch")
            .await?;
        self.storage
            .append_event(run_id, EventType::Error, "run canceled", None)
            .await?;
        Ok(())
    }

    /// Startup recovery: every run left non-terminal by a previous process
    /// is marked FAILED("orphaned") and its session freed. We never try to
    /// re-attach to an abandoned subprocess.
    pub async fn recover(&self) -> Result<usize> {
        let orphans = self.storage.list_nonterminal_runs().await?;
        for run in &orphans {
            warn!(run_id = %run.id, state = run.state.as_str(), "recovering orphaned run");
            self.storage
                .append_event(
                    &run.id,
                    EventType::Recovery,
                    "daemon restarted while run was in flight",
                    None,
                )
                .await?;
            self.storage
                .finish_run(&run.id, RunState::Failed, "orphaned")
                .await?;
            self.storage
                .append_event(&run.id, EventType::Error, "orphaned", None)
                .await?;
            if let Err(e) = self
                .storage
                .release_session(&run.session_id, SessionStatus::Failed)
                .await
            {
                warn!(session_id = %run.session_id, error = %e, "session release failed during recovery");
            }
        }
        Ok(orphans.len())
    }

    /// Process a session's queue until it drains.
    async fn dispatch_session(self: Arc<Self>, session_id: Id) {
        loop {
            let next = {
                let mut inner = self.inner.lock().await;
                let next = inner
                    .queues
                    .get_mut(session_id.as_ref())
                    .and_then(VecDeque::pop_front);
                if next.is_none() {
                    inner.dispatching.remove(session_id.as_ref());
                }
                next
            };

            let Some(queued) = next else {
                return;
            };

            if self.is_shutdown() {
                let _ = self
                    .storage
                    .finish_run(&queued.run_id, RunState::Canceled, "daemon shutting down")
                    .await;
                continue;
            }

            if !self
                .storage
                .try_claim_session(&session_id)
                .await
                .unwrap_or(false)
            {
                // Session vanished or was archived under us.
                let _ = self
                    .storage
                    .finish_run(&queued.run_id, RunState::Failed, "session unavailable")
                    .await;
                continue;
            }

            let final_state = self.supervise(&queued).await;

            let session_status = match final_state {
                RunState::Completed => SessionStatus::Completed,
                RunState::Canceled => SessionStatus::Idle,
                _ => SessionStatus::Failed,
            };
            if let Err(e) = self
                .storage
                .release_session(&session_id, session_status)
                .await
            {
                error!(session_id = %session_id, error = %e, "failed to release session");
            }
        }
    }

    /// Supervise one run from CREATED to a terminal state.
    ///
    /// Never returns early without parking the run in a terminal state.
    async fn supervise(&self, queued: &QueuedRun) -> RunState {
        let run_id = &queued.run_id;
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let _ = self
                    .storage
                    .finish_run(run_id, RunState::Failed, "scheduler stopped")
                    .await;
                return RunState::Failed;
            }
        };

        let token = self.shutdown.child_token();
        {
            let mut inner = self.inner.lock().await;
            inner.tokens.insert(run_id.to_string(), token.clone());
        }

        let timed_out = Arc::new(AtomicBool::new(false));
        let result = self.drive(queued, &token, &timed_out).await;

        {
            let mut inner = self.inner.lock().await;
            inner.tokens.remove(run_id.as_ref());
        }

        match result {
            Ok(state) => state,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run supervision failed");
                let reason = e.to_string();
                let _ = self.storage.finish_run(run_id, RunState::Failed, &reason).await;
                let _ = self
                    .storage
                    .append_event(run_id, EventType::Error, &reason, None)
                    .await;
                RunState::Failed
            }
        }
    }

    async fn drive(
        &self,
        queued: &QueuedRun,
        token: &CancellationToken,
        timed_out: &Arc<AtomicBool>,
    ) -> Result<RunState> {
        let run = self.storage.get_run(&queued.run_id).await?;
        let session = self.storage.get_session(&run.session_id).await?;
        let repo = self.storage.get_repo(&session.repo_name).await?;

        // SETUP: prepare the session worktree.
        self.storage
            .advance_run_state(&run.id, RunState::Created, RunState::Setup)
            .await?;
        self.storage
            .append_event(&run.id, EventType::Setup, "preparing worktree", None)
            .await?;

        let workdir = match self.worktrees.acquire(&repo, &session).await {
            Ok(path) => path,
            Err(e) => {
                return self
                    .fail(&run.id, &format!("setup failed: {e}"))
                    .await
                    .map(|()| RunState::Failed);
            }
        };
        self.storage
            .set_session_worktree(&session.id, workdir.to_string_lossy().as_ref())
            .await?;

        // AI_RUNNING: spawn the assistant and stream its output.
        self.storage
            .advance_run_state(&run.id, RunState::Setup, RunState::AiRunning)
            .await?;
        self.storage
            .append_event(&run.id, EventType::AiStart, session.tool.as_str(), None)
            .await?;

        let Some(program) = (self.resolver)(session.tool) else {
            return self
                .fail(&run.id, &format!("tool not available: {}", session.tool.as_str()))
                .await
                .map(|()| RunState::Failed);
        };

        // Deadline watchdog shares the run token with cancellation.
        let watchdog = {
            let token = token.clone();
            let timed_out = Arc::clone(timed_out);
            let deadline = self.config.run_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(deadline) => {
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    () = token.cancelled() => {}
                }
            })
        };

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(EVENT_CHANNEL_CAPACITY);
        // The appender keeps draining on storage errors so the subprocess
        // readers never stall, and reports how many appends were lost.
        let appender = {
            let storage = Arc::clone(&self.storage);
            let run_id = run.id.clone();
            tokio::spawn(async move {
                let mut lost: u64 = 0;
                while let Some(chunk) = chunk_rx.recv().await {
                    if let Err(e) = storage
                        .append_event(&run_id, EventType::AiChunk, &chunk, None)
                        .await
                    {
                        lost += 1;
                        warn!(run_id = %run_id, error = %e, "event append failed");
                    }
                }
                lost
            })
        };

        let request = ExecuteRequest {
            workdir: workdir.clone(),
            prompt: run.prompt.clone(),
            model: queued.model.clone(),
            continuation_id: session.continuation_id.clone(),
        };
        let outcome =
            ai::execute_with_program(token, session.tool, &program, &request, chunk_tx).await;
        watchdog.abort();
        let lost_events = appender.await.unwrap_or(0);

        match outcome {
            Ok(outcome) => {
                if lost_events > 0 {
                    // Chunks were dropped from the persisted log.
                    let reason = format!("event log lost {lost_events} append(s)");
                    self.fail(&run.id, &reason).await?;
                    return Ok(RunState::Failed);
                }
                self.storage
                    .append_event(
                        &run.id,
                        EventType::AiEnd,
                        &format!("exit code {}", outcome.exit_code),
                        None,
                    )
                    .await?;

                if let Some(cid) = &outcome.continuation_id {
                    self.storage.set_session_continuation(&session.id, cid).await?;
                }

                if !outcome.success {
                    let reason = format!("tool exited with code {}", outcome.exit_code);
                    self.fail(&run.id, &reason).await?;
                    return Ok(RunState::Failed);
                }

                // VALIDATING onward is the post-run pipeline's job.
                self.storage
                    .advance_run_state(&run.id, RunState::AiRunning, RunState::Validating)
                    .await?;
                match self
                    .pipeline
                    .finalize(&run, &session, &workdir, queued.title.as_deref())
                    .await
                {
                    Ok(state) => Ok(state),
                    Err(e) => {
                        let reason = format!("{} failed: {e}", e.step());
                        self.fail(&run.id, &reason).await?;
                        Ok(RunState::Failed)
                    }
                }
            }
            Err(InvokerError::Canceled) => {
                self.storage
                    .append_event(&run.id, EventType::AiEnd, "subprocess terminated", None)
                    .await?;
                if timed_out.load(Ordering::SeqCst) {
                    self.fail(&run.id, "timeout").await?;
                    Ok(RunState::Failed)
                } else {
                    self.storage
                        .finish_run(&run.id, RunState::Canceled, "canceled")
                        .await?;
                    self.storage
                        .append_event(&run.id, EventType::Error, "run canceled", None)
                        .await?;
                    Ok(RunState::Canceled)
                }
            }
            Err(InvokerError::ToolUnavailable(name)) => {
                self.fail(&run.id, &format!("tool not available: {name}")).await?;
                Ok(RunState::Failed)
            }
            Err(e) => {
                self.fail(&run.id, &format!("tool failure: {e}")).await?;
                Ok(RunState::Failed)
            }
        }
    }

    /// Park a run in FAILED with the reason as its last event.
    async fn fail(&self, run_id: &Id, reason: &str) -> Result<()> {
        self.storage.finish_run(run_id, RunState::Failed, reason).await?;
        self.storage
            .append_event(run_id, EventType::Error, reason, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fog_core::Session;
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    struct Fixture {
        scheduler: Arc<Scheduler>,
        storage: Arc<Storage>,
        session: Session,
        _origin: TempDir,
        _managed: TempDir,
        _home: TempDir,
        _tool_dir: TempDir,
    }

    fn write_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-assistant");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn setup_with_tool(tool_body: &str, config: SchedulerConfig) -> Fixture {
        let origin = TempDir::new().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").args(&args).current_dir(origin.path()).output().unwrap();
        }
        std::fs::write(origin.path().join("README.md"), "# Test").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "init"], vec!["branch", "-M", "main"]] {
            Command::new("git").args(&args).current_dir(origin.path()).output().unwrap();
        }

        let managed = TempDir::new().unwrap();
        let bare = managed.path().join("repo.git");
        crate::git::clone_bare(origin.path().to_string_lossy().as_ref(), &bare).unwrap();

        let home = TempDir::new().unwrap();
        let storage = Storage::new(&home.path().join("fog.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);

        let record = fog_core::RepoRecord {
            name: "acme/api".to_string(),
            url: origin.path().to_string_lossy().to_string(),
            host: "local".to_string(),
            owner: "acme".to_string(),
            repo: "api".to_string(),
            bare_path: bare.to_string_lossy().to_string(),
            base_path: managed.path().join("base").to_string_lossy().to_string(),
            default_branch: "main".to_string(),
        };
        storage.upsert_repo(&record).await.unwrap();

        let now = chrono::Utc::now();
        let session = Session {
            id: Id::new(),
            repo_name: "acme/api".to_string(),
            branch: "fog/test".to_string(),
            tool: ToolKind::Cursor,
            status: SessionStatus::Idle,
            busy: false,
            autopr: false,
            pr_url: None,
            worktree: None,
            continuation_id: None,
            created_at: now,
            updated_at: now,
        };
        storage.insert_session(&session).await.unwrap();

        let tool_dir = TempDir::new().unwrap();
        let tool = write_tool(tool_dir.path(), tool_body);

        let scheduler = Arc::new(Scheduler::with_tool_resolver(
            Arc::clone(&storage),
            Arc::new(WorktreeManager::new()),
            config,
            move |_| Some(tool.clone()),
        ));

        Fixture {
            scheduler,
            storage,
            session,
            _origin: origin,
            _managed: managed,
            _home: home,
            _tool_dir: tool_dir,
        }
    }

    async fn wait_for_terminal(storage: &Storage, run_id: &Id) -> Run {
        for _ in 0..300 {
            let run = storage.get_run(run_id).await.unwrap();
            if run.state.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("run {run_id} never reached a terminal state");
    }

    const NO_CHANGE_TOOL: &str =
        r#"printf '{"type":"assistant","text":"thinking"}\n{"type":"result","session_id":"sess-123"}\n'"#;

    const EDITING_TOOL: &str = r#"git config user.email fog@test && git config user.name fog
printf '{"type":"assistant","text":"editing"}\n'
echo "change" > generated.txt"#;

    #[tokio::test]
    async fn happy_path_no_changes() {
        let fx = setup_with_tool(NO_CHANGE_TOOL, SchedulerConfig::default()).await;

        let run_id = fx
            .scheduler
            .submit_run(&fx.session.id, "Add health endpoint", SubmitOptions::default())
            .await
            .unwrap();

        let run = wait_for_terminal(&fx.storage, &run_id).await;
        assert_eq!(run.state, RunState::Completed);

        let events = fx.storage.list_events_since(&run_id, 0).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"setup"));
        assert!(types.contains(&"ai_start"));
        assert!(types.contains(&"ai_chunk"));
        assert!(types.contains(&"ai_end"));
        assert!(types.contains(&"complete"));
        // Seq numbers are contiguous from 1.
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=events.len() as i64).collect::<Vec<_>>());

        // Continuation ID was captured into the session.
        let session = fx.storage.get_session(&fx.session.id).await.unwrap();
        assert_eq!(session.continuation_id.as_deref(), Some("sess-123"));
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(!session.busy);
    }

    #[tokio::test]
    async fn happy_path_commits_changes() {
        let fx = setup_with_tool(EDITING_TOOL, SchedulerConfig::default()).await;

        let run_id = fx
            .scheduler
            .submit_run(&fx.session.id, "Add generated file", SubmitOptions::default())
            .await
            .unwrap();

        let run = wait_for_terminal(&fx.storage, &run_id).await;
        assert_eq!(run.state, RunState::Completed);
        assert!(run.commit_sha.is_some());

        let events = fx.storage.list_events_since(&run_id, 0).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"commit"));
        assert!(types.contains(&"complete"));
    }

    #[tokio::test]
    async fn concurrent_submit_conflicts_without_queue() {
        let fx = setup_with_tool("sleep 2", SchedulerConfig::default()).await;

        let first = fx
            .scheduler
            .submit_run(&fx.session.id, "first", SubmitOptions::default())
            .await
            .unwrap();

        // Second submission while the first is non-terminal must conflict.
        let second = fx
            .scheduler
            .submit_run(&fx.session.id, "second", SubmitOptions::default())
            .await;
        assert!(matches!(second, Err(SchedulerError::Conflict(_))));

        fx.scheduler.cancel_run(&first).await.unwrap();
        wait_for_terminal(&fx.storage, &first).await;
    }

    #[tokio::test]
    async fn queued_run_dispatches_after_predecessor() {
        let fx = setup_with_tool(NO_CHANGE_TOOL, SchedulerConfig::default()).await;

        let first = fx
            .scheduler
            .submit_run(&fx.session.id, "first", SubmitOptions::default())
            .await
            .unwrap();
        let second = fx
            .scheduler
            .submit_run(
                &fx.session.id,
                "second",
                SubmitOptions { queue: true, ..SubmitOptions::default() },
            )
            .await
            .unwrap();

        let first_run = wait_for_terminal(&fx.storage, &first).await;
        let second_run = wait_for_terminal(&fx.storage, &second).await;
        assert_eq!(first_run.state, RunState::Completed);
        assert_eq!(second_run.state, RunState::Completed);

        // Clients observe runs in enqueue order.
        let runs = fx.storage.list_runs_for_session(&fx.session.id).await.unwrap();
        assert_eq!(runs[0].id, first);
        assert_eq!(runs[1].id, second);
    }

    #[tokio::test]
    async fn cancel_reaches_canceled_quickly() {
        let fx = setup_with_tool("sleep 60", SchedulerConfig::default()).await;

        let run_id = fx
            .scheduler
            .submit_run(&fx.session.id, "long job", SubmitOptions::default())
            .await
            .unwrap();

        // Give the supervisor time to spawn the subprocess.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let start = std::time::Instant::now();
        fx.scheduler.cancel_run(&run_id).await.unwrap();

        let run = wait_for_terminal(&fx.storage, &run_id).await;
        assert_eq!(run.state, RunState::Canceled);
        assert!(start.elapsed() < Duration::from_secs(2));

        // Cancel is idempotent on terminal runs.
        fx.scheduler.cancel_run(&run_id).await.unwrap();
    }

    #[tokio::test]
    async fn timeout_fails_the_run() {
        let config = SchedulerConfig {
            run_timeout: Duration::from_millis(300),
            ..SchedulerConfig::default()
        };
        let fx = setup_with_tool("sleep 60", config).await;

        let run_id = fx
            .scheduler
            .submit_run(&fx.session.id, "slow job", SubmitOptions::default())
            .await
            .unwrap();

        let run = wait_for_terminal(&fx.storage, &run_id).await;
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.summary.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn failing_tool_fails_the_run() {
        let fx = setup_with_tool("echo doom >&2; exit 9", SchedulerConfig::default()).await;

        let run_id = fx
            .scheduler
            .submit_run(&fx.session.id, "doomed", SubmitOptions::default())
            .await
            .unwrap();

        let run = wait_for_terminal(&fx.storage, &run_id).await;
        assert_eq!(run.state, RunState::Failed);

        let events = fx.storage.list_events_since(&run_id, 0).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, "error");
    }

    #[tokio::test]
    async fn nonce_makes_submit_idempotent() {
        let fx = setup_with_tool(NO_CHANGE_TOOL, SchedulerConfig::default()).await;

        let opts = SubmitOptions {
            queue: true,
            nonce: Some("client-1".to_string()),
            ..SubmitOptions::default()
        };
        let first = fx
            .scheduler
            .submit_run(&fx.session.id, "same prompt", opts.clone())
            .await
            .unwrap();
        let second = fx
            .scheduler
            .submit_run(&fx.session.id, "same prompt", opts)
            .await
            .unwrap();

        assert_eq!(first, second);
        wait_for_terminal(&fx.storage, &first).await;
    }

    #[tokio::test]
    async fn recovery_orphans_nonterminal_runs() {
        let fx = setup_with_tool(NO_CHANGE_TOOL, SchedulerConfig::default()).await;

        // Simulate a crash: a run persisted mid-flight with a busy session.
        let now = chrono::Utc::now();
        let run = Run {
            id: Id::new(),
            session_id: fx.session.id.clone(),
            prompt: "interrupted".to_string(),
            state: RunState::Created,
            summary: None,
            commit_sha: None,
            created_at: now,
            updated_at: now,
        };
        fx.storage.insert_run(&run).await.unwrap();
        for (from, to) in [
            (RunState::Created, RunState::Setup),
            (RunState::Setup, RunState::AiRunning),
        ] {
            fx.storage.advance_run_state(&run.id, from, to).await.unwrap();
        }
        assert!(fx.storage.try_claim_session(&fx.session.id).await.unwrap());

        let recovered = fx.scheduler.recover().await.unwrap();
        assert_eq!(recovered, 1);

        let run = fx.storage.get_run(&run.id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.summary.as_deref(), Some("orphaned"));

        let events = fx.storage.list_events_since(&run.id, 0).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "recovery"));

        // Session is claimable again after recovery.
        assert!(fx.storage.try_claim_session(&fx.session.id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_of_queued_run_before_dispatch() {
        let fx = setup_with_tool("sleep 2", SchedulerConfig::default()).await;

        let first = fx
            .scheduler
            .submit_run(&fx.session.id, "first", SubmitOptions::default())
            .await
            .unwrap();
        let second = fx
            .scheduler
            .submit_run(
                &fx.session.id,
                "second",
                SubmitOptions { queue: true, ..SubmitOptions::default() },
            )
            .await
            .unwrap();

        fx.scheduler.cancel_run(&second).await.unwrap();
        let run = fx.storage.get_run(&second).await.unwrap();
        assert_eq!(run.state, RunState::Canceled);

        fx.scheduler.cancel_run(&first).await.unwrap();
        wait_for_terminal(&fx.storage, &first).await;
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let fx = setup_with_tool(NO_CHANGE_TOOL, SchedulerConfig::default()).await;
        let result = fx
            .scheduler
            .submit_run(&Id::new(), "prompt", SubmitOptions::default())
            .await;
        assert!(matches!(result, Err(SchedulerError::NotFound(_))));
    }
}
