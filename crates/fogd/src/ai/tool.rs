//! Assistant invocation strategies.
//!
//! Each supported assistant contributes its executable name, an argv
//! builder, and whether it emits stream-JSON. The invoker is polymorphic
//! over that set: stream-JSON tools run through the parser, plain tools
//! (aider) forward raw output. A command rejecting the stream-JSON flag
//! gets one retry without it.

use crate::ai::path::command_path;
use crate::ai::stream::{looks_like_unsupported_flag, StreamJsonParser};
use crate::proc::{self, ExitInfo, ProcError, CHUNK_CHANNEL_CAPACITY};
use fog_core::ToolKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("tool not available: {0}")]
    ToolUnavailable(String),
    #[error("subprocess error: {0}")]
    Proc(#[from] ProcError),
    #[error("execution canceled")]
    Canceled,
    #[error("invoker task failed: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, InvokerError>;

/// One tool execution call.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
    /// Assistant-side conversation token from a previous run.
    pub continuation_id: Option<String>,
}

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub exit_code: i32,
    /// Harmonized output text (extracted from stream-JSON when available).
    pub output: String,
    /// Continuation token captured from the stream, if any.
    pub continuation_id: Option<String>,
}

/// Executable name for a tool.
pub fn command_name(kind: ToolKind) -> &'static str {
    match kind {
        ToolKind::Cursor => "cursor-agent",
        ToolKind::Claude => "claude",
        ToolKind::Gemini => "gemini",
        ToolKind::Aider => "aider",
    }
}

/// Strategy surface per tool.
trait ToolStrategy {
    fn command_name(&self) -> &'static str;
    fn parses_stream_json(&self) -> bool;
    fn build_argv(&self, req: &ExecuteRequest, with_stream_json: bool) -> Vec<String>;
}

impl ToolStrategy for ToolKind {
    fn command_name(&self) -> &'static str {
        command_name(*self)
    }

    fn parses_stream_json(&self) -> bool {
        !matches!(self, Self::Aider)
    }

    fn build_argv(&self, req: &ExecuteRequest, with_stream_json: bool) -> Vec<String> {
        let model = req.model.as_deref().map(str::trim).filter(|m| !m.is_empty());
        let resume = req
            .continuation_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        match self {
            Self::Cursor => {
                let mut args = vec!["-p".to_string(), "--force".to_string()];
                if let Some(model) = model {
                    args.push("--model".to_string());
                    args.push(model.to_string());
                }
                if let Some(resume) = resume {
                    args.push("--resume".to_string());
                    args.push(resume.to_string());
                }
                if with_stream_json {
                    args.push("--output-format".to_string());
                    args.push("stream-json".to_string());
                }
                args.push(req.prompt.trim().to_string());
                args
            }
            Self::Claude => {
                let mut args = vec!["-p".to_string()];
                if let Some(model) = model {
                    args.push("--model".to_string());
                    args.push(model.to_string());
                }
                if let Some(resume) = resume {
                    args.push("--resume".to_string());
                    args.push(resume.to_string());
                }
                if with_stream_json {
                    args.push("--output-format".to_string());
                    args.push("stream-json".to_string());
                }
                args.push(req.prompt.trim().to_string());
                args
            }
            Self::Gemini => {
                let mut args = Vec::new();
                if let Some(model) = model {
                    args.push("--model".to_string());
                    args.push(model.to_string());
                }
                if let Some(resume) = resume {
                    args.push("--resume".to_string());
                    args.push(resume.to_string());
                }
                if with_stream_json {
                    args.push("--output-format".to_string());
                    args.push("stream-json".to_string());
                }
                args.push("-p".to_string());
                args.push(req.prompt.trim().to_string());
                args
            }
            Self::Aider => {
                let mut args = vec!["--yes".to_string()];
                if let Some(model) = model {
                    args.push("--model".to_string());
                    args.push(model.to_string());
                }
                args.push("--message".to_string());
                args.push(req.prompt.trim().to_string());
                args
            }
        }
    }
}

/// Check if a tool's executable can be resolved.
pub fn is_available(kind: ToolKind) -> bool {
    command_path(kind.command_name()).is_some()
}

/// Pick a tool: the preferred one when available, else the first
/// available in canonical order.
pub fn detect_tool(preferred: Option<ToolKind>) -> Option<ToolKind> {
    if let Some(kind) = preferred {
        if is_available(kind) {
            return Some(kind);
        }
    }
    ToolKind::all().into_iter().find(|kind| is_available(*kind))
}

/// Execute a tool, emitting display chunks into `chunk_tx` as they arrive.
pub async fn execute(
    cancel: &CancellationToken,
    kind: ToolKind,
    req: &ExecuteRequest,
    chunk_tx: mpsc::Sender<String>,
) -> Result<ToolOutcome> {
    let program = command_path(kind.command_name())
        .ok_or_else(|| InvokerError::ToolUnavailable(kind.command_name().to_string()))?;
    execute_with_program(cancel, kind, &program, req, chunk_tx).await
}

/// Execute with an explicitly resolved executable path.
pub async fn execute_with_program(
    cancel: &CancellationToken,
    kind: ToolKind,
    program: &Path,
    req: &ExecuteRequest,
    chunk_tx: mpsc::Sender<String>,
) -> Result<ToolOutcome> {
    if !kind.parses_stream_json() {
        let args = kind.build_argv(req, false);
        return run_plain(cancel, &req.workdir, program, &args, chunk_tx).await;
    }

    let args = kind.build_argv(req, true);
    let outcome = run_stream_json(cancel, &req.workdir, program, &args, chunk_tx.clone()).await?;

    // Older tool builds reject the stream flag; retry once without it.
    if !outcome.success && looks_like_unsupported_flag(&outcome.output) {
        info!(tool = kind.as_str(), "stream-json flag rejected, retrying without it");
        let args = kind.build_argv(req, false);
        return run_stream_json(cancel, &req.workdir, program, &args, chunk_tx).await;
    }

    Ok(outcome)
}

/// Run a stream-JSON tool: bytes go through the parser, extracted text is
/// forwarded chunk-by-chunk.
async fn run_stream_json(
    cancel: &CancellationToken,
    workdir: &Path,
    program: &Path,
    args: &[String],
    chunk_tx: mpsc::Sender<String>,
) -> Result<ToolOutcome> {
    let (byte_tx, mut byte_rx) = mpsc::channel::<Vec<u8>>(CHUNK_CHANNEL_CAPACITY);
    let proc_task = spawn_proc(cancel, workdir, program, args, byte_tx);

    let mut parser = StreamJsonParser::new();
    while let Some(bytes) = byte_rx.recv().await {
        for chunk in parser.feed(&bytes) {
            let _ = chunk_tx.send(chunk).await;
        }
    }
    for chunk in parser.close() {
        let _ = chunk_tx.send(chunk).await;
    }

    let info = join_proc(proc_task).await?;
    if info.canceled {
        return Err(InvokerError::Canceled);
    }

    let mut output = parser.output();
    if output.is_empty() {
        // No extractable text; fall back to the raw combined output.
        output = String::from_utf8_lossy(&info.output).trim().to_string();
    }

    Ok(ToolOutcome {
        success: info.success(),
        exit_code: info.exit_code,
        output,
        continuation_id: parser.conversation_id().map(str::to_string),
    })
}

/// Run a plain-output tool: chunks are forwarded verbatim.
async fn run_plain(
    cancel: &CancellationToken,
    workdir: &Path,
    program: &Path,
    args: &[String],
    chunk_tx: mpsc::Sender<String>,
) -> Result<ToolOutcome> {
    let (byte_tx, mut byte_rx) = mpsc::channel::<Vec<u8>>(CHUNK_CHANNEL_CAPACITY);
    let proc_task = spawn_proc(cancel, workdir, program, args, byte_tx);

    while let Some(bytes) = byte_rx.recv().await {
        let _ = chunk_tx
            .send(String::from_utf8_lossy(&bytes).into_owned())
            .await;
    }

    let info = join_proc(proc_task).await?;
    if info.canceled {
        return Err(InvokerError::Canceled);
    }

    Ok(ToolOutcome {
        success: info.success(),
        exit_code: info.exit_code,
        output: String::from_utf8_lossy(&info.output).trim().to_string(),
        continuation_id: None,
    })
}

fn spawn_proc(
    cancel: &CancellationToken,
    workdir: &Path,
    program: &Path,
    args: &[String],
    byte_tx: mpsc::Sender<Vec<u8>>,
) -> tokio::task::JoinHandle<proc::Result<ExitInfo>> {
    let cancel = cancel.clone();
    let workdir = workdir.to_path_buf();
    let program = program.to_path_buf();
    let args = args.to_vec();
    debug!(program = %program.display(), args = ?args, "invoking tool");
    tokio::spawn(async move { proc::run_streaming(&cancel, &workdir, &program, &args, byte_tx).await })
}

async fn join_proc(
    task: tokio::task::JoinHandle<proc::Result<ExitInfo>>,
) -> Result<ExitInfo> {
    match task.await {
        Ok(result) => Ok(result?),
        Err(e) => Err(InvokerError::Internal(e.to_string())),
    }
}
