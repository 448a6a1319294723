//! Subprocess execution with streamed output and group cancellation.
//!
//! On POSIX the child starts in its own process group so cancellation can
//! take down the whole tree: SIGTERM, a 1.5 s grace period, then SIGKILL.
//! Stdout and stderr are drained concurrently; both feed one bounded chunk
//! channel whose `send().await` applies backpressure to the readers.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of the chunk channel between pipe readers and the consumer.
pub const CHUNK_CHANNEL_CAPACITY: usize = 1024;
/// Read buffer size per pipe.
const READ_BUF_SIZE: usize = 4096;
/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ProcError>;

/// Outcome of a streamed subprocess execution.
#[derive(Debug)]
pub struct ExitInfo {
    /// Exit code, or -1 when the process died to a signal.
    pub exit_code: i32,
    /// True when the run ended because the token fired.
    pub canceled: bool,
    /// Combined stdout+stderr bytes, interleaved as read.
    pub output: Vec<u8>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        !self.canceled && self.exit_code == 0
    }
}

/// Run a command, streaming output chunks into `chunk_tx` as they arrive.
///
/// Chunk boundaries follow pipe reads; within one pipe ordering is exact,
/// across pipes it is best-effort. The combined output is also returned.
pub async fn run_streaming(
    cancel: &CancellationToken,
    dir: &Path,
    program: &Path,
    args: &[String],
    chunk_tx: mpsc::Sender<Vec<u8>>,
) -> Result<ExitInfo> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(program = %program.display(), dir = %dir.display(), "spawning subprocess");

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProcError::NotFound(program.display().to_string())
        } else {
            ProcError::Io(e)
        }
    })?;

    #[cfg(unix)]
    let pid = child.id().map(|id| id as i32);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcError::Io(std::io::Error::other("stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProcError::Io(std::io::Error::other("stderr not captured")))?;

    let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(CHUNK_CHANNEL_CAPACITY);
    let stdout_reader = tokio::spawn(stream_pipe(stdout, raw_tx.clone()));
    let stderr_reader = tokio::spawn(stream_pipe(stderr, raw_tx));

    // Collector: accumulate combined output and forward to the caller.
    // A dropped caller receiver only stops forwarding, not collection.
    let collector = tokio::spawn(async move {
        let mut combined = Vec::new();
        while let Some(chunk) = raw_rx.recv().await {
            combined.extend_from_slice(&chunk);
            let _ = chunk_tx.send(chunk).await;
        }
        combined
    });

    let mut canceled = false;
    let status = tokio::select! {
        status = child.wait() => status?,
        () = cancel.cancelled() => {
            canceled = true;
            #[cfg(unix)]
            if let Some(pid) = pid {
                kill_group(pid, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            let _ = child.start_kill();

            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        kill_group(pid, libc::SIGKILL);
                    }
                    #[cfg(not(unix))]
                    let _ = child.start_kill();
                    child.wait().await?
                }
            }
        }
    };

    // Pipes close once the process group is gone; readers drain to EOF.
    let _ = stdout_reader.await;
    let _ = stderr_reader.await;
    let output = collector.await.unwrap_or_default();

    Ok(ExitInfo {
        exit_code: status.code().unwrap_or(-1),
        canceled,
        output,
    })
}

async fn stream_pipe(mut reader: impl AsyncRead + Unpin, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Signal an entire process group, falling back to the single process.
#[cfg(unix)]
fn kill_group(pid: i32, signal: libc::c_int) {
    if pid <= 0 {
        return;
    }
    // SAFETY: plain libc signal calls on a pid we spawned; the worst a
    // stale pid can produce is ESRCH, which both calls report as -1.
    unsafe {
        if libc::killpg(pid, signal) != 0 {
            libc::kill(pid, signal);
        }
    }
}
