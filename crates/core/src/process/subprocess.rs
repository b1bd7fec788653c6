//! Spawn, capture and supervise a single child process.
//!
//! Provides [`run_command`]: stdout and stderr are drained concurrently into
//! buffers that share one byte budget. The child is killed when the budget
//! is exceeded, when the timeout elapses, or when the caller cancels.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::runner::{ProcessError, RunOutput};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Overflowed,
    Cancelled,
}

/// Spawn `cmd` and wait for it under `limits`.
///
/// The caller sets program, arguments and working directory. No stdin is
/// provided; the engine reads only its arguments.
pub async fn run_command(
    cmd: &mut Command,
    limits: Limits,
    cancel: &CancellationToken,
) -> Result<RunOutput, ProcessError> {
    // `kill_on_drop(true)` ensures the child is killed if this future is dropped.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;

    let used = Arc::new(AtomicUsize::new(0));
    let overflow = CancellationToken::new();

    let stdout_task = tokio::spawn(read_stream(
        child.stdout.take(),
        used.clone(),
        limits.max_output_bytes,
        overflow.clone(),
    ));
    let stderr_task = tokio::spawn(read_stream(
        child.stderr.take(),
        used.clone(),
        limits.max_output_bytes,
        overflow.clone(),
    ));

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = tokio::time::sleep(limits.timeout) => Outcome::TimedOut,
        _ = overflow.cancelled() => Outcome::Overflowed,
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    let status = match outcome {
        Outcome::Exited(status) => status?,
        other => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(match other {
                Outcome::TimedOut => ProcessError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                },
                Outcome::Overflowed => ProcessError::OutputLimitExceeded {
                    limit: limits.max_output_bytes,
                },
                _ => ProcessError::Cancelled,
            });
        }
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();

    // The streams may have crossed the budget between exit and drain.
    if overflow.is_cancelled() {
        return Err(ProcessError::OutputLimitExceeded {
            limit: limits.max_output_bytes,
        });
    }

    Ok(RunOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        exit_code: status.code().unwrap_or(-1),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Read a stream to EOF, charging every chunk against the shared budget.
async fn read_stream<R: AsyncRead + Unpin>(
    handle: Option<R>,
    used: Arc<AtomicUsize>,
    limit: usize,
    overflow: CancellationToken,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut h) = handle else {
        return buf;
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match h.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let total = used.fetch_add(n, Ordering::SeqCst) + n;
        if total > limit {
            overflow.cancel();
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

#[cfg(all(test, unix))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn limits() -> Limits {
        Limits {
            timeout: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024,
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let mut cmd = sh("echo hello; echo oops 1>&2; exit 3");
        let out = run_command(&mut cmd, limits(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let mut cmd = sh("sleep 30");
        let limits = Limits {
            timeout: Duration::from_millis(100),
            ..limits()
        };
        let result = run_command(&mut cmd, limits, &CancellationToken::new()).await;
        assert_matches!(result, Err(ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn combined_output_over_budget_is_rejected() {
        let mut cmd = sh("head -c 4096 /dev/zero; head -c 4096 /dev/zero 1>&2; sleep 5");
        let limits = Limits {
            timeout: Duration::from_secs(10),
            max_output_bytes: 6000,
        };
        let result = run_command(&mut cmd, limits, &CancellationToken::new()).await;
        assert_matches!(
            result,
            Err(ProcessError::OutputLimitExceeded { limit: 6000 })
        );
    }

    #[tokio::test]
    async fn cancellation_stops_the_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut cmd = sh("sleep 30");
        let result = run_command(&mut cmd, limits(), &cancel).await;
        assert_matches!(result, Err(ProcessError::Cancelled));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let mut cmd = Command::new("/nonexistent/reelctl-engine");
        let result = run_command(&mut cmd, limits(), &CancellationToken::new()).await;
        assert_matches!(result, Err(ProcessError::Spawn(_)));
    }
}
