//! Runner configuration, request/response types and the allowlist check.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{kill, log_tail, subprocess};
use crate::command::EngineCommand;
use crate::types::{env_list, env_or};
use crate::validation::{PathPolicy, ValidationError};

/// Combined stdout + stderr cap (10 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Default wall-clock limit per engine run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default log-file polling interval.
pub const DEFAULT_LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Executables the engine is allowed to run as: its interpreter and the
/// tools it shells out to.
pub const DEFAULT_ALLOWED_EXECUTABLES: &[&str] = &["python", "ffmpeg", "ffprobe"];

/// Exact process names a hard cancel terminates. Includes `python3`, the
/// interpreter name of a Unix engine install.
pub const DEFAULT_KILL_NAMES: &[&str] = &["python", "python3", "ffmpeg"];

/// Limits and allowlists for [`ProcessRunner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_output_bytes: usize,
    pub default_timeout: Duration,
    pub log_poll_interval: Duration,
    /// Permitted executable basenames (prefix match, so `python` admits `python3.11`).
    pub allowed_executables: Vec<String>,
    /// When set, the program must also be exactly this file.
    pub pinned_executable: Option<PathBuf>,
    /// Process names terminated by a hard cancel.
    pub kill_names: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            default_timeout: DEFAULT_TIMEOUT,
            log_poll_interval: DEFAULT_LOG_POLL_INTERVAL,
            allowed_executables: DEFAULT_ALLOWED_EXECUTABLES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            pinned_executable: None,
            kill_names: DEFAULT_KILL_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RunnerConfig {
    /// Load limits from the environment.
    ///
    /// | Env Var                        | Default                 |
    /// |--------------------------------|-------------------------|
    /// | `REELCTL_MAX_OUTPUT_BYTES`     | `10485760`              |
    /// | `REELCTL_PROCESS_TIMEOUT_SECS` | `300`                   |
    /// | `REELCTL_LOG_POLL_MS`          | `500`                   |
    /// | `REELCTL_ALLOWED_EXECUTABLES`  | `python,ffmpeg,ffprobe` |
    /// | `REELCTL_PINNED_EXECUTABLE`    | unset                   |
    /// | `REELCTL_KILL_PROCESS_NAMES`   | `python,python3,ffmpeg` |
    pub fn from_env() -> Self {
        Self {
            max_output_bytes: env_or("REELCTL_MAX_OUTPUT_BYTES", DEFAULT_MAX_OUTPUT_BYTES),
            default_timeout: Duration::from_secs(env_or(
                "REELCTL_PROCESS_TIMEOUT_SECS",
                DEFAULT_TIMEOUT.as_secs(),
            )),
            log_poll_interval: Duration::from_millis(env_or(
                "REELCTL_LOG_POLL_MS",
                DEFAULT_LOG_POLL_INTERVAL.as_millis() as u64,
            )),
            allowed_executables: env_list(
                "REELCTL_ALLOWED_EXECUTABLES",
                DEFAULT_ALLOWED_EXECUTABLES,
            ),
            pinned_executable: std::env::var("REELCTL_PINNED_EXECUTABLE")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            kill_names: env_list("REELCTL_KILL_PROCESS_NAMES", DEFAULT_KILL_NAMES),
        }
    }
}

/// One engine invocation.
#[derive(Debug)]
pub struct RunRequest {
    pub command: EngineCommand,
    /// Working directory (validated against the runner's path policy).
    pub working_directory: Option<PathBuf>,
    /// Overrides [`RunnerConfig::default_timeout`].
    pub timeout: Option<Duration>,
    /// File the engine must have produced for the run to count as a success.
    pub expected_output: Option<PathBuf>,
    /// Log file to tail while the process runs.
    pub log_file: Option<PathBuf>,
    /// Receives each complete line appended to `log_file`.
    pub log_sink: Option<mpsc::UnboundedSender<String>>,
}

impl RunRequest {
    pub fn new(command: EngineCommand) -> Self {
        Self {
            command,
            working_directory: None,
            timeout: None,
            expected_output: None,
            log_file: None,
            log_sink: None,
        }
    }
}

/// Captured result of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Why an engine run failed.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Executable not allowed: {0}")]
    NotAllowed(String),

    #[error("Failed to spawn engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Engine timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Engine output exceeded {limit} bytes")]
    OutputLimitExceeded { limit: usize },

    #[error("Engine failed with exit code {exit_code}: {stderr}")]
    ExecutionFailed { exit_code: i32, stderr: String },

    #[error("Engine exited cleanly but produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Executes engine commands. Implemented by [`ProcessRunner`]; the
/// orchestrator depends on this seam.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `request` to completion or until `cancel` fires.
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunOutput, ProcessError>;

    /// Best-effort termination of every known engine process.
    async fn kill_known_processes(&self);
}

/// The production [`CommandRunner`].
pub struct ProcessRunner {
    config: RunnerConfig,
    paths: PathPolicy,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig, paths: PathPolicy) -> Self {
        Self { config, paths }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Check `program` against the pinned path and the basename allowlist.
    pub fn check_executable(&self, program: &Path) -> Result<(), ProcessError> {
        if let Some(pinned) = &self.config.pinned_executable {
            if !same_file(program, pinned) {
                return Err(ProcessError::NotAllowed(format!(
                    "{} is not the pinned executable {}",
                    program.display(),
                    pinned.display()
                )));
            }
        }
        if is_allowed_executable(program, &self.config.allowed_executables) {
            Ok(())
        } else {
            Err(ProcessError::NotAllowed(program.display().to_string()))
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunOutput, ProcessError> {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        let program = request.command.program().to_path_buf();
        self.check_executable(&program)?;

        let working_directory = match &request.working_directory {
            Some(dir) => Some(self.paths.validate(&dir.to_string_lossy())?),
            None => None,
        };

        tracing::info!(command = %request.command, "Starting engine");

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(request.command.args());
        if let Some(dir) = &working_directory {
            cmd.current_dir(dir);
        }

        let tail_stop = CancellationToken::new();
        let tail_task = match (&request.log_file, &request.log_sink) {
            (Some(path), Some(sink)) => Some(tokio::spawn(log_tail::tail_file(
                path.clone(),
                self.config.log_poll_interval,
                sink.clone(),
                tail_stop.clone(),
            ))),
            _ => None,
        };

        let limits = subprocess::Limits {
            timeout: request.timeout.unwrap_or(self.config.default_timeout),
            max_output_bytes: self.config.max_output_bytes,
        };
        let result = subprocess::run_command(&mut cmd, limits, &cancel).await;

        tail_stop.cancel();
        if let Some(task) = tail_task {
            let _ = task.await;
        }

        let output = result?;

        if output.exit_code != 0 {
            return Err(ProcessError::ExecutionFailed {
                exit_code: output.exit_code,
                stderr: tail_lines(&output.stderr, 20),
            });
        }

        if let Some(expected) = &request.expected_output {
            if !tokio::fs::try_exists(expected).await.unwrap_or(false) {
                return Err(ProcessError::MissingOutput(expected.clone()));
            }
        }

        // Success boundary: a cancel that raced the exit still wins.
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        tracing::info!(duration_ms = output.duration_ms, "Engine finished");
        Ok(output)
    }

    async fn kill_known_processes(&self) {
        kill::kill_processes_by_name(&self.config.kill_names).await;
    }
}

/// Basename (without `.exe`) equal to or prefixed by an allowlist entry.
pub fn is_allowed_executable(program: &Path, allowed: &[String]) -> bool {
    let Some(name) = program.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    let base = name.strip_suffix(".exe").unwrap_or(&name);
    allowed.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        !entry.is_empty() && (base == entry || base.starts_with(&entry))
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Last `n` lines of `text`, for compact error messages.
fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn allowed() -> Vec<String> {
        DEFAULT_ALLOWED_EXECUTABLES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allowlist_matches_basename_or_prefix() {
        let list = allowed();
        assert!(is_allowed_executable(Path::new("/opt/engine/bin/python3"), &list));
        assert!(is_allowed_executable(Path::new("C:/engine/python.exe"), &list));
        assert!(is_allowed_executable(Path::new("/usr/bin/ffmpeg"), &list));
        assert!(!is_allowed_executable(Path::new("/bin/sh"), &list));
        assert!(!is_allowed_executable(Path::new("/usr/bin/curl"), &list));
        assert!(!is_allowed_executable(Path::new("/"), &list));
    }

    #[test]
    fn pinned_executable_must_match() {
        let runner = ProcessRunner::new(
            RunnerConfig {
                pinned_executable: Some(PathBuf::from("/opt/engine/bin/python3")),
                ..Default::default()
            },
            PathPolicy::platform_default(),
        );
        assert!(runner
            .check_executable(Path::new("/opt/engine/bin/python3"))
            .is_ok());
        assert_matches!(
            runner.check_executable(Path::new("/usr/bin/python3")),
            Err(ProcessError::NotAllowed(_))
        );
    }

    #[test]
    fn kill_names_cover_resolved_interpreter() {
        let engine = crate::command::EngineLocation::resolve(Path::new("/opt/engine"));
        let name = engine
            .interpreter
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap()
            .to_string();
        assert!(RunnerConfig::default().kill_names.contains(&name));
    }

    #[test]
    fn tail_lines_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }

    #[test]
    fn cancelled_error_displays_reason() {
        assert_eq!(ProcessError::Cancelled.to_string(), "cancelled");
        let err = ProcessError::Timeout { elapsed_ms: 5000 };
        assert_eq!(err.to_string(), "Engine timed out after 5000ms");
    }
}

#[cfg(all(test, unix))]
mod run_tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::command::{CommandBuilder, EngineLocation, ProcessingOptions};

    /// An engine script run by `/bin/sh` inside a temp dir that is the whole
    /// path policy. The script sees `--input <in> --output <out>` as `$1..$4`.
    struct Fixture {
        dir: tempfile::TempDir,
        builder: CommandBuilder,
        output: PathBuf,
    }

    fn fixture(script: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("engine.sh");
        std::fs::write(&script_path, script).unwrap();
        let builder = CommandBuilder::new(
            EngineLocation {
                interpreter: PathBuf::from("/bin/sh"),
                script: script_path,
            },
            PathPolicy::new(vec![dir.path().to_path_buf()]),
        );
        Fixture {
            output: dir.path().join("out.mp4"),
            builder,
            dir,
        }
    }

    impl Fixture {
        fn runner(&self, allowed: &[&str]) -> ProcessRunner {
            ProcessRunner::new(
                RunnerConfig {
                    allowed_executables: allowed.iter().map(|s| s.to_string()).collect(),
                    ..Default::default()
                },
                PathPolicy::new(vec![self.dir.path().to_path_buf()]),
            )
        }

        fn request(&self) -> RunRequest {
            let command = self
                .builder
                .build(
                    &ProcessingOptions::default(),
                    &self.dir.path().join("in.mp4"),
                    &self.output,
                )
                .unwrap();
            let mut request = RunRequest::new(command);
            request.expected_output = Some(self.output.clone());
            request
        }
    }

    #[tokio::test]
    async fn success_requires_the_declared_output() {
        let fx = fixture("echo rendered\ntouch \"$4\"\n");
        let out = fx
            .runner(&["sh"])
            .run(fx.request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "rendered");
        assert_eq!(out.exit_code, 0);
        assert!(fx.output.exists());
    }

    #[tokio::test]
    async fn clean_exit_without_output_fails() {
        let fx = fixture("exit 0\n");
        let err = fx
            .runner(&["sh"])
            .run(fx.request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, ProcessError::MissingOutput(path) if path == fx.output);
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code_and_stderr() {
        let fx = fixture("echo 'model not found' >&2\nexit 7\n");
        let err = fx
            .runner(&["sh"])
            .run(fx.request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ProcessError::ExecutionFailed { exit_code: 7, ref stderr } if stderr == "model not found"
        );
    }

    #[tokio::test]
    async fn disallowed_program_never_spawns() {
        let fx = fixture("touch \"$4\"\n");
        let err = fx
            .runner(&["python"])
            .run(fx.request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, ProcessError::NotAllowed(_));
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn working_directory_outside_policy_is_rejected() {
        let fx = fixture("touch \"$4\"\n");
        let mut request = fx.request();
        request.working_directory = Some(PathBuf::from("/usr"));
        let err = fx
            .runner(&["sh"])
            .run(request, CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ProcessError::Validation(ValidationError::PathNotAllowed(_))
        );
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn cancel_before_start_never_spawns() {
        let fx = fixture("touch \"$4\"\n");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx.runner(&["sh"]).run(fx.request(), cancel).await.unwrap_err();
        assert_matches!(err, ProcessError::Cancelled);
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn cancel_after_exit_still_wins() {
        // The script exits at once, but a background sleep holds stdout open,
        // so the cancel lands after exit and before the run returns.
        let fx = fixture("touch \"$4\"\nsleep 1 &\nexit 0\n");
        let runner = fx.runner(&["sh"]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = runner.run(fx.request(), cancel).await.unwrap_err();
        assert_matches!(err, ProcessError::Cancelled);
        assert!(fx.output.exists());
    }
}
