//! Sandboxed execution of the external media engine.
//!
//! The runner spawns exactly one engine command per call, never through a
//! shell, and only for allowlisted executables. While the process runs it
//! enforces a combined output cap and a wall-clock timeout, and tails the
//! engine's log file into a caller-supplied sink.

pub mod kill;
pub mod log_tail;
pub mod runner;
pub mod subprocess;

pub use kill::kill_processes_by_name;
pub use runner::{
    CommandRunner, ProcessError, ProcessRunner, RunOutput, RunRequest, RunnerConfig,
};
