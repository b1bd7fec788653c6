//! Job model and status machine.

use std::fmt;
use std::path::PathBuf;

use rand::distr::Alphanumeric;
use rand::Rng;
use reelctl_core::command::CommandError;
use reelctl_core::process::ProcessError;
use reelctl_core::types::{LayerRef, Timestamp};
use reelctl_core::validation::ValidationError;
use reelctl_progress::ProgressUpdate;
use serde::{Deserialize, Serialize};

use crate::host::HostError;

/// Failure reason recorded for a job interrupted by cancellation.
pub const CANCELLED_REASON: &str = "cancelled";

/// `job_<unix-ms>_<6 random chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(format!(
            "job_{}_{suffix}",
            chrono::Utc::now().timestamp_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    /// Rendering in the host; after a successful render the job stays here,
    /// holding its artifact, until the process phase picks it up.
    Preparing,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Progress metrics only move in these states.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Preparing | Self::Processing)
    }

    fn can_become(self, next: Self) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Preparing)
                | (Pending, Failed)
                | (Preparing, Processing)
                | (Preparing, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Preparing => "Preparing",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

/// Which half of the pipeline produced the job's last update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    None,
    Prepare,
    Process,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub current_frame: u64,
    pub total_frames: u64,
    pub fps: f64,
    /// Estimated seconds remaining.
    pub eta_secs: f64,
    pub label: Option<String>,
}

impl JobProgress {
    /// Completion in `0.0..=100.0`; zero while the total is unknown.
    pub fn percent(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        (self.current_frame as f64 / self.total_frames as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub reference: LayerRef,
    pub status: JobStatus,
    pub phase: JobPhase,
    pub progress: JobProgress,
    /// Intermediate render from the prepare phase.
    pub artifact: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: Timestamp,
}

impl Job {
    pub fn new(reference: LayerRef) -> Self {
        Self {
            id: JobId::generate(),
            reference,
            status: JobStatus::Pending,
            phase: JobPhase::None,
            progress: JobProgress::default(),
            artifact: None,
            error: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Move forward to `next`. Terminal jobs never move again.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_become(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            JobStatus::Preparing => self.phase = JobPhase::Prepare,
            JobStatus::Processing => {
                self.phase = JobPhase::Process;
                self.progress = JobProgress::default();
            }
            JobStatus::Completed => self.artifact = None,
            JobStatus::Pending | JobStatus::Failed => {}
        }
        Ok(())
    }

    /// Mark failed with `reason`. The first recorded reason wins.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobStatus::Failed)?;
        self.artifact = None;
        if self.error.is_none() {
            self.error = Some(reason.into());
        }
        Ok(())
    }

    /// Ready for the process phase: rendered, not yet processed.
    pub fn is_prepared(&self) -> bool {
        self.status == JobStatus::Preparing && self.artifact.is_some()
    }

    /// Apply an engine progress report. Ignored unless the job is active.
    pub fn apply_progress(&mut self, update: &ProgressUpdate) -> bool {
        if !self.status.is_active() {
            return false;
        }
        self.progress = JobProgress {
            current_frame: update.frame,
            total_frames: update.total_frames,
            fps: update.fps,
            eta_secs: update.eta,
            label: update.status.clone().or_else(|| self.progress.label.take()),
        };
        true
    }
}

/// Why a job failed. The display string becomes the job's error.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("cancelled")]
    Cancelled,

    #[error("Invalid job transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Host: {0}")]
    Host(#[from] HostError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Process(ProcessError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<ProcessError> for JobError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Cancelled => Self::Cancelled,
            other => Self::Process(other),
        }
    }
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn update(frame: u64, total: u64) -> ProgressUpdate {
        ProgressUpdate {
            fps: 24.0,
            frame,
            total_frames: total,
            eta: 1.0,
            status: None,
        }
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("job_"));
        assert_eq!(a.as_str().rsplit('_').next().unwrap().len(), 6);
    }

    #[test]
    fn forward_transitions_only() {
        let mut job = Job::new(3);
        job.transition(JobStatus::Preparing).unwrap();
        assert_eq!(job.phase, JobPhase::Prepare);
        job.transition(JobStatus::Processing).unwrap();
        assert_eq!(job.phase, JobPhase::Process);
        job.transition(JobStatus::Completed).unwrap();

        assert_matches!(
            job.transition(JobStatus::Pending),
            Err(JobError::InvalidTransition { from: JobStatus::Completed, .. })
        );
        assert_matches!(job.fail("late"), Err(JobError::InvalidTransition { .. }));
        assert!(job.error.is_none());
    }

    #[test]
    fn failed_job_cannot_be_resurrected() {
        let mut job = Job::new(1);
        job.fail("render failed").unwrap();
        assert!(job.transition(JobStatus::Preparing).is_err());
        assert_eq!(job.error.as_deref(), Some("render failed"));
    }

    #[test]
    fn failure_clears_artifact() {
        let mut job = Job::new(1);
        job.transition(JobStatus::Preparing).unwrap();
        job.artifact = Some(PathBuf::from("/tmp/a.mov"));
        assert!(job.is_prepared());
        job.fail(CANCELLED_REASON).unwrap();
        assert!(job.artifact.is_none());
        assert_eq!(job.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn progress_only_applies_while_active() {
        let mut job = Job::new(1);
        assert!(!job.apply_progress(&update(1, 10)));

        job.transition(JobStatus::Preparing).unwrap();
        job.transition(JobStatus::Processing).unwrap();
        assert!(job.apply_progress(&update(5, 20)));
        assert_eq!(job.progress.percent(), 25.0);

        job.transition(JobStatus::Completed).unwrap();
        assert!(!job.apply_progress(&update(20, 20)));
        assert_eq!(job.progress.current_frame, 5);
    }

    #[test]
    fn percent_handles_unknown_and_overflowing_totals() {
        assert_eq!(JobProgress::default().percent(), 0.0);
        let over = JobProgress {
            current_frame: 15,
            total_frames: 10,
            ..Default::default()
        };
        assert_eq!(over.percent(), 100.0);
    }

    #[test]
    fn process_cancellation_maps_to_cancelled() {
        let err: JobError = ProcessError::Cancelled.into();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), CANCELLED_REASON);

        let err: JobError = ProcessError::Timeout { elapsed_ms: 10 }.into();
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "Engine timed out after 10ms");
    }
}
