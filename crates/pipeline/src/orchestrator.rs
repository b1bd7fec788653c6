//! The job queue and its two-phase pipeline.
//!
//! [`Orchestrator::start`] runs the **prepare** phase (select + render in
//! the host) over every pending job, then the **process** phase (engine run
//! + import) over every job that prepared successfully, both in FIFO order.
//! Jobs enqueued while the queue runs get another round before it goes idle.
//!
//! Exactly one job is in flight at a time. The queue lives behind a
//! synchronous mutex that is never held across an `.await`; observers only
//! ever see [`QueueSnapshot`] copies.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use reelctl_core::command::{CommandBuilder, ProcessingOptions};
use reelctl_core::process::{CommandRunner, RunRequest};
use reelctl_core::types::LayerRef;
use reelctl_core::validation::{validate_filename, ValidationError};
use reelctl_events::{EventBus, Subscription};
use reelctl_progress::{ChannelEvent, ProgressFeed};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::host::{HostBridge, HostError};
use crate::job::{Job, JobError, JobId, JobStatus};

/// Appended to the render's file stem to name the engine output.
pub const OUTPUT_SUFFIX: &str = "_processed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Idle,
    Running,
}

/// Point-in-time copy of the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub status: QueueStatus,
    /// The in-flight job, if any.
    pub current: Option<JobId>,
    pub jobs: Vec<Job>,
}

impl QueueSnapshot {
    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| &job.id == id)
    }
}

/// Outcome of one [`Orchestrator::start`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs interrupted by cancellation (not counted in `failed`).
    pub cancelled: usize,
    pub was_cancelled: bool,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Any queue mutation.
    Updated(QueueSnapshot),
    /// A run ended.
    Finished(QueueSummary),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Queue is already running")]
    AlreadyRunning,

    #[error("Queue has no pending or prepared jobs")]
    EmptyQueue,

    #[error("Unknown job {0}")]
    UnknownJob(JobId),

    #[error("Job {0} is in flight")]
    JobInFlight(JobId),
}

struct QueueState {
    jobs: Vec<Job>,
    running: bool,
    current: Option<JobId>,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    builder: CommandBuilder,
    host: Arc<dyn HostBridge>,
    runner: Arc<dyn CommandRunner>,
    feed: Arc<dyn ProgressFeed>,
    state: Mutex<QueueState>,
    events: EventBus<QueueEvent>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        builder: CommandBuilder,
        host: Arc<dyn HostBridge>,
        runner: Arc<dyn CommandRunner>,
        feed: Arc<dyn ProgressFeed>,
    ) -> Self {
        Self {
            config,
            builder,
            host,
            runner,
            feed,
            state: Mutex::new(QueueState {
                jobs: Vec::new(),
                running: false,
                current: None,
                cancel: CancellationToken::new(),
            }),
            events: EventBus::default(),
        }
    }

    // ---- queue management ----

    /// Append a pending job. A running queue picks it up before going idle.
    pub fn enqueue(&self, reference: LayerRef) -> JobId {
        let job = Job::new(reference);
        let id = job.id.clone();
        self.lock().jobs.push(job);
        tracing::info!(job_id = %id, reference, "Job enqueued");
        self.notify();
        id
    }

    /// Remove a job that is not in flight.
    pub fn remove(&self, id: &JobId) -> Result<Job, OrchestratorError> {
        let removed = {
            let mut state = self.lock();
            if state.current.as_ref() == Some(id) {
                return Err(OrchestratorError::JobInFlight(id.clone()));
            }
            let index = state
                .jobs
                .iter()
                .position(|job| &job.id == id)
                .ok_or_else(|| OrchestratorError::UnknownJob(id.clone()))?;
            state.jobs.remove(index)
        };
        tracing::info!(job_id = %id, "Job removed");
        self.notify();
        Ok(removed)
    }

    /// Drop completed and failed jobs. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let removed = {
            let mut state = self.lock();
            let before = state.jobs.len();
            state.jobs.retain(|job| !job.status.is_terminal());
            before - state.jobs.len()
        };
        if removed > 0 {
            self.notify();
        }
        removed
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        snapshot_of(&self.lock())
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Call `callback` with a fresh snapshot after every queue mutation.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(QueueSnapshot) + Send + 'static,
    {
        self.events.subscribe_fn(move |event| {
            if let QueueEvent::Updated(snapshot) = event {
                callback(snapshot);
            }
        })
    }

    // ---- running ----

    /// Request cancellation of the current run.
    ///
    /// No further job starts and the in-flight job ends as failed with
    /// reason `cancelled`. A `hard` cancel also kills engine processes by
    /// name. Returns `false` if the queue was idle.
    pub async fn cancel(&self, hard: bool) -> bool {
        let (running, token) = {
            let state = self.lock();
            (state.running, state.cancel.clone())
        };
        if !running {
            return false;
        }
        tracing::info!(hard, "Cancelling queue");
        token.cancel();
        if hard {
            self.runner.kill_known_processes().await;
        }
        true
    }

    /// Run every pending job through both phases.
    pub async fn start(
        &self,
        options: &ProcessingOptions,
    ) -> Result<QueueSummary, OrchestratorError> {
        let cancel = {
            let mut state = self.lock();
            if state.running {
                return Err(OrchestratorError::AlreadyRunning);
            }
            if !state.jobs.iter().any(is_runnable) {
                return Err(OrchestratorError::EmptyQueue);
            }
            state.running = true;
            state.cancel = CancellationToken::new();
            state.cancel.clone()
        };
        self.notify();
        tracing::info!(processing = options.has_processing_enabled(), "Queue started");

        let mut summary = QueueSummary::default();
        loop {
            self.prepare_phase(&cancel, &mut summary).await;
            self.process_phase(options, &cancel, &mut summary).await;

            if cancel.is_cancelled() {
                break;
            }
            let more = self
                .lock()
                .jobs
                .iter()
                .any(|job| job.status == JobStatus::Pending);
            if !more {
                break;
            }
            tracing::info!("Jobs added while running; starting another round");
        }
        summary.was_cancelled = cancel.is_cancelled();

        {
            let mut state = self.lock();
            state.running = false;
            state.current = None;
        }
        self.notify();

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Queue finished",
        );
        self.events.publish(QueueEvent::Finished(summary));
        Ok(summary)
    }

    async fn prepare_phase(&self, cancel: &CancellationToken, summary: &mut QueueSummary) {
        for id in self.job_ids(|job| job.status == JobStatus::Pending) {
            if cancel.is_cancelled() {
                tracing::info!("Cancellation requested; stopping prepare phase");
                break;
            }
            let Some(job) = self.begin(&id, JobStatus::Preparing) else {
                continue;
            };
            tracing::info!(job_id = %id, reference = job.reference, "Preparing job");

            let result = self.prepare_one(job.reference, cancel).await;
            match settle(result, cancel) {
                Ok(artifact) => {
                    tracing::info!(job_id = %id, artifact = %artifact.display(), "Job prepared");
                    self.finish_prepare(&id, artifact);
                }
                Err(e) => self.fail_job(&id, e, summary),
            }
        }
    }

    async fn prepare_one(
        &self,
        reference: LayerRef,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        if !self.host.select_by_reference(reference).await? {
            return Err(HostError::NotSelected(reference).into());
        }
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let rendered = self
            .host
            .render_current_selection(self.config.render_quality)
            .await?;
        Ok(rendered.artifact_path)
    }

    async fn process_phase(
        &self,
        options: &ProcessingOptions,
        cancel: &CancellationToken,
        summary: &mut QueueSummary,
    ) {
        for id in self.job_ids(Job::is_prepared) {
            if cancel.is_cancelled() {
                tracing::info!("Cancellation requested; stopping process phase");
                break;
            }
            let Some(job) = self.begin(&id, JobStatus::Processing) else {
                continue;
            };
            let Some(artifact) = job.artifact else {
                continue;
            };
            tracing::info!(job_id = %id, "Processing job");

            let result = self.process_one(&id, &artifact, options, cancel).await;
            match settle(result, cancel) {
                Ok(()) => self.complete_job(&id, summary),
                Err(e) => self.fail_job(&id, e, summary),
            }
        }
    }

    /// Process one prepared job: run the engine on its render and import
    /// the result, or import the render directly when nothing is enabled.
    async fn process_one(
        &self,
        id: &JobId,
        artifact: &Path,
        options: &ProcessingOptions,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        if !options.has_processing_enabled() {
            tracing::debug!(job_id = %id, "No processing enabled; importing render directly");
            self.host.import_artifact(artifact).await?;
            return Ok(());
        }

        let output = processed_output_path(artifact)?;
        let mut command = self.builder.build(options, artifact, &output)?;
        match self.feed.prepare_endpoint().await {
            Ok(url) => command = command.with_progress_endpoint(&url)?,
            Err(e) => tracing::warn!(
                job_id = %id,
                error = %e,
                "Progress endpoint unavailable; running without live progress",
            ),
        }

        // Subscribe before spawning so no early report is missed.
        let mut progress = self.feed.subscribe();
        let (log_tx, mut log_rx) = mpsc::unbounded_channel();
        let mut request = RunRequest::new(command);
        request.expected_output = Some(output.clone());
        if let Some(log_file) = &self.config.log_file {
            request.log_file = Some(log_file.clone());
            request.log_sink = Some(log_tx);
        } else {
            drop(log_tx);
        }

        let run = self.runner.run(request, cancel.child_token());
        tokio::pin!(run);
        let mut feed_open = true;
        let mut logs_open = true;

        let result = loop {
            tokio::select! {
                biased;
                result = &mut run => break result,
                event = progress.recv(), if feed_open => match event {
                    Ok(event) => self.apply_feed_event(id, event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(job_id = %id, skipped, "Progress reports dropped");
                    }
                    Err(RecvError::Closed) => feed_open = false,
                },
                line = log_rx.recv(), if logs_open => match line {
                    Some(line) => tracing::debug!(job_id = %id, line = %line, "engine"),
                    None => logs_open = false,
                },
            }
        };

        // Reports already buffered still belong to this job.
        while let Ok(event) = progress.try_recv() {
            self.apply_feed_event(id, event);
        }

        result?;
        self.host.import_artifact(&output).await?;
        Ok(())
    }

    fn apply_feed_event(&self, id: &JobId, event: ChannelEvent) {
        match event {
            ChannelEvent::Progress(update) => {
                let applied = {
                    let mut state = self.lock();
                    if state.current.as_ref() != Some(id) {
                        false
                    } else {
                        state
                            .jobs
                            .iter_mut()
                            .find(|job| &job.id == id)
                            .is_some_and(|job| job.apply_progress(&update))
                    }
                };
                if applied {
                    tracing::trace!(job_id = %id, frame = update.frame, total = update.total_frames, "Job progress");
                    self.notify();
                }
            }
            ChannelEvent::ConnectionFailed { attempts } => tracing::warn!(
                job_id = %id,
                attempts,
                "Progress channel gave up; job continues without live progress",
            ),
            ChannelEvent::StateChanged(state) => {
                tracing::debug!(job_id = %id, state = %state, "Progress channel state");
            }
        }
    }

    // ---- state helpers ----

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        self.events.publish(QueueEvent::Updated(snapshot));
    }

    fn job_ids(&self, filter: impl Fn(&Job) -> bool) -> Vec<JobId> {
        self.lock()
            .jobs
            .iter()
            .filter(|job| filter(job))
            .map(|job| job.id.clone())
            .collect()
    }

    /// Move a job into an active status and bind it as the current job.
    /// Returns a copy, or `None` if the job vanished or cannot move.
    fn begin(&self, id: &JobId, status: JobStatus) -> Option<Job> {
        let job = {
            let mut state = self.lock();
            let job = state.jobs.iter_mut().find(|job| &job.id == id)?;
            if let Err(e) = job.transition(status) {
                tracing::warn!(job_id = %id, error = %e, "Skipping job");
                return None;
            }
            let copy = job.clone();
            state.current = Some(id.clone());
            copy
        };
        self.notify();
        Some(job)
    }

    fn finish_prepare(&self, id: &JobId, artifact: PathBuf) {
        {
            let mut state = self.lock();
            if let Some(job) = state.jobs.iter_mut().find(|job| &job.id == id) {
                job.artifact = Some(artifact);
            }
            state.current = None;
        }
        self.notify();
    }

    fn complete_job(&self, id: &JobId, summary: &mut QueueSummary) {
        let completed = {
            let mut state = self.lock();
            state.current = None;
            state
                .jobs
                .iter_mut()
                .find(|job| &job.id == id)
                .map(|job| job.transition(JobStatus::Completed))
        };
        match completed {
            Some(Ok(())) => {
                summary.succeeded += 1;
                tracing::info!(job_id = %id, "Job completed");
            }
            Some(Err(e)) => tracing::error!(job_id = %id, error = %e, "Could not complete job"),
            None => tracing::warn!(job_id = %id, "Completed job no longer queued"),
        }
        self.notify();
    }

    fn fail_job(&self, id: &JobId, error: JobError, summary: &mut QueueSummary) {
        let reason = error.to_string();
        let recorded = {
            let mut state = self.lock();
            state.current = None;
            state
                .jobs
                .iter_mut()
                .find(|job| &job.id == id)
                .map(|job| job.fail(reason.clone()))
        };

        if error.is_cancelled() {
            summary.cancelled += 1;
            tracing::info!(job_id = %id, "Job cancelled");
        } else {
            summary.failed += 1;
            tracing::error!(job_id = %id, error = %reason, "Job failed");
        }
        if let Some(Err(e)) = recorded {
            tracing::warn!(job_id = %id, error = %e, "Could not record job failure");
        }
        self.notify();
    }
}

/// Waiting for the prepare phase, or rendered and waiting for processing.
fn is_runnable(job: &Job) -> bool {
    job.status == JobStatus::Pending || job.is_prepared()
}

fn snapshot_of(state: &QueueState) -> QueueSnapshot {
    QueueSnapshot {
        status: if state.running {
            QueueStatus::Running
        } else {
            QueueStatus::Idle
        },
        current: state.current.clone(),
        jobs: state.jobs.clone(),
    }
}

/// Once cancellation is requested, the in-flight job ends as cancelled
/// however its last call returned.
fn settle<T>(result: Result<T, JobError>, cancel: &CancellationToken) -> Result<T, JobError> {
    if cancel.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        result
    }
}

/// `<dir>/<stem>_processed.<ext>` next to the render.
pub fn processed_output_path(artifact: &Path) -> Result<PathBuf, ValidationError> {
    let stem = artifact
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or(ValidationError::Empty("artifact file name"))?;
    let extension = artifact
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");
    let name = validate_filename(&format!("{stem}{OUTPUT_SUFFIX}.{extension}"))?;
    Ok(artifact.with_file_name(name))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn output_path_sits_next_to_render() {
        assert_eq!(
            processed_output_path(Path::new("/tmp/renders/layer_3.mov")).unwrap(),
            PathBuf::from("/tmp/renders/layer_3_processed.mov")
        );
        assert_eq!(
            processed_output_path(Path::new("/tmp/renders/layer")).unwrap(),
            PathBuf::from("/tmp/renders/layer_processed.mp4")
        );
    }

    #[test]
    fn output_path_rejects_unknown_extension() {
        assert_matches!(
            processed_output_path(Path::new("/tmp/renders/clip.exe")),
            Err(ValidationError::ExtensionNotAllowed(_))
        );
    }

    #[test]
    fn settle_prefers_cancellation() {
        let cancel = CancellationToken::new();
        assert!(settle(Ok::<_, JobError>(1), &cancel).is_ok());
        cancel.cancel();
        assert_matches!(settle(Ok::<_, JobError>(1), &cancel), Err(JobError::Cancelled));
    }
}
