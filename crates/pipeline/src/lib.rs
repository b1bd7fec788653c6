//! Job queue and two-phase render/process pipeline.
//!
//! - [`Job`]: one queued unit of work with a forward-only status machine.
//! - [`HostBridge`]: the opaque host-application interface, with an HTTP
//!   implementation in [`HttpHostBridge`].
//! - [`Orchestrator`]: owns the queue, runs prepare then process over all
//!   pending jobs, attributes engine progress to the in-flight job and
//!   handles cancellation.

pub mod config;
pub mod host;
pub mod job;
pub mod orchestrator;

pub use config::OrchestratorConfig;
pub use host::{HostBridge, HostError, HttpHostBridge, RenderQuality, RenderedArtifact};
pub use job::{Job, JobError, JobId, JobPhase, JobProgress, JobStatus};
pub use orchestrator::{
    Orchestrator, OrchestratorError, QueueEvent, QueueSnapshot, QueueStatus, QueueSummary,
};
