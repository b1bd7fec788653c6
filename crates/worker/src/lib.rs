//! Composition root: builds every component from the environment, enqueues
//! the layer references given on the command line and runs the queue.

use std::path::Path;
use std::sync::Arc;

use reelctl_core::auth::{AuthConfig, Authenticator};
use reelctl_core::command::{CommandBuilder, EngineLocation, ProcessingOptions};
use reelctl_core::process::{ProcessRunner, RunnerConfig};
use reelctl_core::types::LayerRef;
use reelctl_core::validation::{
    parse_json_safely, validate_file_size, PathPolicy, ValidationError, DEFAULT_MAX_JSON_DEPTH,
};
use reelctl_pipeline::{
    HostError, HttpHostBridge, Orchestrator, OrchestratorConfig, OrchestratorError, QueueSummary,
};
use reelctl_progress::{ChannelConfig, ProgressChannel};

/// Upper bound for the options file.
pub const MAX_OPTIONS_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("REELCTL_ENGINE_DIR is not set")]
    MissingEngine,

    #[error("No layer references given")]
    NoReferences,

    #[error("Invalid layer reference: {0:?}")]
    InvalidReference(String),

    #[error("Options file: {0}")]
    Options(#[from] ValidationError),

    #[error("Options file does not match the expected shape: {0}")]
    OptionsShape(String),

    #[error("Options file unreadable: {0}")]
    OptionsIo(#[from] std::io::Error),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Queue(#[from] OrchestratorError),
}

/// Parse command-line arguments as layer references.
pub fn parse_references<I>(args: I) -> Result<Vec<LayerRef>, WorkerError>
where
    I: IntoIterator<Item = String>,
{
    let references = args
        .into_iter()
        .map(|arg| {
            arg.trim()
                .parse::<LayerRef>()
                .map_err(|_| WorkerError::InvalidReference(arg))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if references.is_empty() {
        return Err(WorkerError::NoReferences);
    }
    Ok(references)
}

/// Read processing options from `path`, or use the defaults when unset.
pub fn load_options(path: Option<&Path>) -> Result<ProcessingOptions, WorkerError> {
    let Some(path) = path else {
        return Ok(ProcessingOptions::default());
    };
    validate_file_size(path, MAX_OPTIONS_FILE_BYTES)?;
    let text = std::fs::read_to_string(path)?;
    let value = parse_json_safely(&text, DEFAULT_MAX_JSON_DEPTH)?;
    serde_json::from_value(value).map_err(|e| WorkerError::OptionsShape(e.to_string()))
}

/// Wire the components, run every given reference through the queue and
/// tear down. Ctrl-C requests a hard cancel.
pub async fn run<I>(args: I) -> Result<QueueSummary, WorkerError>
where
    I: IntoIterator<Item = String>,
{
    let references = parse_references(args)?;
    let options_path = std::env::var_os("REELCTL_OPTIONS_FILE").filter(|p| !p.is_empty());
    let options = load_options(options_path.as_deref().map(Path::new))?;
    let engine = EngineLocation::from_env().ok_or(WorkerError::MissingEngine)?;
    tracing::info!(
        interpreter = %engine.interpreter.display(),
        jobs = references.len(),
        "Worker starting",
    );

    let auth = Arc::new(Authenticator::new(AuthConfig::from_env()));
    let channel = ProgressChannel::spawn(ChannelConfig::from_env(), auth.clone());
    let runner = Arc::new(ProcessRunner::new(
        RunnerConfig::from_env(),
        PathPolicy::platform_default(),
    ));
    let host = Arc::new(HttpHostBridge::from_env()?);
    let builder = CommandBuilder::new(engine, PathPolicy::platform_default());

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorConfig::from_env(),
        builder,
        host,
        runner,
        channel.clone(),
    ));
    for reference in references {
        orchestrator.enqueue(reference);
    }

    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; cancelling queue");
                orchestrator.cancel(true).await;
            }
        })
    };

    let result = orchestrator.start(&options).await;
    interrupt.abort();
    channel.shutdown().await;
    auth.shutdown();

    let summary = result?;
    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        was_cancelled = summary.was_cancelled,
        "Worker finished",
    );
    Ok(summary)
}
