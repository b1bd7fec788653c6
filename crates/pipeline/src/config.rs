use std::path::PathBuf;

use reelctl_core::types::env_or;

use crate::host::RenderQuality;

/// Orchestrator settings.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Quality requested from the host for the prepare phase.
    pub render_quality: RenderQuality,
    /// Engine log file tailed during the process phase.
    pub log_file: Option<PathBuf>,
}

impl OrchestratorConfig {
    /// Load from the environment.
    ///
    /// | Env Var                  | Default |
    /// |--------------------------|---------|
    /// | `REELCTL_RENDER_QUALITY` | `full`  |
    /// | `REELCTL_LOG_FILE`       | unset   |
    pub fn from_env() -> Self {
        Self {
            render_quality: env_or("REELCTL_RENDER_QUALITY", RenderQuality::default()),
            log_file: std::env::var("REELCTL_LOG_FILE")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }
}
