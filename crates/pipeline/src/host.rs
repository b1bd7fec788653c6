//! Host-application bridge.
//!
//! The host (the creative application hosting the panel) is reached through
//! an opaque RPC surface: select a layer, render the current selection,
//! import a file. Calls may be slow and may fail; no timeout is applied
//! here since timeout policy belongs to the bridge itself.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use reelctl_core::types::LayerRef;
use reelctl_core::validation::{validate_url, ValidationError};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST_BRIDGE_URL: &str = "http://127.0.0.1:7410";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderQuality {
    Draft,
    #[default]
    Full,
}

impl FromStr for RenderQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" | "preview" => Ok(Self::Draft),
            "full" | "final" => Ok(Self::Full),
            other => Err(format!("unknown render quality '{other}'")),
        }
    }
}

/// Result of a successful render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedArtifact {
    pub artifact_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Layer {0} could not be selected")]
    NotSelected(LayerRef),

    #[error("Bridge unreachable: {0}")]
    Transport(String),

    #[error("Bridge rejected {operation} ({status}): {message}")]
    Rejected {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("Malformed bridge response: {0}")]
    Decode(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[async_trait]
pub trait HostBridge: Send + Sync {
    /// Select the layer behind `reference`. `Ok(false)` if it no longer exists.
    async fn select_by_reference(&self, reference: LayerRef) -> Result<bool, HostError>;

    /// Render the current selection to an intermediate file.
    async fn render_current_selection(
        &self,
        quality: RenderQuality,
    ) -> Result<RenderedArtifact, HostError>;

    /// Import a processed file back into the host document.
    async fn import_artifact(&self, path: &Path) -> Result<(), HostError>;
}

#[derive(Serialize)]
struct SelectRequest {
    reference: LayerRef,
}

#[derive(Deserialize)]
struct SelectResponse {
    selected: bool,
}

#[derive(Serialize)]
struct RenderRequest {
    quality: RenderQuality,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportRequest<'a> {
    artifact_path: &'a Path,
}

/// JSON-over-HTTP bridge: `POST /select`, `POST /render`, `POST /import`.
#[derive(Debug)]
pub struct HttpHostBridge {
    base: Url,
    client: reqwest::Client,
}

impl HttpHostBridge {
    pub fn new(base_url: &str) -> Result<Self, HostError> {
        let base = validate_url(base_url)?;
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| HostError::Transport(e.to_string()))?;
        Ok(Self { base, client })
    }

    /// From `REELCTL_HOST_BRIDGE_URL`, defaulting to the local bridge.
    pub fn from_env() -> Result<Self, HostError> {
        let url = std::env::var("REELCTL_HOST_BRIDGE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST_BRIDGE_URL.to_string());
        Self::new(&url)
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn call<B: Serialize + Sync, R: DeserializeOwned + Send>(
        &self,
        operation: &'static str,
        body: &B,
    ) -> Result<R, HostError> {
        let url = self
            .base
            .join(operation)
            .map_err(|e| HostError::Transport(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| HostError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HostError::Rejected {
                operation,
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| HostError::Decode(e.without_url().to_string()))
    }
}

#[async_trait]
impl HostBridge for HttpHostBridge {
    async fn select_by_reference(&self, reference: LayerRef) -> Result<bool, HostError> {
        let response: SelectResponse = self.call("select", &SelectRequest { reference }).await?;
        Ok(response.selected)
    }

    async fn render_current_selection(
        &self,
        quality: RenderQuality,
    ) -> Result<RenderedArtifact, HostError> {
        self.call("render", &RenderRequest { quality }).await
    }

    async fn import_artifact(&self, path: &Path) -> Result<(), HostError> {
        let _: serde_json::Value = self
            .call("import", &ImportRequest { artifact_path: path })
            .await?;
        Ok(())
    }
}
