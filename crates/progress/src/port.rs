//! Loopback port discovery.
//!
//! Probes a small range of consecutive ports starting from the remembered
//! port (or the configured default). The first hit is remembered in memory
//! and, when a port file is configured, persisted so the next session
//! probes it first.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use reelctl_core::validation::validate_port;
use tokio::net::{TcpListener, TcpStream};

use crate::config::ChannelConfig;

/// Connect timeout for a single reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

pub struct PortDiscovery {
    host: String,
    default_port: u16,
    range: u16,
    port_file: Option<PathBuf>,
    remembered: Mutex<Option<u16>>,
}

impl PortDiscovery {
    pub fn new(host: impl Into<String>, default_port: u16, range: u16, port_file: Option<PathBuf>) -> Self {
        let remembered = port_file.as_deref().and_then(read_port_file);
        if let Some(port) = remembered {
            tracing::debug!(port, "Loaded remembered progress port");
        }
        Self {
            host: host.into(),
            default_port,
            range: range.max(1),
            port_file,
            remembered: Mutex::new(remembered),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(
            config.host.clone(),
            config.default_port,
            config.port_range,
            config.port_file.clone(),
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn remembered(&self) -> Option<u16> {
        *self.remembered.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ports in probe order: the remembered (or default) range first, then
    /// the default range if it differs.
    pub fn candidates(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        let start = self.remembered().unwrap_or(self.default_port);
        for base in [start, self.default_port] {
            for offset in 0..self.range {
                let Ok(port) = validate_port(i64::from(base) + i64::from(offset)) else {
                    continue;
                };
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }
        ports
    }

    /// First candidate that accepts a TCP connection (client role).
    pub async fn find_reachable(&self) -> Option<u16> {
        for port in self.candidates() {
            let probe = TcpStream::connect((self.host.as_str(), port));
            if let Ok(Ok(_)) = tokio::time::timeout(PROBE_TIMEOUT, probe).await {
                tracing::debug!(port, "Found reachable progress port");
                self.remember(port).await;
                return Some(port);
            }
        }
        tracing::debug!(host = %self.host, "No reachable progress port");
        None
    }

    /// First candidate nothing is listening on yet (server role).
    pub async fn find_free(&self) -> Option<u16> {
        for port in self.candidates() {
            if TcpListener::bind((self.host.as_str(), port)).await.is_ok() {
                tracing::debug!(port, "Found free progress port");
                self.remember(port).await;
                return Some(port);
            }
        }
        None
    }

    /// Remember `port` for this and the next session.
    pub async fn remember(&self, port: u16) {
        *self.remembered.lock().unwrap_or_else(|e| e.into_inner()) = Some(port);

        let Some(path) = &self.port_file else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(path, port.to_string()).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist progress port");
        }
    }
}

fn read_port_file(path: &Path) -> Option<u16> {
    let raw = std::fs::read_to_string(path).ok()?;
    let port: i64 = raw.trim().parse().ok()?;
    validate_port(port).ok()
}
