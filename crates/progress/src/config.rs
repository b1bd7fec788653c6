use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reelctl_core::types::env_or;
use reelctl_core::validation::{is_loopback_host, validate_port};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_PORT_RANGE: u16 = 10;

/// Which transport the channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Server-sent events over a signed URL.
    #[default]
    Stream,
    /// Bidirectional WebSocket.
    Socket,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "sse" => Ok(Self::Stream),
            "socket" | "ws" | "websocket" => Ok(Self::Socket),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Progress channel settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Loopback host the engine listens on.
    pub host: String,
    pub default_port: u16,
    /// Number of consecutive ports probed during discovery.
    pub port_range: u16,
    /// Remembers the last discovered port across sessions.
    pub port_file: Option<PathBuf>,
    pub reconnect_base: Duration,
    pub max_attempts: u32,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub transport: TransportKind,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            default_port: DEFAULT_PORT,
            port_range: DEFAULT_PORT_RANGE,
            port_file: None,
            reconnect_base: Duration::from_millis(1000),
            max_attempts: 5,
            idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            transport: TransportKind::Stream,
        }
    }
}

impl ChannelConfig {
    /// Load channel settings from the environment.
    ///
    /// | Env Var                           | Default     |
    /// |-----------------------------------|-------------|
    /// | `REELCTL_PROGRESS_HOST`           | `127.0.0.1` |
    /// | `REELCTL_PROGRESS_PORT`           | `8765`      |
    /// | `REELCTL_PROGRESS_PORT_RANGE`     | `10`        |
    /// | `REELCTL_PORT_FILE`               | unset       |
    /// | `REELCTL_RECONNECT_BASE_MS`       | `1000`      |
    /// | `REELCTL_RECONNECT_MAX_ATTEMPTS`  | `5`         |
    /// | `REELCTL_IDLE_TIMEOUT_SECS`       | `30`        |
    /// | `REELCTL_HEARTBEAT_INTERVAL_SECS` | `10`        |
    /// | `REELCTL_PROGRESS_TRANSPORT`      | `stream`    |
    ///
    /// A non-loopback host or an out-of-range port falls back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = env_or("REELCTL_PROGRESS_HOST", defaults.host.clone());
        let host = if is_loopback_host(&host) {
            host
        } else {
            tracing::warn!(host = %host, "Progress host must be loopback; using default");
            defaults.host.clone()
        };

        let default_port = match validate_port(env_or(
            "REELCTL_PROGRESS_PORT",
            i64::from(defaults.default_port),
        )) {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid REELCTL_PROGRESS_PORT; using default");
                defaults.default_port
            }
        };

        Self {
            host,
            default_port,
            port_range: env_or("REELCTL_PROGRESS_PORT_RANGE", defaults.port_range).max(1),
            port_file: std::env::var("REELCTL_PORT_FILE")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            reconnect_base: Duration::from_millis(env_or(
                "REELCTL_RECONNECT_BASE_MS",
                defaults.reconnect_base.as_millis() as u64,
            )),
            max_attempts: env_or("REELCTL_RECONNECT_MAX_ATTEMPTS", defaults.max_attempts),
            idle_timeout: Duration::from_secs(env_or(
                "REELCTL_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )),
            heartbeat_interval: Duration::from_secs(
                env_or(
                    "REELCTL_HEARTBEAT_INTERVAL_SECS",
                    defaults.heartbeat_interval.as_secs(),
                )
                .max(1),
            ),
            transport: env_or("REELCTL_PROGRESS_TRANSPORT", defaults.transport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parses_aliases() {
        assert_eq!("stream".parse::<TransportKind>(), Ok(TransportKind::Stream));
        assert_eq!("SSE".parse::<TransportKind>(), Ok(TransportKind::Stream));
        assert_eq!("socket".parse::<TransportKind>(), Ok(TransportKind::Socket));
        assert_eq!("ws".parse::<TransportKind>(), Ok(TransportKind::Socket));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn defaults_are_loopback() {
        let config = ChannelConfig::default();
        assert!(is_loopback_host(&config.host));
        assert_eq!(config.default_port, DEFAULT_PORT);
        assert_eq!(config.max_attempts, 5);
    }
}
