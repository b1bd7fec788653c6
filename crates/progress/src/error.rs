use std::time::Duration;

use reelctl_core::auth::AuthError;
use reelctl_core::validation::ValidationError;

/// Why a channel session ended or could not start.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected HTTP status {0}")]
    Http(u16),

    #[error("Authentication required")]
    AuthRequired,

    #[error("No heartbeat or progress within {0:?}")]
    IdleTimeout(Duration),

    #[error("Stream closed by peer")]
    Closed,

    #[error("No reachable progress port")]
    NoPortAvailable,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}
