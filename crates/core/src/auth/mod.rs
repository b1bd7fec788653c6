//! Bearer tokens and request signatures for the local progress channel.
//!
//! The [`Authenticator`] has exactly one subject, the local panel, and holds
//! at most one live [`AuthToken`]. Creating a token replaces the previous
//! one. Tokens live in memory only; persisting them is the embedder's job.
//!
//! Refresh tokens are stored as their SHA-256 hash, mirroring how a server
//! would store them, so a memory dump of the authenticator state alone does
//! not yield a usable refresh token.

pub mod signing;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::distr::Alphanumeric;
use rand::Rng;
use reqwest::Url;

use crate::hashing::{hex_encode, sha256_hex};
use crate::types::{env_or, Clock, SystemClock, Timestamp};

use signing::{constant_time_eq, sign_request, sign_token};

/// Length of generated access tokens.
pub const TOKEN_LENGTH: usize = 48;

/// Length of generated refresh tokens.
pub const REFRESH_TOKEN_LENGTH: usize = 64;

/// Default access token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Query parameter names used by signed URLs.
pub const QUERY_TOKEN: &str = "auth";
pub const QUERY_TIMESTAMP: &str = "ts";
pub const QUERY_SIGNATURE: &str = "sig";

/// Header names used by signed requests.
pub const HEADER_TIMESTAMP: &str = "x-reelctl-timestamp";
pub const HEADER_NONCE: &str = "x-reelctl-nonce";
pub const HEADER_SIGNATURE: &str = "x-reelctl-signature";

/// Authenticator settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Access token lifetime.
    pub token_ttl: Duration,
    /// Shared HMAC secret. Without one, URLs and headers carry no signature.
    pub secret: Option<String>,
    /// Whether to issue refresh tokens alongside access tokens.
    pub enable_refresh: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl: DEFAULT_TOKEN_TTL,
            secret: None,
            enable_refresh: true,
        }
    }
}

impl AuthConfig {
    /// Load settings from the environment.
    ///
    /// | Env Var                  | Default |
    /// |--------------------------|---------|
    /// | `REELCTL_TOKEN_TTL_SECS` | `3600`  |
    /// | `REELCTL_AUTH_SECRET`    | unset   |
    /// | `REELCTL_ENABLE_REFRESH` | `true`  |
    pub fn from_env() -> Self {
        let secret = std::env::var("REELCTL_AUTH_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        Self {
            token_ttl: Duration::from_secs(env_or(
                "REELCTL_TOKEN_TTL_SECS",
                DEFAULT_TOKEN_TTL.as_secs(),
            )),
            secret,
            enable_refresh: env_or("REELCTL_ENABLE_REFRESH", true),
        }
    }
}

/// A live credential for the progress channel.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Timestamp,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Headers for an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub authorization: String,
    pub timestamp_ms: i64,
    pub nonce: String,
    pub signature: Option<String>,
}

impl AuthHeaders {
    /// Flatten into `(name, value)` pairs ready for an HTTP client.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("authorization", self.authorization.clone()),
            (HEADER_TIMESTAMP, self.timestamp_ms.to_string()),
            (HEADER_NONCE, self.nonce.clone()),
        ];
        if let Some(sig) = &self.signature {
            pairs.push((HEADER_SIGNATURE, sig.clone()));
        }
        pairs
    }
}

/// Why a token or signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("No live token")]
    NoToken,

    #[error("Token expired")]
    Expired,

    #[error("Token mismatch")]
    Mismatch,

    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),
}

/// Token state for the single local subject.
struct LiveToken {
    token: AuthToken,
    refresh_hash: Option<String>,
}

/// Issues and validates the one live token.
///
/// Constructed once by the composition root and shared as
/// `Arc<Authenticator>`.
pub struct Authenticator {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    live: RwLock<Option<LiveToken>>,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            live: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Issue a new token, replacing (and thereby invalidating) any previous one.
    pub fn create_token(&self) -> AuthToken {
        let ttl = chrono::Duration::from_std(self.config.token_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_TOKEN_TTL.as_secs() as i64));
        let refresh = self
            .config
            .enable_refresh
            .then(|| random_string(REFRESH_TOKEN_LENGTH));
        let token = AuthToken {
            token: random_string(TOKEN_LENGTH),
            refresh_token: refresh.clone(),
            expires_at: self.clock.now() + ttl,
        };

        let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
        let replaced = live.is_some();
        *live = Some(LiveToken {
            token: token.clone(),
            refresh_hash: refresh.as_deref().map(|r| sha256_hex(r.as_bytes())),
        });
        tracing::info!(expires_at = %token.expires_at, replaced, "Issued progress channel token");

        token
    }

    /// The live token, if any and not yet expired.
    pub fn current_token(&self) -> Option<AuthToken> {
        self.clear_if_expired();
        let live = self.live.read().unwrap_or_else(|e| e.into_inner());
        live.as_ref().map(|l| l.token.clone())
    }

    /// The live token, creating one on first use or after expiry.
    pub fn ensure_token(&self) -> AuthToken {
        match self.current_token() {
            Some(token) => token,
            None => self.create_token(),
        }
    }

    /// True iff `candidate` is the live, unexpired token.
    pub fn validate_token(&self, candidate: &str) -> bool {
        self.check_token(candidate).is_ok()
    }

    /// Like [`validate_token`](Self::validate_token) but says why.
    ///
    /// An expired token is cleared as a side effect.
    pub fn check_token(&self, candidate: &str) -> Result<(), AuthError> {
        if self.clear_if_expired() {
            return Err(AuthError::Expired);
        }
        let live = self.live.read().unwrap_or_else(|e| e.into_inner());
        let live = live.as_ref().ok_or(AuthError::NoToken)?;
        if constant_time_eq(&live.token.token, candidate) {
            Ok(())
        } else {
            Err(AuthError::Mismatch)
        }
    }

    /// Exchange a refresh token for a fresh access token.
    ///
    /// Returns `None` when `refresh_token` does not match the live token's
    /// refresh token.
    pub fn refresh_token(&self, refresh_token: &str) -> Option<AuthToken> {
        let matches = {
            let live = self.live.read().unwrap_or_else(|e| e.into_inner());
            live.as_ref()
                .and_then(|l| l.refresh_hash.as_deref())
                .is_some_and(|hash| constant_time_eq(hash, &sha256_hex(refresh_token.as_bytes())))
        };
        if !matches {
            tracing::warn!("Rejected refresh attempt with unknown refresh token");
            return None;
        }
        Some(self.create_token())
    }

    /// Append `auth`, `ts` and (with a secret) `sig` query parameters to
    /// `base_url`.
    pub fn sign_authenticated_url(&self, base_url: &str) -> Result<String, AuthError> {
        let token = self.current_token().ok_or(AuthError::NoToken)?;
        let mut url = Url::parse(base_url).map_err(|e| AuthError::InvalidUrl(e.to_string()))?;
        let ts = self.clock.now().timestamp_millis();

        {
            let mut query = url.query_pairs_mut();
            query.append_pair(QUERY_TOKEN, &token.token);
            query.append_pair(QUERY_TIMESTAMP, &ts.to_string());
            if let Some(secret) = &self.config.secret {
                query.append_pair(QUERY_SIGNATURE, &sign_token(secret, &token.token, ts));
            }
        }

        Ok(url.into())
    }

    /// Header-based variant of [`sign_authenticated_url`](Self::sign_authenticated_url)
    /// with a random nonce in the signed message.
    pub fn build_auth_headers(&self) -> Result<AuthHeaders, AuthError> {
        let token = self.current_token().ok_or(AuthError::NoToken)?;
        let timestamp_ms = self.clock.now().timestamp_millis();
        let nonce = random_nonce();
        let signature = self
            .config
            .secret
            .as_deref()
            .map(|secret| sign_request(secret, &token.token, timestamp_ms, &nonce));

        Ok(AuthHeaders {
            authorization: format!("Bearer {}", token.token),
            timestamp_ms,
            nonce,
            signature,
        })
    }

    /// Drop the live token.
    pub fn logout(&self) {
        let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
        if live.take().is_some() {
            tracing::info!("Progress channel token revoked");
        }
    }

    /// Application shutdown hook.
    pub fn shutdown(&self) {
        self.logout();
    }

    /// Clear the live token if it has expired. Returns whether it did.
    fn clear_if_expired(&self) -> bool {
        let now = self.clock.now();
        let expired = {
            let live = self.live.read().unwrap_or_else(|e| e.into_inner());
            live.as_ref().is_some_and(|l| l.token.expires_at <= now)
        };
        if expired {
            let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
            // Re-check under the write lock; another caller may have replaced it.
            if live.as_ref().is_some_and(|l| l.token.expires_at <= now) {
                *live = None;
                tracing::debug!("Cleared expired progress channel token");
                return true;
            }
        }
        false
    }
}

fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_nonce() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex_encode(bytes)
}
