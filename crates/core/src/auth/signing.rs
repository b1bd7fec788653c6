//! HMAC-SHA256 request signing and verification for the progress channel.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::hashing::hex_encode;

type HmacSha256 = Hmac<Sha256>;

/// Signed requests older (or further in the future) than this are replays.
pub const REPLAY_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Hex-encoded HMAC-SHA256 of `message` under `secret`.
pub fn compute_signature(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex_encode(mac.finalize().into_bytes())
}

/// Signature carried by signed URLs: HMAC over `token:timestamp`.
pub fn sign_token(secret: &str, token: &str, timestamp_ms: i64) -> String {
    compute_signature(secret, &format!("{token}:{timestamp_ms}"))
}

/// Signature carried by signed headers: HMAC over `token:timestamp:nonce`.
pub fn sign_request(secret: &str, token: &str, timestamp_ms: i64, nonce: &str) -> String {
    compute_signature(secret, &format!("{token}:{timestamp_ms}:{nonce}"))
}

/// Constant-time string equality.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Verify a header-signed request against the current time.
pub fn verify_request_signature(
    token: &str,
    timestamp_ms: i64,
    nonce: &str,
    signature: &str,
    secret: &str,
) -> bool {
    verify_request_signature_at(
        token,
        timestamp_ms,
        nonce,
        signature,
        secret,
        Utc::now().timestamp_millis(),
    )
}

/// Verify a header-signed request as of `now_ms`.
///
/// The replay window is enforced independently of the signature: a
/// correctly signed but stale request is still rejected.
pub fn verify_request_signature_at(
    token: &str,
    timestamp_ms: i64,
    nonce: &str,
    signature: &str,
    secret: &str,
    now_ms: i64,
) -> bool {
    if now_ms.abs_diff(timestamp_ms) > REPLAY_WINDOW_MS.unsigned_abs() {
        tracing::debug!(timestamp_ms, now_ms, "Rejecting signature outside replay window");
        return false;
    }
    let expected = sign_request(secret, token, timestamp_ms, nonce);
    constant_time_eq(&expected, signature)
}
