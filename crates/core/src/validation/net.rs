//! URL and port checks for the local progress channel.

use std::net::IpAddr;

use reqwest::Url;

use super::ValidationError;

/// Lowest non-privileged port.
pub const MIN_PORT: i64 = 1024;
pub const MAX_PORT: i64 = 65535;

/// Require an `http`/`https` URL whose host is loopback or public.
///
/// Loopback hosts are always allowed; RFC 1918 private addresses are
/// rejected since nothing on this channel should leave the machine
/// except through loopback.
pub fn validate_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw.trim()).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ValidationError::SchemeNotAllowed(other.to_string())),
    }

    let host = url
        .host_str()
        .ok_or_else(|| ValidationError::InvalidUrl(format!("missing host: {raw}")))?;

    if is_loopback_host(host) {
        return Ok(url);
    }

    if is_private_host(host) {
        return Err(ValidationError::PrivateNetworkHost(host.to_string()));
    }

    Ok(url)
}

/// `localhost`, `127.0.0.0/8` or `::1`.
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

fn is_private_host(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private(),
        _ => false,
    }
}

/// Require an integer port in `1024..=65535`.
pub fn validate_port(port: i64) -> Result<u16, ValidationError> {
    if !(MIN_PORT..=MAX_PORT).contains(&port) {
        return Err(ValidationError::PortOutOfRange(port));
    }
    Ok(port as u16)
}
