//! Container health probe: `GET http://127.0.0.1:<port>/healthz`.
//!
//! Only the port is taken from `ADDR`; the host is always loopback.

use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe the local server. Returns `true` only on a 200 answer.
pub async fn run(addr: &str) -> bool {
    let Some(port) = extract_port(addr) else {
        return false;
    };
    let url = format!("http://127.0.0.1:{port}/healthz");

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    match client.get(&url).send().await {
        Ok(resp) => resp.status() == reqwest::StatusCode::OK,
        Err(_) => false,
    }
}

/// Port part of `:8090`, `host:8090` or `[::1]:8090`.
pub fn extract_port(addr: &str) -> Option<u16> {
    if let Some(port) = addr.strip_prefix(':') {
        return validate_port(port);
    }
    let (host, port) = addr.rsplit_once(':')?;
    // A bare IPv6 address without brackets has no unambiguous port.
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return None;
    }
    validate_port(port)
}

/// `1..=65535`, decimal digits only.
pub fn validate_port(p: &str) -> Option<u16> {
    if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    p.parse::<u16>().ok().filter(|n| *n >= 1)
}
