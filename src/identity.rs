//! Client address normalization
//!
//! ka9q-web reports the client of a session as whatever its socket layer printed, which may be
//! `[v6]:port`, `v4:port`, a bare IPv6 address, or a bare host. Connections are keyed on the bare
//! address, so the port has to go.

use std::net::IpAddr;

/// Extract the bare address from a client field.
///
/// Never fails: anything that isn't recognizably `address:port` is returned as-is (minus
/// surrounding whitespace).
pub fn extract_ip(client: &str) -> &str {
    let client = client.trim();

    if let Some(inner) = bracketed_host(client) {
        return inner;
    }

    if client.contains(':') {
        // A bare IPv6 address also contains colons, and its last group may well be all digits.
        if client.parse::<IpAddr>().is_ok() {
            return client;
        }
        if let Some((host, port)) = client.rsplit_once(':')
            && is_port(port)
        {
            return host;
        }
    }

    client
}

/// Match `[inner]` or `[inner]:port`, returning `inner`.
fn bracketed_host(client: &str) -> Option<&str> {
    let rest = client.strip_prefix('[')?;
    let (inner, after) = rest.split_once(']')?;
    if inner.is_empty() {
        return None;
    }
    match after.strip_prefix(':') {
        None if after.is_empty() => Some(inner),
        Some(port) if is_port(port) => Some(inner),
        _ => None,
    }
}

/// Whether the string is a non-empty run of ASCII digits.
fn is_port(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
