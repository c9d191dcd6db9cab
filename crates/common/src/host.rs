//! Host name normalization.
//!
//! Both the plaintext dispatcher (Host header) and the SNI resolver
//! (ClientHello server name) key their lookups on the same normalized form:
//! ASCII-lowercased, port suffix removed, trailing root dot removed.

/// Strip a trailing `:port` suffix from a Host header value.
///
/// Bracketed IPv6 literals keep their brackets (`[::1]:8080` -> `[::1]`).
/// A bare IPv6 literal without brackets is returned unchanged, since its
/// colons are not a port separator.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

/// Normalize a raw host (Host header, URI authority, or SNI name) into the
/// routing key form.
///
/// Returns `None` when nothing usable remains.
pub fn normalize_host(raw: &str) -> Option<String> {
    let host = strip_port(raw.trim());
    let host = host.strip_suffix('.').unwrap_or(host);

    if host.is_empty() {
        return None;
    }

    Some(host.to_ascii_lowercase())
}
