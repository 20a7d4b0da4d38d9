//! HTTP header processing: hop-by-hop removal, forwarding metadata
//! injection, and host rewriting.
//!
//! Implements the header-level requirements of RFC 7230 Section 6.1
//! (hop-by-hop header handling) plus the forwarding headers every proxied
//! request carries: `X-Forwarded-For`, `X-Real-IP`, and the gateway's
//! `X-Proxy-Id` identity marker for diagnosing multi-hop topologies.

use std::net::SocketAddr;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;

/// Value of the `X-Proxy-Id` header stamped on every forwarded request.
pub const PROXY_ID: &str = "stockade";

/// Removes all hop-by-hop headers from the given header map.
///
/// Strips the standard set defined in RFC 7230 Section 6.1 (`Connection`,
/// `Keep-Alive`, `Proxy-Authenticate`, `Proxy-Authorization`, `TE`,
/// `Trailers`, `Transfer-Encoding`, `Upgrade`), plus any additional
/// header names declared in the `Connection` header value.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let conn: Vec<HeaderName> = headers
        .get("connection")
        .and_then(|val| val.to_str().ok())
        .map(|val| {
            val.split(',')
                .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
                .collect()
        })
        .unwrap_or_default();

    conn.iter().for_each(|name| {
        headers.remove(name);
    });

    [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ]
    .iter()
    .for_each(|name| {
        headers.remove(*name);
    });
}

/// Injects the forwarding metadata headers into the given header map.
///
/// - `X-Forwarded-For` is appended to any existing value (preserving
///   upstream proxy chains) with the client's IP address.
/// - `X-Real-IP` is set to the client's IP address, replacing any value a
///   client may have tried to smuggle through.
/// - `X-Proxy-Id` is set to this gateway's fixed identity.
pub fn inject_forwarding_headers(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();

    let xff_value = headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
        .map(|existing| format!("{existing}, {client_ip}"))
        .unwrap_or_else(|| client_ip.clone());

    if let Ok(val) = HeaderValue::from_str(&xff_value) {
        headers.insert("x-forwarded-for", val);
    }
    if let Ok(val) = HeaderValue::from_str(&client_ip) {
        headers.insert("x-real-ip", val);
    }
    headers.insert("x-proxy-id", HeaderValue::from_static(PROXY_ID));
}

/// Rewrites the `Host` header to match the upstream authority.
///
/// This ensures the upstream server receives the correct `Host` value
/// regardless of what the client originally sent.
pub fn rewrite_host(headers: &mut HeaderMap, upstream_auth: &Authority) {
    if let Ok(val) = HeaderValue::from_str(upstream_auth.as_str()) {
        headers.insert(hyper::header::HOST, val);
    }
}
