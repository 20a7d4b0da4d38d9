//! Host and path routing onto per-route proxies.
//!
//! Each listener owns one [`Router`]: an ordered table mapping the
//! listener's host plus a path prefix to a [`ProxyServer`]. Matching is
//! exact on host (the request `Host` header with any port stripped) and
//! prefix on path; among multiple matching routes the longest prefix wins,
//! with configuration order breaking exact-length ties. Requests with no
//! matching route receive a plain-text 404.
//!
//! When a route is configured with `strip_prefix`, the matched prefix is
//! removed from the path before dispatch; a fully stripped path becomes `/`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::{Request, Response, Uri};
use tracing::debug;

use crate::config::ValidatedServer;
use crate::proxy::{BoxBody, HttpsClient, ProxyServer};
use crate::{ProxyError, Result};

type StdError = Box<dyn std::error::Error + Send + Sync>;

/// One routing table entry.
#[derive(Debug)]
pub struct RouteEntry {
    path_prefix: String,
    strip_prefix: bool,
    proxy: Arc<ProxyServer>,
}

impl RouteEntry {
    /// Creates an entry binding `path_prefix` to `proxy`.
    pub fn new(path_prefix: impl Into<String>, strip_prefix: bool, proxy: Arc<ProxyServer>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            strip_prefix,
            proxy,
        }
    }

    /// Returns the path prefix this entry matches.
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Returns the proxy behind this entry.
    pub fn proxy(&self) -> &Arc<ProxyServer> {
        &self.proxy
    }
}

/// The routing table for one listener.
#[derive(Debug)]
pub struct Router {
    host: String,
    routes: Vec<RouteEntry>,
}

impl Router {
    /// Creates a router for `host` over the given entries.
    ///
    /// Entries are ordered longest-prefix-first at construction (stable, so
    /// configuration order breaks ties), making `find` a first-match scan.
    pub fn new(host: impl Into<String>, mut routes: Vec<RouteEntry>) -> Self {
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Self {
            host: host.into(),
            routes,
        }
    }

    /// Builds a router for a validated listener, constructing one
    /// [`ProxyServer`] (and its health checker) per route.
    pub fn from_server(server: &ValidatedServer, client: HttpsClient) -> Result<Self> {
        let routes = server
            .routes
            .iter()
            .map(|route| {
                let proxy = ProxyServer::from_route(route, client.clone())?;
                Ok(RouteEntry::new(
                    route.path_prefix.clone(),
                    route.strip_prefix,
                    Arc::new(proxy),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(server.host.clone(), routes))
    }

    /// Returns the host this router matches.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the route entries, longest prefix first.
    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    /// Finds the route for `host` and `path`, if any.
    pub fn find(&self, host: &str, path: &str) -> Option<&RouteEntry> {
        if host != self.host {
            return None;
        }
        self.routes
            .iter()
            .find(|route| path.starts_with(&route.path_prefix))
    }

    /// Handles one inbound request: route, optionally strip the prefix,
    /// and dispatch. Errors are converted into their HTTP responses here,
    /// so the connection layer always gets a response to write.
    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<BoxBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<StdError>,
    {
        let host = request_host(&req).to_owned();
        let path = req.uri().path();

        let Some(route) = self.find(&host, path) else {
            debug!(host = %host, path = %path, "no matching route");
            return ProxyError::RouteNotFound.into_response();
        };

        let req = if route.strip_prefix {
            strip_route_prefix(req, &route.path_prefix)
        } else {
            req
        };

        match route.proxy.handle(req, client_addr).await {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        }
    }

    /// Stops every route's health checker.
    pub async fn shutdown(&self) {
        for route in &self.routes {
            route.proxy.shutdown().await;
        }
    }
}

/// Extracts the request's host, preferring the `Host` header and falling
/// back to the URI authority, with any port stripped.
fn request_host<B>(req: &Request<B>) -> &str {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or("");

    host_without_port(raw)
}

/// Strips a trailing `:port` from a host value, leaving IPv6 literals intact.
fn host_without_port(host: &str) -> &str {
    if let Some(bracket_end) = host.rfind(']') {
        // IPv6 literal, possibly with a port after the bracket.
        return &host[..=bracket_end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Removes `prefix` from the request path, preserving the query string.
/// A fully stripped path becomes `/`.
fn strip_route_prefix<B>(mut req: Request<B>, prefix: &str) -> Request<B> {
    let uri = req.uri();
    let path = uri.path();

    let Some(rest) = path.strip_prefix(prefix) else {
        return req;
    };

    let stripped = if rest.starts_with('/') {
        rest.to_owned()
    } else {
        format!("/{rest}")
    };

    let new_pq = match uri.query() {
        Some(q) => format!("{stripped}?{q}"),
        None => stripped,
    };

    if let Ok(pq) = new_pq.parse::<hyper::http::uri::PathAndQuery>() {
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(pq);
        if let Ok(new_uri) = Uri::from_parts(parts) {
            *req.uri_mut() = new_uri;
        }
    }

    req
}
