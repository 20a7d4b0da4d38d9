//! Error types and HTTP status code mapping.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};

use crate::proxy::BoxBody;

/// Every failure the gateway can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum ProxyError {
    /// The configuration file could not be loaded or failed validation.
    Config(String),
    /// An upstream address is malformed or unparseable.
    InvalidUpstream(String),
    /// A weight update named an address absent from the pool.
    ServerNotFound(String),
    /// Every upstream in the pool is currently marked down.
    NoAliveUpstream,
    /// A network-level error occurred while forwarding to the chosen upstream.
    Forward(String),
    /// The upstream did not respond within the configured request timeout.
    Timeout(Duration),
    /// No configured route matched the request's host and path.
    RouteNotFound,
    /// A TLS certificate or handshake setup problem.
    Tls(String),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidUpstream(msg) => write!(f, "invalid upstream: {msg}"),
            Self::ServerNotFound(addr) => write!(f, "server not found: {addr}"),
            Self::NoAliveUpstream => write!(f, "no upstream available"),
            Self::Forward(msg) => write!(f, "forwarding failed: {msg}"),
            Self::Timeout(d) => write!(f, "upstream timed out after {d:?}"),
            Self::RouteNotFound => write!(f, "no matching route"),
            Self::Tls(msg) => write!(f, "tls error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    /// Returns the HTTP status code corresponding to this error variant.
    ///
    /// Selection exhaustion and forwarding failures both surface as 503:
    /// the upstream set is temporarily unable to serve the request and the
    /// client may retry. Routing misses are 404. Everything else is an
    /// internal fault.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoAliveUpstream | Self::Forward(_) | Self::Timeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::Config(_)
            | Self::InvalidUpstream(_)
            | Self::ServerNotFound(_)
            | Self::Tls(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Converts this error into an HTTP response with a plain-text body.
    ///
    /// Client-facing text stays generic; the detailed message is for logs
    /// only and never leaves the process.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();
        let body = match &self {
            Self::NoAliveUpstream | Self::Forward(_) | Self::Timeout(_) => "service unavailable",
            Self::RouteNotFound => "not found",
            _ => "internal server error",
        };

        Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text_body(body))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(text_body("internal server error"));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Builds a fixed-content [`BoxBody`] from static text.
pub(crate) fn text_body(text: &'static str) -> BoxBody {
    Full::new(Bytes::from_static(text.as_bytes()))
        .map_err(|never| -> Box<dyn std::error::Error + Send + Sync> { match never {} })
        .boxed()
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper::header::InvalidHeaderValue> for ProxyError {
    fn from(err: hyper::header::InvalidHeaderValue) -> Self {
        Self::Internal(err.to_string())
    }
}
