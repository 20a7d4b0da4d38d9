//! Per-request dispatch: selection, connection accounting, and forwarding.
//!
//! [`ProxyServer`] is the per-route entry point. For each inbound request it
//! asks its [`LoadBalancer`] for an alive backend, tracks the backend's
//! in-flight connection count for the duration of the dispatch, injects the
//! forwarding headers, and forwards the request with a bounded timeout.
//!
//! A forwarding failure (connection refused, reset, timeout) surfaces to the
//! client as 503 and is logged, but does **not** change the backend's health
//! state; only the periodic health checker does that. There is no retry
//! against another backend within a single inbound request.
//!
//! Every request is assigned a monotonically increasing id and wrapped in a
//! [`tracing::Span`] carrying structured fields for observability.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{Instrument, debug, info, warn};

use crate::balancer::LoadBalancer;
use crate::config::{RuntimeConfig, ValidatedRoute};
use crate::health::HealthChecker;
use crate::headers;
use crate::upstream::{UpstreamPool, UpstreamServer};
use crate::{ProxyError, Result, tls};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for both request forwarding and response streaming.
///
/// Wraps any body implementation behind a single boxed trait object,
/// allowing the dispatch path to accept requests with arbitrary body types
/// (e.g. `Incoming`, `Full<Bytes>`, `Empty<Bytes>`) and return a uniform
/// response type regardless of origin.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, StdError>;

/// The HTTP client type for plain TCP upstream connections.
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// The HTTPS-capable client type, also used for plain `http://` upstreams.
pub type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, BoxBody>;

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Constructs a new [`HttpClient`] for plain HTTP upstream connections.
pub fn build_client(config: &RuntimeConfig) -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(HttpConnector::new())
}

/// Constructs a new [`HttpsClient`] capable of both HTTP and HTTPS
/// upstream connections, using the Mozilla root certificate store for
/// server verification.
pub fn build_https_client(config: &RuntimeConfig) -> HttpsClient {
    let connector = tls::build_https_connector();
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(connector)
}

/// Scoped in-flight connection accounting for one dispatched request.
///
/// Increments the selected backend's counter on acquisition and decrements
/// it on drop, so the pair holds on every exit path: success, forwarding
/// error, timeout, or task cancellation when the client goes away.
#[derive(Debug)]
pub struct ConnectionGuard {
    server: UpstreamServer,
}

impl ConnectionGuard {
    /// Increments `server`'s in-flight counter and returns the guard.
    pub fn acquire(server: &UpstreamServer) -> Self {
        server.increment_connections();
        Self {
            server: server.clone(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.server.decrement_connections();
    }
}

/// One route's proxy: a load balancer, an upstream client, and the
/// background health checker for the route's pool.
#[derive(Debug)]
pub struct ProxyServer {
    balancer: LoadBalancer,
    client: HttpsClient,
    request_timeout: Duration,
    health: Mutex<Option<HealthChecker>>,
}

impl ProxyServer {
    /// Builds a proxy for `route`: constructs the pool, installs the
    /// configured strategy and weights, and starts the health checker.
    pub fn from_route(route: &ValidatedRoute, client: HttpsClient) -> Result<Self> {
        let pool = UpstreamPool::from_validated(&route.upstreams);
        let balancer = LoadBalancer::new(pool, route.strategy);

        for (address, weight) in &route.weights {
            balancer.set_server_weight(address, *weight)?;
        }

        let health = HealthChecker::spawn(balancer.pool().clone(), route.health_check.clone());

        Ok(Self {
            balancer,
            client,
            request_timeout: route.request_timeout,
            health: Mutex::new(Some(health)),
        })
    }

    /// Returns the proxy's load balancer.
    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Handles one inbound request already routed to this proxy.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<StdError>,
    {
        dispatch(
            req,
            self.client.clone(),
            self.balancer.clone(),
            self.request_timeout,
            client_addr,
        )
        .await
    }

    /// Stops the health checker and waits for it to finish.
    pub async fn shutdown(&self) {
        let checker = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(checker) = checker {
            checker.stop().await;
        }
    }
}

/// Dispatches a single request through selection, accounting, and
/// forwarding. Generic over the client connector so that tests can use a
/// plain [`HttpClient`].
pub async fn dispatch<B, C>(
    req: Request<B>,
    client: Client<C, BoxBody>,
    balancer: LoadBalancer,
    request_timeout: Duration,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
    C: hyper_util::client::legacy::connect::Connect + Clone + Send + Sync + 'static,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let uri = req.uri().clone();

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %method,
        uri = %uri,
        client = %client_addr,
    );

    async move {
        let client_key = client_addr.ip().to_string();

        let upstream = balancer.next_server(&client_key).ok_or_else(|| {
            warn!("no alive upstream available");
            ProxyError::NoAliveUpstream
        })?;

        // Counts this request against the backend from here until dispatch
        // completes, whichever way it completes.
        let _guard = ConnectionGuard::acquire(&upstream);

        let upstream_uri = upstream.uri().clone();
        info!(upstream = %upstream_uri, "dispatching request");

        let rewritten_uri = rewrite_uri(&uri, &upstream_uri)?;
        let (mut parts, body) = req.into_parts();

        headers::strip_hop_by_hop(&mut parts.headers);
        headers::inject_forwarding_headers(&mut parts.headers, client_addr);
        headers::rewrite_host(
            &mut parts.headers,
            upstream_uri
                .authority()
                .ok_or_else(|| ProxyError::InvalidUpstream("upstream has no authority".into()))?,
        );

        parts.uri = rewritten_uri;

        debug!(
            headers = ?parts.headers,
            upstream_uri = %parts.uri,
            "forwarding request"
        );

        let start = std::time::Instant::now();
        let boxed_body = body.map_err(|e| e.into()).boxed();
        let proxy_req = Request::from_parts(parts, boxed_body);

        let upstream_result = timeout(request_timeout, client.request(proxy_req)).await;

        let mut upstream_resp = match upstream_result {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    latency_ms = start.elapsed().as_millis() as u64,
                    upstream = %upstream_uri,
                    "upstream request failed"
                );
                return Err(ProxyError::Forward(e.to_string()));
            }
            Err(_elapsed) => {
                warn!(
                    timeout = ?request_timeout,
                    upstream = %upstream_uri,
                    "upstream request timed out"
                );
                return Err(ProxyError::Timeout(request_timeout));
            }
        };

        info!(
            status = upstream_resp.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            upstream = %upstream_uri,
            "upstream responded"
        );

        headers::strip_hop_by_hop(upstream_resp.headers_mut());

        let (parts, body) = upstream_resp.into_parts();
        Ok(Response::from_parts(
            parts,
            body.map_err(|e| -> StdError { Box::new(e) }).boxed(),
        ))
    }
    .instrument(span)
    .await
}

/// Rewrites the original request URI to target the selected upstream,
/// preserving the path and query string.
fn rewrite_uri(original: &Uri, upstream: &Uri) -> Result<Uri> {
    let authority = upstream
        .authority()
        .ok_or_else(|| ProxyError::InvalidUpstream("upstream has no authority".into()))?;

    let scheme = upstream
        .scheme()
        .ok_or_else(|| ProxyError::InvalidUpstream("upstream has no scheme".into()))?;

    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build upstream URI: {e}")))
}
