//! Active upstream health checking.
//!
//! A [`HealthChecker`] is a background task owned by one `ProxyServer`. On
//! each tick it probes every pool member concurrently with a bounded
//! timeout and folds the outcome into the member's health state:
//!
//! - a 2xx response resets the failure counter and revives the backend
//!   immediately (no intermediate "recovering" state);
//! - anything else (non-2xx, network error, timeout) increments the
//!   consecutive-failure counter, and the backend is marked down once the
//!   counter reaches the configured threshold.
//!
//! Health state changes only here. The dispatch path never flips a
//! backend's alive flag on a forwarding failure, so a single transient
//! blip cannot desynchronize health state from the periodic probe's view.

use bytes::Bytes;
use futures::future::join_all;
use http_body_util::Empty;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::HealthCheckConfig;
use crate::upstream::{UpstreamPool, UpstreamServer};

/// The probe client type: plain HTTP with empty request bodies.
type ProbeClient = Client<HttpConnector, Empty<Bytes>>;

/// Handle to a running health check task.
///
/// The task runs until [`stop`](Self::stop) is called or the handle is
/// dropped; both terminate it deterministically, so tests (and a future
/// config reload) can start and stop checkers without leaking tasks.
#[derive(Debug)]
pub struct HealthChecker {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HealthChecker {
    /// Spawns a background task probing `pool` per `config`.
    ///
    /// The first probe round runs immediately; subsequent rounds follow the
    /// configured interval.
    pub fn spawn(pool: UpstreamPool, config: HealthCheckConfig) -> Self {
        let (tx, mut rx) = oneshot::channel::<()>();
        let client = probe_client();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        probe_pool(&client, &pool, &config).await;
                    }
                    _ = &mut rx => break,
                }
            }
        });

        Self {
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    /// Signals the task to stop and waits for it to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Runs exactly one probe round against `pool`, outside any task.
    ///
    /// Used by tests that need deterministic probe timing.
    pub async fn probe_once(pool: &UpstreamPool, config: &HealthCheckConfig) {
        let client = probe_client();
        probe_pool(&client, pool, config).await;
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn probe_client() -> ProbeClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Probes every pool member concurrently and waits for all outcomes.
async fn probe_pool(client: &ProbeClient, pool: &UpstreamPool, config: &HealthCheckConfig) {
    let probes = pool
        .all()
        .iter()
        .map(|server| probe_server(client, server, config));
    join_all(probes).await;
}

/// Issues one probe against one backend and records the outcome.
async fn probe_server(client: &ProbeClient, server: &UpstreamServer, config: &HealthCheckConfig) {
    let uri_str = format!(
        "{}://{}{}",
        server.uri().scheme_str().unwrap_or("http"),
        server
            .uri()
            .authority()
            .map(|a| a.as_str())
            .unwrap_or("localhost"),
        config.path,
    );

    let uri = match uri_str.parse::<hyper::Uri>() {
        Ok(u) => u,
        Err(e) => {
            warn!(upstream = %server.uri(), error = %e, "failed to build probe URI");
            return;
        }
    };

    let result = tokio::time::timeout(config.timeout(), client.get(uri)).await;

    match result {
        Ok(Ok(resp)) if resp.status().is_success() => {
            let was_down = !server.is_alive();
            server.record_success();
            if was_down {
                info!(upstream = %server.uri(), "probe passed, backend recovered");
            }
        }
        Ok(Ok(resp)) => {
            let marked_down = server.record_failure(config.failure_threshold);
            warn!(
                upstream = %server.uri(),
                status = resp.status().as_u16(),
                fail_count = server.fail_count(),
                marked_down,
                "probe returned non-success status"
            );
        }
        Ok(Err(e)) => {
            let marked_down = server.record_failure(config.failure_threshold);
            warn!(
                upstream = %server.uri(),
                error = %e,
                fail_count = server.fail_count(),
                marked_down,
                "probe request failed"
            );
        }
        Err(_) => {
            let marked_down = server.record_failure(config.failure_threshold);
            warn!(
                upstream = %server.uri(),
                timeout = ?config.timeout(),
                fail_count = server.fail_count(),
                marked_down,
                "probe timed out"
            );
        }
    }

    server.touch_last_checked();
}
