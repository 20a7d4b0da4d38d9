//! Per-backend state: identity, health, and load accounting.
//!
//! Each upstream backend is represented by an [`UpstreamServer`] handle that
//! holds its parsed URI and all mutable runtime state. Health transitions and
//! connection counts are lock-free: the alive flag is an [`AtomicBool`],
//! consecutive failures an [`AtomicU32`], and the connection counter an
//! [`AtomicUsize`] updated on the hot request path without any pool-wide lock.
//!
//! The smooth weighted round-robin fields (`weight`, `current_weight`) are
//! plain atomics as well, but cross-server consistency of a selection pass is
//! the strategy layer's job (see `strategy.rs`); this module only provides
//! the per-server storage.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use crate::config::ValidatedUpstream;

/// The full set of upstream backends configured for one route.
///
/// Membership and order are fixed at construction; order defines the
/// indexing used by the round-robin and IP-hash strategies.
#[derive(Debug, Clone)]
pub struct UpstreamPool {
    servers: Arc<Vec<UpstreamServer>>,
}

/// Runtime state for a single upstream backend.
///
/// Cloning is cheap; every clone refers to the same shared state.
#[derive(Debug, Clone)]
pub struct UpstreamServer {
    state: Arc<InnerState>,
}

#[derive(Debug)]
struct InnerState {
    /// The validated upstream URI. Immutable after construction.
    uri: hyper::Uri,
    /// Relative weight for weighted round robin. Zero is allowed.
    weight: AtomicI64,
    /// Smooth weighted round-robin accumulator. May go negative.
    current_weight: AtomicI64,
    /// Number of requests currently in flight against this backend.
    active_connections: AtomicUsize,
    /// Whether this backend is currently considered alive.
    alive: AtomicBool,
    /// Number of consecutive probe failures observed.
    fail_count: AtomicU32,
    /// When the health checker last finished probing this backend.
    last_checked: RwLock<Option<Instant>>,
}

impl UpstreamPool {
    /// Constructs a pool from validated upstream configurations, marking
    /// all backends as initially alive.
    pub fn from_validated(upstreams: &[ValidatedUpstream]) -> Self {
        let servers = upstreams.iter().map(UpstreamServer::new).collect();
        Self {
            servers: Arc::new(servers),
        }
    }

    /// Returns a slice of all backends (alive and down), in pool order.
    pub fn all(&self) -> &[UpstreamServer] {
        &self.servers
    }

    /// Returns the number of backends currently marked alive.
    pub fn alive_count(&self) -> usize {
        self.servers.iter().filter(|s| s.is_alive()).count()
    }

    /// Returns the total number of configured backends.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns `true` if no backends are configured.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Looks up a pool member whose scheme and authority match `uri`.
    pub fn find(&self, uri: &hyper::Uri) -> Option<&UpstreamServer> {
        self.servers.iter().find(|s| s.matches_address(uri))
    }
}

impl UpstreamServer {
    /// Creates a new alive upstream from a validated configuration entry.
    pub fn new(upstream: &ValidatedUpstream) -> Self {
        Self {
            state: Arc::new(InnerState {
                uri: upstream.uri.clone(),
                weight: AtomicI64::new(upstream.weight),
                current_weight: AtomicI64::new(0),
                active_connections: AtomicUsize::new(0),
                alive: AtomicBool::new(true),
                fail_count: AtomicU32::new(0),
                last_checked: RwLock::new(None),
            }),
        }
    }

    /// Returns the upstream URI.
    pub fn uri(&self) -> &hyper::Uri {
        &self.state.uri
    }

    /// Returns `true` if `uri` names this backend (same scheme and authority).
    ///
    /// Path components are ignored: a backend's identity is scheme+host+port.
    pub fn matches_address(&self, uri: &hyper::Uri) -> bool {
        self.state.uri.scheme() == uri.scheme() && self.state.uri.authority() == uri.authority()
    }

    /// Returns the load-balancing weight.
    pub fn weight(&self) -> i64 {
        self.state.weight.load(Ordering::Acquire)
    }

    /// Replaces the load-balancing weight.
    pub fn set_weight(&self, weight: i64) {
        self.state.weight.store(weight, Ordering::Release);
    }

    /// Returns the smooth weighted round-robin accumulator.
    pub fn current_weight(&self) -> i64 {
        self.state.current_weight.load(Ordering::Acquire)
    }

    /// Adds this backend's weight to its accumulator, returning the new value.
    /// Called once per alive backend during a weighted selection pass.
    pub fn advance_current_weight(&self) -> i64 {
        let w = self.weight();
        self.state.current_weight.fetch_add(w, Ordering::AcqRel) + w
    }

    /// Subtracts the pass total from the accumulator of the picked backend.
    pub fn settle_current_weight(&self, total: i64) {
        self.state.current_weight.fetch_sub(total, Ordering::AcqRel);
    }

    /// Returns `true` if this backend is currently alive.
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::Acquire)
    }

    /// Records a successful probe: the failure counter resets and the
    /// backend is alive again immediately, with no intermediate state.
    pub fn record_success(&self) {
        self.state.fail_count.store(0, Ordering::Release);
        self.state.alive.store(true, Ordering::Release);
    }

    /// Records a failed probe, incrementing the consecutive failure counter.
    /// Once the counter reaches `threshold`, the backend is marked down.
    ///
    /// Returns `true` if this failure transitioned the backend from alive
    /// to down.
    pub fn record_failure(&self, threshold: u32) -> bool {
        let prev = self.state.fail_count.fetch_add(1, Ordering::AcqRel);
        let count = prev.saturating_add(1);

        count >= threshold && self.state.alive.swap(false, Ordering::AcqRel)
    }

    /// Marks this backend alive, resetting the failure counter.
    pub fn mark_alive(&self) {
        self.record_success();
    }

    /// Marks this backend down without touching the failure counter.
    pub fn mark_down(&self) {
        self.state.alive.store(false, Ordering::Release);
    }

    /// Returns the current consecutive failure count.
    pub fn fail_count(&self) -> u32 {
        self.state.fail_count.load(Ordering::Acquire)
    }

    /// Returns when the health checker last finished probing this backend.
    pub fn last_checked(&self) -> Option<Instant> {
        *self
            .state
            .last_checked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamps the probe completion time. Called after every probe outcome.
    pub fn touch_last_checked(&self) {
        *self
            .state
            .last_checked
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Returns the number of requests currently in flight.
    pub fn active_connections(&self) -> usize {
        self.state.active_connections.load(Ordering::Acquire)
    }

    /// Increments the in-flight counter. Paired with
    /// [`decrement_connections`](Self::decrement_connections) on every exit
    /// path of a dispatched request.
    pub fn increment_connections(&self) {
        self.state.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the in-flight counter.
    pub fn decrement_connections(&self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}
