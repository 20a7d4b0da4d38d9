//! The per-route load balancer: pool ownership and strategy dispatch.
//!
//! A [`LoadBalancer`] owns one [`UpstreamPool`] and the currently active
//! [`StrategyHandler`]. Pool membership is fixed for the balancer's
//! lifetime; only per-server fields mutate. The strategy identifier and its
//! handler are swapped together under one writer lock, so a selection in
//! flight observes either the old pair or the new pair, never a mix.
//!
//! Lock discipline: selection and weight reads take the read side; strategy
//! swaps and weight updates take the write side. The lock is never held
//! across an `.await`.

use std::sync::{Arc, PoisonError, RwLock};

use crate::strategy::{Strategy, StrategyHandler};
use crate::upstream::{UpstreamPool, UpstreamServer};
use crate::{ProxyError, Result};

/// A load balancer over one route's upstream pool.
///
/// Cloning is cheap and shares the pool and the active strategy.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    pool: UpstreamPool,
    active: Arc<RwLock<ActiveStrategy>>,
}

/// The strategy identifier and its handler, replaced as a unit.
#[derive(Debug)]
struct ActiveStrategy {
    kind: Strategy,
    handler: StrategyHandler,
}

impl LoadBalancer {
    /// Creates a balancer over `pool` with the given initial strategy.
    pub fn new(pool: UpstreamPool, kind: Strategy) -> Self {
        Self {
            pool,
            active: Arc::new(RwLock::new(ActiveStrategy {
                kind,
                handler: StrategyHandler::new(kind),
            })),
        }
    }

    /// Selects the next upstream for a request from `client_key`.
    ///
    /// Delegates to the active strategy over the current pool. Returns
    /// `None` when no backend is alive.
    pub fn next_server(&self, client_key: &str) -> Option<UpstreamServer> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        active.handler.next_server(self.pool.all(), client_key)
    }

    /// Returns the currently active strategy identifier.
    pub fn strategy(&self) -> Strategy {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .kind
    }

    /// Replaces the active strategy with a fresh handler for `kind`.
    ///
    /// Internal handler state (the round-robin cursor) starts over; the
    /// per-server `current_weight` accumulators are left as they are.
    pub fn set_strategy(&self, kind: Strategy) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = ActiveStrategy {
            kind,
            handler: StrategyHandler::new(kind),
        };
    }

    /// Updates the weight of the pool member at `address`.
    ///
    /// Takes the write side of the strategy lock so the update cannot
    /// interleave with a weighted selection pass. Fails with
    /// [`ProxyError::ServerNotFound`] when no member's scheme and authority
    /// match, leaving every existing weight unchanged.
    pub fn set_server_weight(&self, address: &str, weight: u32) -> Result<()> {
        let uri = address
            .parse::<hyper::Uri>()
            .map_err(|e| ProxyError::InvalidUpstream(format!("{address}: {e}")))?;

        let _active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        let server = self
            .pool
            .find(&uri)
            .ok_or_else(|| ProxyError::ServerNotFound(address.to_owned()))?;

        server.set_weight(i64::from(weight));
        Ok(())
    }

    /// Returns a reference to the underlying upstream pool.
    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }
}
