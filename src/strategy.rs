//! Load-balancing strategy selection.
//!
//! Four closed strategy variants operate over the alive subset of a pool:
//! round robin, least connections, IP hash, and smooth weighted round robin.
//! Every variant returns `None` when no backend is alive; that is the single
//! "no upstream available" signal the dispatch path turns into a 503.
//!
//! Selection is called concurrently from every request handler. Round robin
//! uses one lock-free atomic cursor; least connections and IP hash only read
//! atomics. Weighted round robin is the exception: its pass mutates every
//! alive backend's `current_weight`, so a per-handler mutex serializes the
//! whole read-modify-write pass.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::upstream::UpstreamServer;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 16_777_619;

/// The external-facing strategy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Rotate through alive backends with a shared monotonic counter.
    #[default]
    RoundRobin,
    /// Pick the alive backend with the fewest in-flight requests.
    LeastConnections,
    /// Pin each client key to a backend via a 32-bit FNV-1a hash.
    IpHash,
    /// Smooth weighted round robin over configured weights.
    WeightedRoundRobin,
}

impl Strategy {
    /// Parses the external string form. Returns `None` for unrecognized
    /// identifiers; callers fall back to [`Strategy::RoundRobin`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round-robin" => Some(Self::RoundRobin),
            "least-connections" => Some(Self::LeastConnections),
            "ip-hash" => Some(Self::IpHash),
            "weighted-round-robin" => Some(Self::WeightedRoundRobin),
            _ => None,
        }
    }

    /// Returns the external string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::IpHash => "ip-hash",
            Self::WeightedRoundRobin => "weighted-round-robin",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy instance with its per-handler state.
///
/// Handlers are created fresh on every strategy swap, so internal counters
/// (the round-robin cursor) start from zero for a newly installed strategy.
/// Handlers never mutate health state; they only read it, except for the
/// weighted variant's `current_weight` bookkeeping.
#[derive(Debug)]
pub enum StrategyHandler {
    RoundRobin {
        /// Monotonic cursor shared across calls; wraps on overflow.
        counter: AtomicU32,
    },
    LeastConnections,
    IpHash,
    WeightedRoundRobin {
        /// Serializes the cross-server read-modify-write pass.
        pass: Mutex<()>,
    },
}

impl StrategyHandler {
    /// Creates a fresh handler for `kind` with reset internal state.
    pub fn new(kind: Strategy) -> Self {
        match kind {
            Strategy::RoundRobin => Self::RoundRobin {
                counter: AtomicU32::new(0),
            },
            Strategy::LeastConnections => Self::LeastConnections,
            Strategy::IpHash => Self::IpHash,
            Strategy::WeightedRoundRobin => Self::WeightedRoundRobin {
                pass: Mutex::new(()),
            },
        }
    }

    /// Returns the kind this handler implements.
    pub fn kind(&self) -> Strategy {
        match self {
            Self::RoundRobin { .. } => Strategy::RoundRobin,
            Self::LeastConnections => Strategy::LeastConnections,
            Self::IpHash => Strategy::IpHash,
            Self::WeightedRoundRobin { .. } => Strategy::WeightedRoundRobin,
        }
    }

    /// Selects the next backend from the alive subset of `servers`.
    ///
    /// `client_key` is the client's remote address string; only the IP-hash
    /// variant consults it. Returns `None` when no backend is alive.
    pub fn next_server(
        &self,
        servers: &[UpstreamServer],
        client_key: &str,
    ) -> Option<UpstreamServer> {
        match self {
            Self::RoundRobin { counter } => {
                let alive = alive_servers(servers);
                if alive.is_empty() {
                    return None;
                }
                // Increment first, then index against the current alive
                // count. The cursor keeps advancing even as the alive set
                // changes size, so distribution is approximate but the hot
                // path stays lock-free.
                let next = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                Some(alive[next as usize % alive.len()].clone())
            }
            Self::LeastConnections => {
                let alive = alive_servers(servers);
                // min_by_key keeps the first minimum, so exact ties resolve
                // to the earliest backend in pool order.
                alive
                    .into_iter()
                    .min_by_key(|s| s.active_connections())
                    .cloned()
            }
            Self::IpHash => {
                let alive = alive_servers(servers);
                if alive.is_empty() {
                    return None;
                }
                let hash = fnv1a_32(client_key);
                Some(alive[hash as usize % alive.len()].clone())
            }
            Self::WeightedRoundRobin { pass } => {
                // The whole pass must be exclusive: two interleaved passes
                // would corrupt every backend's current_weight sequence.
                let _pass = pass.lock().unwrap_or_else(PoisonError::into_inner);

                let alive = alive_servers(servers);
                if alive.is_empty() {
                    return None;
                }

                let mut total = 0i64;
                let mut best: Option<&&UpstreamServer> = None;
                let mut best_weight = i64::MIN;

                for server in &alive {
                    total += server.weight();
                    let current = server.advance_current_weight();
                    if current > best_weight {
                        best_weight = current;
                        best = Some(server);
                    }
                }

                let picked = (*best?).clone();
                picked.settle_current_weight(total);
                Some(picked)
            }
        }
    }
}

/// Returns the alive subset of `servers`, preserving pool order.
fn alive_servers(servers: &[UpstreamServer]) -> Vec<&UpstreamServer> {
    servers.iter().filter(|s| s.is_alive()).collect()
}

/// 32-bit FNV-1a over the client key.
fn fnv1a_32(key: &str) -> u32 {
    key.bytes()
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
        })
}
