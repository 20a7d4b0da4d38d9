//! Configuration loading and validation.
//!
//! The gateway reads its YAML configuration exactly once at startup. The raw
//! [`Config`] mirrors the on-disk schema; [`Config::into_runtime`] validates
//! every field and produces the runtime types the server loop consumes. A
//! malformed route aborts startup — the process never serves with a
//! configuration it could not fully validate.
//!
//! Schema sketch:
//!
//! ```yaml
//! servers:
//!   - listen: "127.0.0.1:8100"
//!     host: "example.com"
//!     routes:
//!       - path: "/api"
//!         strip_prefix: true
//!         upstreams:
//!           - "http://127.0.0.1:9001"
//!           - "http://127.0.0.1:9002"
//!         strategy:
//!           type: weighted-round-robin
//!           weights:
//!             "http://127.0.0.1:9001": 5
//!             "http://127.0.0.1:9002": 3
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::strategy::Strategy;
use crate::{ProxyError, Result};

/// Default interval between health check probes.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Default per-probe timeout.
pub const DEFAULT_HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of consecutive probe failures before a backend is
/// marked down.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default path probed on each upstream (the bare base address).
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/";

/// Default total request timeout covering the upstream round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle timeout for pooled upstream connections.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of idle connections kept per upstream host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Default weight for upstreams without an entry in the strategy's
/// `weights` table.
pub const DEFAULT_UPSTREAM_WEIGHT: i64 = 1;

/// Raw configuration as deserialized from the YAML file.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// One entry per listener.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Idle timeout in milliseconds for pooled upstream connections
    /// (default: 60000).
    #[serde(default)]
    pub pool_idle_timeout_ms: Option<u64>,
    /// Maximum idle connections kept per upstream host (default: 32).
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

/// One listener: a bind address, a host matcher, optional TLS termination,
/// and the routes served on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket address to bind (e.g. `"0.0.0.0:8443"`).
    pub listen: String,
    /// Exact host this listener's routes match against.
    pub host: String,
    /// TLS termination configuration. Absent means plain HTTP.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Routes served on this listener, matched by path prefix.
    pub routes: Vec<RouteConfig>,
}

/// One route: a path prefix and the upstream pool behind it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    /// Path prefix this route matches. Must begin with `/`.
    pub path: String,
    /// Whether to strip the matched prefix before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,
    /// Upstream backend addresses (e.g. `"http://10.0.0.5:3000"`).
    pub upstreams: Vec<String>,
    /// Load-balancing strategy. Absent means round-robin.
    #[serde(default)]
    pub strategy: Option<StrategyConfig>,
    /// Health check settings for this route's pool.
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    /// Total request timeout in milliseconds for the upstream round-trip
    /// (default: 30000).
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Strategy selection plus strategy-specific parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StrategyConfig {
    /// One of `round-robin`, `least-connections`, `ip-hash`,
    /// `weighted-round-robin`. Unrecognized values fall back to
    /// round-robin with a warning.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Weights keyed by upstream address; only meaningful for
    /// `weighted-round-robin`. Every key must name a configured upstream.
    #[serde(default)]
    pub weights: HashMap<String, u32>,
}

/// Active health check configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    /// HTTP path to probe (default: `/`).
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Interval between probe rounds in milliseconds (default: 10000).
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds (default: 5000).
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before a backend is marked down (default: 3).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_CHECK_PATH.into()
}

fn default_health_interval_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL.as_millis() as u64
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_HEALTH_PROBE_TIMEOUT.as_millis() as u64
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl HealthCheckConfig {
    /// Interval between probe rounds.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Per-probe timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// TLS termination configuration: a PEM certificate chain and private key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    /// Path to the PEM-encoded certificate chain file.
    pub cert_path: String,
    /// Path to the PEM-encoded private key file.
    pub key_path: String,
}

/// Validated upstream backend descriptor.
#[derive(Debug, Clone)]
pub struct ValidatedUpstream {
    /// The parsed and validated upstream URI.
    pub uri: hyper::Uri,
    /// Initial load-balancing weight.
    pub weight: i64,
}

/// Fully validated configuration, ready for the server loop.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Validated listeners.
    pub servers: Vec<ValidatedServer>,
    /// Idle timeout for pooled upstream connections.
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per upstream host.
    pub pool_max_idle_per_host: usize,
}

/// A validated listener.
#[derive(Debug)]
pub struct ValidatedServer {
    /// Socket address the listener binds to.
    pub listen: SocketAddr,
    /// Exact host the listener's routes match against.
    pub host: String,
    /// TLS termination configuration, if any.
    pub tls: Option<TlsConfig>,
    /// Validated routes in configuration order.
    pub routes: Vec<ValidatedRoute>,
}

/// A validated route with its resolved pool and strategy parameters.
#[derive(Debug)]
pub struct ValidatedRoute {
    /// Path prefix this route matches.
    pub path_prefix: String,
    /// Whether the matched prefix is stripped before forwarding.
    pub strip_prefix: bool,
    /// Validated upstreams in configuration order.
    pub upstreams: Vec<ValidatedUpstream>,
    /// Resolved strategy kind.
    pub strategy: Strategy,
    /// Weights to apply, keyed by upstream address. Keys are guaranteed to
    /// name configured upstreams of this route.
    pub weights: HashMap<String, u32>,
    /// Health check settings for this route's pool.
    pub health_check: HealthCheckConfig,
    /// Total request timeout for the upstream round-trip.
    pub request_timeout: Duration,
}

/// Validates a single upstream address string.
fn validate_upstream(address: &str) -> Result<ValidatedUpstream> {
    if address.is_empty() {
        return Err(ProxyError::InvalidUpstream(
            "upstream address must not be empty".into(),
        ));
    }

    let uri = address
        .parse::<hyper::Uri>()
        .map_err(|e| ProxyError::InvalidUpstream(format!("{address}: {e}")))?;

    uri.scheme().ok_or_else(|| {
        ProxyError::InvalidUpstream(format!("upstream URI has no scheme: {address}"))
    })?;
    uri.authority().ok_or_else(|| {
        ProxyError::InvalidUpstream(format!("upstream URI has no authority: {address}"))
    })?;

    Ok(ValidatedUpstream {
        uri,
        weight: DEFAULT_UPSTREAM_WEIGHT,
    })
}

fn validate_route(route: &RouteConfig) -> Result<ValidatedRoute> {
    if !route.path.starts_with('/') {
        return Err(ProxyError::Config(format!(
            "route path must begin with '/': {}",
            route.path
        )));
    }

    if route.upstreams.is_empty() {
        return Err(ProxyError::Config(format!(
            "route {} has no upstreams",
            route.path
        )));
    }

    let upstreams = route
        .upstreams
        .iter()
        .map(|addr| validate_upstream(addr))
        .collect::<Result<Vec<_>>>()?;

    let (strategy, weights) = match &route.strategy {
        None => (Strategy::default(), HashMap::new()),
        Some(cfg) => {
            let kind = if cfg.kind.is_empty() {
                Strategy::default()
            } else {
                Strategy::parse(&cfg.kind).unwrap_or_else(|| {
                    warn!(
                        strategy = %cfg.kind,
                        route = %route.path,
                        "unrecognized strategy, falling back to round-robin"
                    );
                    Strategy::default()
                })
            };

            for addr in cfg.weights.keys() {
                let uri = addr.parse::<hyper::Uri>().map_err(|e| {
                    ProxyError::Config(format!("invalid weight key {addr}: {e}"))
                })?;
                let known = upstreams.iter().any(|u| {
                    u.uri.scheme() == uri.scheme() && u.uri.authority() == uri.authority()
                });
                if !known {
                    return Err(ProxyError::Config(format!(
                        "weight key {addr} does not name an upstream of route {}",
                        route.path
                    )));
                }
            }

            (kind, cfg.weights.clone())
        }
    };

    let health_check = route.health_check.clone().unwrap_or_default();
    if health_check.interval_ms == 0 || health_check.timeout_ms == 0 {
        return Err(ProxyError::Config(format!(
            "health check interval and timeout must be positive for route {}",
            route.path
        )));
    }
    if health_check.failure_threshold == 0 {
        return Err(ProxyError::Config(format!(
            "health check failure threshold must be at least 1 for route {}",
            route.path
        )));
    }

    let request_timeout = route
        .request_timeout_ms
        .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis);

    Ok(ValidatedRoute {
        path_prefix: route.path.clone(),
        strip_prefix: route.strip_prefix,
        upstreams,
        strategy,
        weights,
        health_check,
        request_timeout,
    })
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            ProxyError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`].
    ///
    /// At least one server with at least one route must be configured, and
    /// listen addresses must be unique across servers.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.servers.is_empty() {
            return Err(ProxyError::Config(
                "at least one server must be configured".into(),
            ));
        }

        let mut seen_listens = HashSet::new();
        let mut servers = Vec::with_capacity(self.servers.len());

        for server in &self.servers {
            let listen = server.listen.parse::<SocketAddr>().map_err(|e| {
                ProxyError::Config(format!("invalid listen address \"{}\": {e}", server.listen))
            })?;

            if !seen_listens.insert(listen) {
                return Err(ProxyError::Config(format!(
                    "duplicate listen address: {listen}"
                )));
            }

            if server.host.is_empty() {
                return Err(ProxyError::Config(format!(
                    "server on {listen} has no host"
                )));
            }

            if server.routes.is_empty() {
                return Err(ProxyError::Config(format!(
                    "server on {listen} has no routes"
                )));
            }

            let routes = server
                .routes
                .iter()
                .map(validate_route)
                .collect::<Result<Vec<_>>>()?;

            servers.push(ValidatedServer {
                listen,
                host: server.host.clone(),
                tls: server.tls.clone(),
                routes,
            });
        }

        let pool_idle_timeout = self
            .pool_idle_timeout_ms
            .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis);

        let pool_max_idle_per_host = self
            .pool_max_idle_per_host
            .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST);

        Ok(RuntimeConfig {
            servers,
            pool_idle_timeout,
            pool_max_idle_per_host,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, upstreams: &[&str]) -> RouteConfig {
        RouteConfig {
            path: path.into(),
            strip_prefix: false,
            upstreams: upstreams.iter().map(|s| s.to_string()).collect(),
            strategy: None,
            health_check: None,
            request_timeout_ms: None,
        }
    }

    fn server(listen: &str, host: &str, routes: Vec<RouteConfig>) -> ServerConfig {
        ServerConfig {
            listen: listen.into(),
            host: host.into(),
            tls: None,
            routes,
        }
    }

    #[test]
    fn loads_config_from_file() {
        let config = Config::load_from_file("./Config.yml").expect("Config.yml should be loadable");

        assert_eq!(config.servers.len(), 1);
        let server = &config.servers[0];
        assert_eq!(server.listen, "127.0.0.1:8100");
        assert_eq!(server.host, "localhost");
        assert_eq!(server.routes.len(), 2);

        let api = &server.routes[0];
        assert_eq!(api.path, "/api");
        assert!(api.strip_prefix);
        let strategy = api.strategy.as_ref().expect("api route has a strategy");
        assert_eq!(strategy.kind, "weighted-round-robin");
        assert_eq!(strategy.weights.get("http://127.0.0.1:9001"), Some(&5));
        assert_eq!(strategy.weights.get("http://127.0.0.1:9002"), Some(&3));
    }

    #[test]
    fn into_runtime_rejects_empty_servers() {
        assert!(Config::default().into_runtime().is_err());
    }

    #[test]
    fn into_runtime_rejects_empty_routes() {
        let config = Config {
            servers: vec![server("127.0.0.1:8100", "example.com", vec![])],
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn into_runtime_rejects_empty_upstreams() {
        let config = Config {
            servers: vec![server("127.0.0.1:8100", "example.com", vec![route("/", &[])])],
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn into_runtime_rejects_malformed_upstream() {
        let config = Config {
            servers: vec![server(
                "127.0.0.1:8100",
                "example.com",
                vec![route("/", &["not a valid uri %%"])],
            )],
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn into_runtime_rejects_upstream_without_scheme() {
        let config = Config {
            servers: vec![server(
                "127.0.0.1:8100",
                "example.com",
                vec![route("/", &["localhost:9001"])],
            )],
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn into_runtime_rejects_duplicate_listen_addresses() {
        let config = Config {
            servers: vec![
                server(
                    "127.0.0.1:8100",
                    "a.example.com",
                    vec![route("/", &["http://127.0.0.1:9001"])],
                ),
                server(
                    "127.0.0.1:8100",
                    "b.example.com",
                    vec![route("/", &["http://127.0.0.1:9002"])],
                ),
            ],
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn into_runtime_rejects_relative_route_path() {
        let config = Config {
            servers: vec![server(
                "127.0.0.1:8100",
                "example.com",
                vec![route("api", &["http://127.0.0.1:9001"])],
            )],
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn unknown_strategy_falls_back_to_round_robin() {
        let mut r = route("/", &["http://127.0.0.1:9001"]);
        r.strategy = Some(StrategyConfig {
            kind: "fastest-ever".into(),
            weights: HashMap::new(),
        });
        let config = Config {
            servers: vec![server("127.0.0.1:8100", "example.com", vec![r])],
            ..Default::default()
        };

        let rt = config.into_runtime().expect("valid config");
        assert_eq!(rt.servers[0].routes[0].strategy, Strategy::RoundRobin);
    }

    #[test]
    fn absent_strategy_defaults_to_round_robin() {
        let config = Config {
            servers: vec![server(
                "127.0.0.1:8100",
                "example.com",
                vec![route("/", &["http://127.0.0.1:9001"])],
            )],
            ..Default::default()
        };
        let rt = config.into_runtime().expect("valid config");
        assert_eq!(rt.servers[0].routes[0].strategy, Strategy::RoundRobin);
    }

    #[test]
    fn weight_key_must_name_an_upstream() {
        let mut r = route("/", &["http://127.0.0.1:9001"]);
        r.strategy = Some(StrategyConfig {
            kind: "weighted-round-robin".into(),
            weights: HashMap::from([("http://127.0.0.1:9999".to_string(), 4)]),
        });
        let config = Config {
            servers: vec![server("127.0.0.1:8100", "example.com", vec![r])],
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }

    #[test]
    fn weight_key_matching_ignores_trailing_slash() {
        let mut r = route("/", &["http://127.0.0.1:9001"]);
        r.strategy = Some(StrategyConfig {
            kind: "weighted-round-robin".into(),
            weights: HashMap::from([("http://127.0.0.1:9001/".to_string(), 4)]),
        });
        let config = Config {
            servers: vec![server("127.0.0.1:8100", "example.com", vec![r])],
            ..Default::default()
        };
        assert!(config.into_runtime().is_ok());
    }

    #[test]
    fn health_check_defaults_are_applied() {
        let config = Config {
            servers: vec![server(
                "127.0.0.1:8100",
                "example.com",
                vec![route("/", &["http://127.0.0.1:9001"])],
            )],
            ..Default::default()
        };
        let rt = config.into_runtime().expect("valid config");
        let hc = &rt.servers[0].routes[0].health_check;
        assert_eq!(hc.interval(), DEFAULT_HEALTH_CHECK_INTERVAL);
        assert_eq!(hc.timeout(), DEFAULT_HEALTH_PROBE_TIMEOUT);
        assert_eq!(hc.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(hc.path, DEFAULT_HEALTH_CHECK_PATH);
    }

    #[test]
    fn zero_failure_threshold_is_rejected() {
        let mut r = route("/", &["http://127.0.0.1:9001"]);
        r.health_check = Some(HealthCheckConfig {
            failure_threshold: 0,
            ..Default::default()
        });
        let config = Config {
            servers: vec![server("127.0.0.1:8100", "example.com", vec![r])],
            ..Default::default()
        };
        assert!(config.into_runtime().is_err());
    }
}
