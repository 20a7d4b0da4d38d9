//!
//! A reverse-proxy gateway built on [Hyper]: host/path routing, pluggable
//! load-balancing strategies, and active upstream health checking.
//!
//! Each configured route owns a pool of upstream backends and a
//! [`LoadBalancer`] selecting among the alive ones — round robin, least
//! connections, IP hash, or smooth weighted round robin. A background
//! [`HealthChecker`] per route probes every backend on an interval,
//! marking backends down after consecutive failures and reviving them on
//! the first success.
//!
//! [Hyper]: https://hyper.rs/

pub mod balancer;
pub mod config;
pub mod error;
pub mod headers;
pub mod health;
pub mod proxy;
pub mod router;
pub mod server;
pub mod strategy;
pub mod tls;
pub mod upstream;

pub use balancer::LoadBalancer;
pub use config::{
    Config, HealthCheckConfig, RouteConfig, RuntimeConfig, ServerConfig, StrategyConfig,
    TlsConfig, ValidatedRoute, ValidatedServer, ValidatedUpstream,
};
pub use error::ProxyError;
pub use health::HealthChecker;
pub use proxy::{
    BoxBody, ConnectionGuard, HttpClient, HttpsClient, ProxyServer, build_client,
    build_https_client, dispatch,
};
pub use router::{RouteEntry, Router};
pub use strategy::{Strategy, StrategyHandler};
pub use upstream::{UpstreamPool, UpstreamServer};

/// Crate-wide result type carrying [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;
