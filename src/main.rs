use std::sync::Arc;

use stockade::{Config, Router, build_https_client, server, tls};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());

    let runtime = Config::load_from_file(&config_path)
        .and_then(Config::into_runtime)
        .unwrap_or_else(|e| {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        });

    let client = build_https_client(&runtime);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let mut routers = Vec::new();
    let mut listeners = Vec::new();

    for server_config in &runtime.servers {
        let router = Router::from_server(server_config, client.clone()).unwrap_or_else(|e| {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        });
        let router = Arc::new(router);

        let listener = tokio::net::TcpListener::bind(server_config.listen)
            .await
            .unwrap_or_else(|e| {
                eprintln!("fatal: failed to bind {}: {e}", server_config.listen);
                std::process::exit(1);
            });

        let tls_acceptor = match &server_config.tls {
            Some(tls_config) => {
                let provider = tls::file_cert_provider(tls_config).unwrap_or_else(|e| {
                    eprintln!("fatal: {e}");
                    std::process::exit(1);
                });
                Some(tls::build_tls_acceptor(provider))
            }
            None => None,
        };

        info!(
            listen = %server_config.listen,
            host = %server_config.host,
            tls = tls_acceptor.is_some(),
            routes = server_config.routes.len(),
            "listener ready"
        );

        let mut shutdown_rx = shutdown_rx.clone();
        let serve_router = Arc::clone(&router);
        listeners.push(tokio::spawn(async move {
            server::serve(listener, serve_router, tls_acceptor, async move {
                let _ = shutdown_rx.changed().await;
            })
            .await;
        }));
        routers.push(router);
    }

    server::shutdown_signal().await;
    let _ = shutdown_tx.send(());

    for handle in listeners {
        let _ = handle.await;
    }
    for router in &routers {
        router.shutdown().await;
    }

    info!("shutdown complete");
}
