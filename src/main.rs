//! Pingora-based gray rollout gateway with a gRPC API for configuration
//! pushes.
//!
//! The proxy runs on Pingora's own runtime; the gRPC config API and the
//! health endpoints share a separate tokio runtime on a background thread.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pingora_core::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gray_proxy::config::GrayConfig;
use gray_proxy::gray::HyperFetcher;
use gray_proxy::gray_api::gray_config_service_server::GrayConfigServiceServer;
use gray_proxy::grpc::GrayConfigServiceImpl;
use gray_proxy::health::start_health_server;
use gray_proxy::proxy::{GatewayProxy, Upstream};
use gray_proxy::store::ConfigStore;

#[derive(Parser, Debug)]
#[command(name = "gray-proxy")]
#[command(version, about = "Gray rollout gateway for versioned front-end applications", long_about = None)]
struct Args {
    /// Proxy listen address
    #[arg(long, env = "GRAY_PROXY_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Upstream origin, IP:PORT
    #[arg(long, env = "GRAY_PROXY_UPSTREAM")]
    upstream: String,

    /// Connect to the upstream over TLS
    #[arg(long, env = "GRAY_PROXY_UPSTREAM_TLS")]
    upstream_tls: bool,

    /// SNI for upstream TLS, defaults to the upstream IP
    #[arg(long, env = "GRAY_PROXY_UPSTREAM_SNI", default_value = "")]
    upstream_sni: String,

    /// JSON configuration loaded at start
    #[arg(long, env = "GRAY_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// gRPC config API listen address
    #[arg(long, env = "GRAY_PROXY_GRPC_LISTEN", default_value = "0.0.0.0:50051")]
    grpc_listen: SocketAddr,

    /// Health endpoint listen address
    #[arg(long, env = "GRAY_PROXY_HEALTH_LISTEN", default_value = "0.0.0.0:8081")]
    health_listen: SocketAddr,

    /// Ceiling on holding a response for not-found fallback content
    #[arg(long, env = "GRAY_PROXY_FALLBACK_TIMEOUT_MS", default_value_t = 1500)]
    fallback_timeout_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!(listen = %args.listen, upstream = %args.upstream, "gray-proxy starting");

    let store = Arc::new(ConfigStore::new());
    if let Some(path) = &args.config {
        let config = GrayConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        store.update(config, 0);
        tracing::info!(path = %path.display(), "initial configuration loaded");
    }

    let upstream = Upstream::new(&args.upstream, args.upstream_tls, &args.upstream_sni)
        .map_err(anyhow::Error::msg)?;
    if upstream.tls {
        tracing::warn!("fallback content is fetched over plain HTTP from the upstream address");
    }

    spawn_control_plane(store.clone(), args.grpc_listen, args.health_listen)?;

    let mut server = Server::new(None).map_err(|e| anyhow::anyhow!("pingora server: {}", e))?;
    server.bootstrap();

    let fetcher = Arc::new(HyperFetcher::new(upstream.authority()));
    let gateway = GatewayProxy::new(
        store,
        upstream,
        fetcher,
        Duration::from_millis(args.fallback_timeout_ms),
    );
    let mut proxy = pingora_proxy::http_proxy_service(&server.configuration, gateway);
    proxy.add_tcp(&args.listen);
    server.add_service(proxy);

    server.run_forever()
}

/// Runs the gRPC config API and the health server on their own runtime.
fn spawn_control_plane(
    store: Arc<ConfigStore>,
    grpc_addr: SocketAddr,
    health_addr: SocketAddr,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building control plane runtime")?;

    std::thread::Builder::new()
        .name("control-plane".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let health = tokio::spawn(start_health_server(health_addr, store.clone()));

                tracing::info!(addr = %grpc_addr, "gRPC config API listening");
                let grpc = tonic::transport::Server::builder()
                    .add_service(GrayConfigServiceServer::new(GrayConfigServiceImpl::new(store)))
                    .serve(grpc_addr);

                tracing::info!(addr = %health_addr, "health server listening");
                tokio::select! {
                    result = grpc => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "gRPC server stopped");
                        }
                    }
                    result = health => {
                        match result {
                            Ok(Err(e)) => tracing::error!(error = %e, "health server stopped"),
                            Err(e) => tracing::error!(error = %e, "health server task failed"),
                            Ok(Ok(())) => {}
                        }
                    }
                }
            })
        })
        .context("spawning control plane thread")?;

    Ok(())
}
