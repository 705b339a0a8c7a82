use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewindow::config::{RateWindowConfig, StoreBackend};
use ratewindow::ratelimit::{KeyedLimiter, WindowFactory};
use ratewindow::server::{AdmissionGate, HttpServer};
use ratewindow::store::{MemoryStore, RedisStore, WindowStore};

/// Bucketed sliding-window rate limiter.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RATEWINDOW_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides the config file
    #[arg(long)]
    http_addr: Option<std::net::SocketAddr>,

    /// Storage backend, overrides the config file
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Redis URL, overrides the config file
    #[arg(long, env = "RATEWINDOW_REDIS_URL")]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Ratewindow");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RateWindowConfig::from_file(path)?,
        None => RateWindowConfig::default(),
    };
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(backend) = args.store {
        config.store.backend = backend;
    }
    if let Some(url) = args.redis_url {
        config.store.redis_url = url;
    }
    config.validate()?;
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        precision = config.limits.window.precision,
        window_size = config.limits.window.window_size,
        capacity = config.limits.capacity,
        "Configuration loaded"
    );

    let factory = match config.store.backend {
        StoreBackend::Local => WindowFactory::local(config.limits.window),
        StoreBackend::Memory => shared_factory(&config, Arc::new(MemoryStore::new())),
        StoreBackend::Redis => {
            let store =
                RedisStore::connect(&config.store.redis_url, config.store.response_timeout())
                    .await?;
            shared_factory(&config, Arc::new(store))
        }
    };

    let limiters = Arc::new(KeyedLimiter::new(factory, config.limits.capacity)?);
    let evictor = config
        .admission
        .eviction_interval(&config.limits.window)
        .map(|interval| limiters.clone().spawn_evictor(interval));

    let gate = Arc::new(AdmissionGate::new(limiters, config.admission.failure_policy));
    info!(policy = ?gate.policy(), "Rate limiter initialized");

    let server = HttpServer::new(config.server.http_addr, gate, config.admission.subject);
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(evictor) = evictor {
        evictor.abort();
    }

    info!("Ratewindow stopped");
    Ok(())
}

fn shared_factory(config: &RateWindowConfig, store: Arc<dyn WindowStore>) -> WindowFactory {
    WindowFactory::shared(
        store,
        config.store.key_prefix.clone(),
        config.limits.window,
        config.store.lock,
    )
}

/// Resolve once the process is asked to stop.
///
/// A signal handler that cannot be installed is logged and skipped, so the
/// other signal can still stop the server.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = received, "Shutting down, draining in-flight requests");
}
