use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, TollgateConfig};
use tollgate::http::{self as web, AdminState, HttpServer, RouteTable};
use tollgate::ratelimit::RateLimiter;
use tollgate::store::RedisStore;

/// Token-bucket admission control for HTTP services.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Validate the configuration, print the effective settings and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    config.validate()?;

    if args.check_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    init_tracing(&config.logging)?;

    info!("Starting Tollgate admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        instance_id = %config.server.instance_id,
        "Configuration loaded"
    );

    let rate_limit = config.rate_limit.clone();
    let mut builder = RateLimiter::builder(rate_limit.clone());
    if rate_limit.use_distributed_backend {
        if let Some(url) = config.store.redis_url.as_deref() {
            let store = RedisStore::open(url)?;
            builder = builder.shared_store(Arc::new(store), config.store.distributed_settings());
        }
    }
    let limiter = Arc::new(builder.build()?);

    // Redis connects lazily; an unreachable store only means fail-open
    if let Err(e) = limiter.ping_backend().await {
        warn!(error = %e, "Rate limit store not reachable at startup");
    }

    let sweeper = limiter.spawn_idle_eviction(
        Duration::from_secs(rate_limit.local_idle_ttl_secs),
        Duration::from_secs(rate_limit.eviction_interval_secs),
    );

    let routes = RouteTable::new(&rate_limit.routes, &rate_limit.exempt_path_prefixes)?;
    let admin = AdminState {
        limiter: Arc::clone(&limiter),
        config: Arc::new(rate_limit),
        instance_id: config.server.instance_id.clone(),
    };
    let app = web::app(Router::new().fallback(not_found), admin, routes);

    let server = HttpServer::new(
        config.server.listen_addr,
        app,
        Duration::from_secs(config.server.shutdown_grace_secs),
    );

    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Tollgate admission control stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

/// Stand-in downstream: no application routes are mounted by the binary.
async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not Found", "status": 404 })),
    )
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
