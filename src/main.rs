use infergate::accesslog::ACCESS_TARGET;
use infergate::admin::{AdminServer, PKG_NAME, VERSION};
use infergate::config::{Config, LogConfig};
use infergate::healthcheck::HealthChecker;
use infergate::proxy::ProxyServer;
use infergate::state::GatewayState;
use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::{filter_fn, Targets};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("infergate.toml"));

    let config = Config::load(&config_path)?;

    // Initialize logging
    init_logging(&config.log)?;
    info!(path = %config_path.display(), "Configuration loaded");

    // Print startup banner
    print_startup_banner(&config);

    let base_dir = config_path.parent().map(Path::to_path_buf);
    let state = Arc::new(GatewayState::from_config(&config, base_dir.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to initialize gateway");
        e
    })?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(
                bind = %config.server.bind,
                port = config.server.port,
                error = %e,
                "Invalid bind address"
            );
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(proxy_addr, Arc::clone(&state), shutdown_rx.clone())
        .with_drain_timeout(config.server.shutdown_timeout());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Admin API is loopback only
    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));
        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&state),
            shutdown_rx.clone(),
            config.server.admin_token.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    if config.health.enabled {
        let checker = HealthChecker::new(
            Arc::clone(&state),
            config.health.clone(),
            shutdown_rx.clone(),
        );
        tokio::spawn(checker.run());
    } else {
        info!("Health checks disabled, all backends stay up");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(
                        path = %config_path.display(),
                        "Received SIGHUP, reloading configuration..."
                    );
                    let reloaded = Config::load(&config_path)
                        .and_then(|next| state.reload(&next, base_dir.as_deref()));
                    match reloaded {
                        Ok(summary) => {
                            info!(
                                tokens = summary.tokens,
                                backends = summary.backends,
                                "Configuration reloaded successfully"
                            );
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                "Failed to reload configuration, keeping current state"
                            );
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // The proxy drains within shutdown_timeout on its own
    let grace = config.server.shutdown_timeout() + Duration::from_secs(1);
    let stopped = tokio::time::timeout(grace, async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;
    if stopped.is_err() {
        warn!("Servers did not stop within the shutdown timeout");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Stdout by default; access records and warnings can go to their own files
fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", config.level, e))?,
    };

    let access_file = config.access_log.as_deref().map(open_log_file).transpose()?;
    let error_file = config.error_log.as_deref().map(open_log_file).transpose()?;

    let split_access = access_file.is_some();
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_filter(filter_fn(move |meta| !(split_access && meta.target() == ACCESS_TARGET)));

    let access_layer = access_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(Targets::new().with_target(ACCESS_TARGET, Level::INFO))
    });

    let error_layer = error_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(LevelFilter::WARN)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(access_layer)
        .with(error_layer)
        .init();

    Ok(())
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open log file '{}': {}", path.display(), e))
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting inference gateway"
    );

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = ?(config.server.admin_port > 0).then_some(config.server.admin_port),
        max_body_bytes = config.server.max_body_bytes,
        "Server configuration"
    );

    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        connect_timeout_ms = config.server.connect_timeout_ms,
        response_timeout_secs = config.server.response_timeout_secs,
        "Connection pool settings"
    );

    info!(
        strategy = config.balancer.strategy.as_str(),
        max_connections_per_backend = config.balancer.max_connections_per_backend,
        queue_timeout_ms = config.balancer.queue_timeout_ms,
        "Load balancing"
    );

    info!(
        enabled = config.health.enabled,
        probe = ?config.health.probe,
        interval_ms = config.health.interval_ms,
        unhealthy_threshold = config.health.unhealthy_threshold,
        healthy_threshold = config.health.healthy_threshold,
        "Health check settings"
    );

    info!(
        backend_count = config.backends.len(),
        backends = ?config.backends.iter().map(|b| b.address()).collect::<Vec<_>>(),
        "Configured backends"
    );
}
