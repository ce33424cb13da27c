use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatehouse::config::{GatehouseConfig, HealthCheckConfig, RateLimitingConfig};
use gatehouse::error::{GatehouseError, Result};
use gatehouse::grpc::GrpcServer;
use gatehouse::health::{HealthSupervisor, HttpProber, SupervisorConfig};
use gatehouse::metrics::GatehouseMetrics;
use gatehouse::ratelimit::{FixedWindowLimiter, RateLimiter, RedisCounterStore, TokenBucketLimiter};

/// Deadline for reaching Redis at startup.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "gatehouse", version, about = "Admission control and backend health supervision")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the gRPC listen address
    #[arg(long, global = true)]
    grpc_addr: Option<SocketAddr>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gRPC server (default)
    Serve,
    /// Probe every configured service once, print the result and exit
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = GatehouseConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.grpc_addr {
        config.server.grpc_addr = addr;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep => sweep(&config.health_check).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(config: GatehouseConfig) -> anyhow::Result<()> {
    info!("Starting Gatehouse");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        rate_limiting = config.rate_limiting.enabled,
        services = config.health_check.services.len(),
        "Configuration loaded"
    );

    let metrics = Arc::new(GatehouseMetrics::new()?);
    let supervisor = build_supervisor(&config.health_check)?.with_metrics(metrics.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor_task = if config.health_check.enabled {
        Some(supervisor.spawn(shutdown_rx))
    } else {
        info!("Health checks disabled");
        None
    };

    let mut server =
        GrpcServer::new(config.server.grpc_addr, supervisor).with_metrics(metrics.clone());
    if config.rate_limiting.enabled {
        server = server.with_rate_limiter(build_rate_limiter(&config.rate_limiting, metrics).await);
    } else {
        info!("Rate limiting disabled");
    }

    // Run the server with graceful shutdown on Ctrl+C, then stop the supervisor
    let result = server
        .serve_with_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await;

    if let Some(task) = supervisor_task {
        if let Err(e) = task.await {
            error!(error = %e, "Health supervisor task failed");
        }
    }

    result?;
    info!("Gatehouse stopped");
    Ok(())
}

/// Run one sweep and print the verdicts. Exits non-zero when not ready.
async fn sweep(config: &HealthCheckConfig) -> anyhow::Result<ExitCode> {
    let supervisor = build_supervisor(config)?;
    supervisor.sweep_once().await;

    let readiness = supervisor.readiness();
    let output = serde_json::json!({
        "readiness": readiness,
        "services": supervisor.services_status(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(if readiness.ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn build_supervisor(config: &HealthCheckConfig) -> Result<HealthSupervisor> {
    let prober = HttpProber::new(config.services.clone())?;
    Ok(HealthSupervisor::new(
        config.services.keys().cloned(),
        Arc::new(prober),
        SupervisorConfig::from(config),
    ))
}

/// Prefer the shared Redis counter; fall back to in-process buckets when it
/// is not configured or not reachable.
async fn build_rate_limiter(
    config: &RateLimitingConfig,
    metrics: Arc<GatehouseMetrics>,
) -> Arc<dyn RateLimiter> {
    if let Some(url) = &config.redis_url {
        match connect_store(url).await {
            Ok(store) => {
                info!(
                    window_secs = config.window_secs,
                    fail_mode = ?config.fail_mode,
                    "Using Redis fixed-window rate limiter"
                );
                return Arc::new(
                    FixedWindowLimiter::new(Arc::new(store), config.rate(), config.burst)
                        .with_window(config.window())
                        .with_store_timeout(config.store_timeout())
                        .with_fail_mode(config.fail_mode)
                        .with_metrics(metrics),
                );
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, falling back to in-process rate limiting");
            }
        }
    }

    info!(
        requests_per_second = config.requests_per_second,
        burst = config.burst,
        max_tracked_keys = config.max_tracked_keys,
        "Using in-process token bucket rate limiter"
    );
    Arc::new(
        TokenBucketLimiter::with_max_keys(config.rate(), config.burst, config.max_tracked_keys)
            .with_metrics(metrics),
    )
}

async fn connect_store(url: &str) -> Result<RedisCounterStore> {
    tokio::time::timeout(REDIS_CONNECT_TIMEOUT, async {
        let store = RedisCounterStore::connect(url).await?;
        store.ping().await?;
        Ok::<_, GatehouseError>(store)
    })
    .await
    .map_err(|_| GatehouseError::StoreTimeout(REDIS_CONNECT_TIMEOUT))?
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
