use forkgate::config::Config;
use forkgate::healthcheck::{HealthCheckConfig, HealthMonitor};
use forkgate::proxy::ProxyServer;
use forkgate::registry::WorkerRegistry;
use forkgate::routing::SubmissionRoute;
use forkgate::supervisor::{WorkerEvent, WorkerSupervisor};
use forkgate::upstream::{UpstreamClient, UpstreamConfig};
use forkgate::{tls, PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forkgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("forkgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let listen_addr = config.server.listen_addr()?;
    let submission = SubmissionRoute::from_config(&config.submission)?;
    let tls_acceptor = tls::load_acceptor(&config.server)?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(WorkerRegistry::new());
    let client = Arc::new(UpstreamClient::new(UpstreamConfig::from(&config.proxy)));

    // Start the worker pool
    let supervisor = WorkerSupervisor::new(config.workers.clone(), Arc::clone(&registry));
    tokio::spawn(log_worker_events(supervisor.subscribe()));
    supervisor.start(config.workers.pool_size());

    // Start health monitoring after the warm-up delay
    let monitor = HealthMonitor::new(
        Arc::clone(&registry),
        Arc::clone(&client),
        HealthCheckConfig::from(&config.health),
        shutdown_rx.clone(),
    );
    let monitor_handle = tokio::spawn(monitor.run());

    let proxy = ProxyServer::new(
        listen_addr,
        Arc::clone(&registry),
        Arc::clone(&client),
        submission,
        shutdown_rx.clone(),
    )
    .with_tls(tls_acceptor)
    .with_max_replay_body_bytes(config.proxy.max_replay_body_bytes)
    .with_drain_timeout(config.server.drain_timeout());

    let mut proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Front door error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or the listener failing
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = &mut proxy_handle => {
                error!("Front door stopped unexpectedly, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = &mut proxy_handle => {
                error!("Front door stopped unexpectedly, shutting down...");
            }
        }
    }

    // Signal shutdown: the listener closes and open connections drain
    let _ = shutdown_tx.send(true);

    if !proxy_handle.is_finished() {
        let _ = proxy_handle.await;
    }
    let _ = monitor_handle.await;

    info!("Stopping all workers...");
    supervisor.stop_all().await;

    info!("Shutdown complete");
    Ok(())
}

async fn log_worker_events(mut events: broadcast::Receiver<WorkerEvent>) {
    loop {
        match events.recv().await {
            Ok(WorkerEvent::Spawned { id, pid, port, .. }) => {
                debug!(worker_id = %id, pid, port, "Worker event: spawned");
            }
            Ok(WorkerEvent::Exited { id, status, uptime, .. }) => {
                debug!(
                    worker_id = %id,
                    status = ?status,
                    uptime_ms = uptime.as_millis() as u64,
                    "Worker event: exited"
                );
            }
            Ok(WorkerEvent::SpawnFailed { id, retry_in, .. }) => {
                debug!(worker_id = %id, retry_in_ms = retry_in.as_millis() as u64, "Worker event: spawn failed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Worker event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting front door");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls_files = config.server.has_tls_files(),
        drain_timeout_secs = config.server.drain_timeout_secs,
        "Server configuration"
    );
    info!(
        command = %config.workers.command,
        args = ?config.workers.args,
        pool_size = config.workers.pool_size(),
        base_port = config.workers.base_port,
        min_uptime_ms = config.workers.min_uptime_ms,
        "Worker pool settings"
    );
    info!(
        health_path = %config.health.path,
        warmup_ms = config.health.warmup_ms,
        interval_ms = config.health.interval_ms,
        timeout_ms = config.health.timeout_ms,
        grace_period_ms = config.health.grace_period_ms,
        "Health check settings"
    );
    info!(
        upstream_idle_timeout_secs = config.proxy.upstream_idle_timeout_secs,
        max_replay_body_bytes = config.proxy.max_replay_body_bytes,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        "Upstream settings"
    );
    info!(
        prefix = %config.submission.prefix,
        host = %config.submission.host,
        port = config.submission.port,
        "Form submission route"
    );
}
