//! Health monitor for the worker pool
//!
//! After a warm-up delay, periodically probes every registered worker's
//! liveness endpoint and updates its health flag in the registry.

use crate::config::HealthConfig;
use crate::registry::{HealthChange, ProbeOutcome, WorkerRecord, WorkerRegistry};
use crate::upstream::UpstreamClient;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Delay before the first probe round
    pub warmup: Duration,
    /// Interval between probe rounds
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Tolerated time since the last successful probe before failures count
    pub grace_period: Duration,
    /// Liveness endpoint path
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthCheckConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            warmup: config.warmup(),
            interval: config.interval(),
            timeout: config.timeout(),
            grace_period: config.grace_period(),
            path: config.path.clone(),
        }
    }
}

/// Health checker that monitors the worker pool
pub struct HealthMonitor {
    registry: Arc<WorkerRegistry>,
    client: Arc<UpstreamClient>,
    config: HealthCheckConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        client: Arc<UpstreamClient>,
        config: HealthCheckConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            client,
            config,
            shutdown_rx,
        }
    }

    /// Run until shutdown is signalled
    pub async fn run(mut self) {
        info!(
            warmup_ms = self.config.warmup.as_millis() as u64,
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_ms = self.config.timeout.as_millis() as u64,
            grace_period_ms = self.config.grace_period.as_millis() as u64,
            path = %self.config.path,
            "Health monitor started"
        );

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.warmup,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                result = self.shutdown_rx.changed() => {
                    if result.is_err() || *self.shutdown_rx.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every registered worker concurrently and apply the results
    ///
    /// A slow probe only holds up its own worker; the round finishes within
    /// one probe timeout.
    pub async fn check_all(&self) {
        let workers = self.registry.snapshot();
        debug!(workers = workers.len(), "Running health checks");

        join_all(workers.into_iter().map(|worker| self.check_worker(worker))).await;
    }

    async fn check_worker(&self, worker: WorkerRecord) {
        let outcome = self
            .client
            .probe(worker.port, &self.config.path, self.config.timeout)
            .await;

        let change = self.registry.apply_probe(
            worker.id,
            worker.generation,
            outcome,
            self.config.grace_period,
            Instant::now(),
        );

        match (change, outcome) {
            (HealthChange::Recovered, _) => {
                info!(worker_id = %worker.id, port = worker.port, "Worker is now healthy");
            }
            (HealthChange::BecameUnhealthy, ProbeOutcome::NotReady(status)) => {
                warn!(worker_id = %worker.id, port = worker.port, status, "Worker is now unhealthy");
            }
            (HealthChange::BecameUnhealthy, _) => {
                warn!(
                    worker_id = %worker.id,
                    port = worker.port,
                    ?outcome,
                    grace_period_ms = self.config.grace_period.as_millis() as u64,
                    "Worker is now unhealthy, no successful probe within grace period"
                );
            }
            (HealthChange::Unchanged, ProbeOutcome::Failed | ProbeOutcome::TimedOut) => {
                debug!(worker_id = %worker.id, port = worker.port, ?outcome, "Probe failed");
            }
            (HealthChange::Unchanged, _) => {}
        }
    }
}
