use crate::backoff::RestartBackoff;
use crate::config::WorkerConfig;
use crate::registry::{WorkerId, WorkerRegistry};
use futures::future::join_all;
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle notifications published by the supervisor
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker process was started and registered
    Spawned {
        id: WorkerId,
        generation: u64,
        pid: Option<u32>,
        port: u16,
    },
    /// A worker process exited and was deregistered
    Exited {
        id: WorkerId,
        generation: u64,
        status: Option<ExitStatus>,
        uptime: Duration,
    },
    /// Starting a worker process failed
    SpawnFailed {
        id: WorkerId,
        error: String,
        retry_in: Duration,
    },
}

/// Keeps a fixed-size pool of worker processes running.
///
/// Each pool slot is driven by its own task that spawns the worker, awaits its
/// exit and immediately spawns a replacement. Fast exits are treated as
/// crashes and delay the next spawn with exponential backoff, so a broken
/// worker binary cannot pin a core in a respawn loop.
///
/// The supervisor is used behind an `Arc`; [`new`](WorkerSupervisor::new)
/// returns one directly.
pub struct WorkerSupervisor {
    config: WorkerConfig,
    registry: Arc<WorkerRegistry>,
    events: broadcast::Sender<WorkerEvent>,
    next_generation: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    slots: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(config: WorkerConfig, registry: Arc<WorkerRegistry>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry,
            events,
            next_generation: AtomicU64::new(0),
            shutdown_tx,
            slots: Mutex::new(Vec::new()),
        })
    }

    /// Receive spawn/exit notifications
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Port the worker in the given slot listens on
    pub fn port_for(&self, id: WorkerId) -> u16 {
        self.config.base_port.saturating_add(id.0 as u16)
    }

    /// Spawn `pool_size` workers, one task per slot
    pub fn start(self: &Arc<Self>, pool_size: usize) {
        let mut slots = self.slots.lock();
        if !slots.is_empty() {
            warn!(pool_size = slots.len(), "Worker pool already started");
            return;
        }

        info!(
            pool_size,
            command = %self.config.command,
            base_port = self.config.base_port,
            "Starting worker pool"
        );

        for slot in 1..=pool_size {
            let supervisor = Arc::clone(self);
            let id = WorkerId(slot as u32);
            let shutdown_rx = self.shutdown_tx.subscribe();
            slots.push(tokio::spawn(async move {
                supervisor.run_slot(id, shutdown_rx).await;
            }));
        }
    }

    /// Stop respawning, terminate every worker and wait for the slot tasks
    pub async fn stop_all(&self) {
        self.shutdown_tx.send_replace(true);
        let slots: Vec<JoinHandle<()>> = std::mem::take(&mut *self.slots.lock());
        info!(workers = slots.len(), "Stopping worker pool");
        for result in join_all(slots).await {
            if let Err(e) = result {
                error!(error = %e, "Worker slot task failed");
            }
        }
    }

    async fn run_slot(self: Arc<Self>, id: WorkerId, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = RestartBackoff::new(
            self.config.restart_backoff_base(),
            self.config.restart_backoff_max(),
            self.config.min_uptime(),
        );
        let port = self.port_for(id);

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

            let mut child = match self.spawn_worker(id, port) {
                Ok(child) => child,
                Err(e) => {
                    let retry_in = backoff.on_crash();
                    error!(
                        worker_id = %id,
                        error = %e,
                        retry_in_ms = retry_in.as_millis() as u64,
                        "Failed to spawn worker"
                    );
                    let _ = self.events.send(WorkerEvent::SpawnFailed {
                        id,
                        error: e.to_string(),
                        retry_in,
                    });
                    if sleep_or_shutdown(retry_in, &mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            };

            let pid = child.id();
            let spawned_at = Instant::now();
            self.registry.register(id, generation, port, pid);
            info!(worker_id = %id, generation, pid, port, "Worker spawned");
            let _ = self.events.send(WorkerEvent::Spawned {
                id,
                generation,
                pid,
                port,
            });

            let exit = tokio::select! {
                status = child.wait() => Some(status),
                _ = wait_for_shutdown(&mut shutdown_rx) => None,
            };

            let Some(status) = exit else {
                self.registry.deregister(id, generation);
                self.stop_process(id, &mut child).await;
                return;
            };

            let uptime = spawned_at.elapsed();
            self.registry.deregister(id, generation);

            let status = match status {
                Ok(status) => {
                    warn!(worker_id = %id, generation, pid, %status, uptime_ms = uptime.as_millis() as u64, "Worker exited");
                    Some(status)
                }
                Err(e) => {
                    error!(worker_id = %id, generation, pid, error = %e, "Failed to wait for worker");
                    None
                }
            };
            let _ = self.events.send(WorkerEvent::Exited {
                id,
                generation,
                status,
                uptime,
            });

            let delay = backoff.on_exit(uptime);
            if !delay.is_zero() {
                warn!(
                    worker_id = %id,
                    crashes = backoff.consecutive_crashes(),
                    delay_ms = delay.as_millis() as u64,
                    "Worker exited shortly after start, delaying respawn"
                );
            }
            if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                return;
            }
        }
    }

    fn spawn_worker(&self, id: WorkerId, port: u16) -> anyhow::Result<Child> {
        debug!(worker_id = %id, command = %self.config.command, port, "Spawning worker");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        cmd.env("PORT", port.to_string());
        cmd.env("WORKER_ID", id.to_string());

        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to start '{}': {}", self.config.command, e))?;
        Ok(child)
    }

    /// SIGTERM, then SIGKILL once the grace period runs out
    async fn stop_process(&self, id: WorkerId, child: &mut Child) {
        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = child.id() {
            info!(worker_id = %id, pid, "Sending SIGTERM to worker");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(worker_id = %id, %status, "Worker exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(worker_id = %id, error = %e, "Error waiting for worker to exit");
            }
            Err(_) => {
                warn!(
                    worker_id = %id,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

/// Resolves once shutdown is requested (or the supervisor is gone)
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay`; returns true if shutdown was requested meanwhile
async fn sleep_or_shutdown(delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    if delay.is_zero() {
        return *rx.borrow();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => *rx.borrow(),
        _ = wait_for_shutdown(rx) => true,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper_config() -> WorkerConfig {
        let mut config = WorkerConfig::local("sleep").with_args(vec!["60".to_string()]);
        config.base_port = 41000;
        config.shutdown_grace_period_secs = 1;
        config
    }

    async fn next_event(rx: &mut broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("supervisor event in time")
            .expect("event channel open")
    }

    async fn wait_for_spawns(rx: &mut broadcast::Receiver<WorkerEvent>, count: usize) -> Vec<(WorkerId, Option<u32>)> {
        let mut spawned = Vec::new();
        while spawned.len() < count {
            if let WorkerEvent::Spawned { id, pid, .. } = next_event(rx).await {
                spawned.push((id, pid));
            }
        }
        spawned
    }

    #[tokio::test]
    async fn test_start_registers_pool() {
        let registry = Arc::new(WorkerRegistry::new());
        let supervisor = WorkerSupervisor::new(sleeper_config(), Arc::clone(&registry));
        let mut events = supervisor.subscribe();

        supervisor.start(3);
        let spawned = wait_for_spawns(&mut events, 3).await;

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.healthy_count(), 3);
        let mut ids: Vec<u32> = spawned.iter().map(|(id, _)| id.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(registry.get(WorkerId(2)).unwrap().port, 41002);

        supervisor.stop_all().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_killed_worker_is_replaced() {
        let registry = Arc::new(WorkerRegistry::new());
        let supervisor = WorkerSupervisor::new(sleeper_config(), Arc::clone(&registry));
        let mut events = supervisor.subscribe();

        supervisor.start(2);
        let spawned = wait_for_spawns(&mut events, 2).await;
        let (victim, victim_pid) = spawned[0];
        let victim_pid = victim_pid.expect("spawned worker has a pid");
        let old_generation = registry.get(victim).unwrap().generation;

        unsafe {
            libc::kill(victim_pid as i32, libc::SIGKILL);
        }

        loop {
            match next_event(&mut events).await {
                WorkerEvent::Exited { id, status, .. } => {
                    assert_eq!(id, victim);
                    assert!(status.map(|s| !s.success()).unwrap_or(true));
                }
                WorkerEvent::Spawned { id, pid, .. } => {
                    assert_eq!(id, victim);
                    assert_ne!(pid, Some(victim_pid));
                    break;
                }
                WorkerEvent::SpawnFailed { error, .. } => panic!("unexpected spawn failure: {}", error),
            }
        }

        assert_eq!(registry.len(), 2);
        let replacement = registry.get(victim).unwrap();
        assert!(replacement.generation > old_generation);
        assert!(replacement.healthy);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_crash_loop_backs_off() {
        let mut config = WorkerConfig::local("sh").with_args(vec!["-c".to_string(), "exit 1".to_string()]);
        config.min_uptime_ms = 1000;
        config.restart_backoff_base_ms = 100;
        config.restart_backoff_max_ms = 400;

        let registry = Arc::new(WorkerRegistry::new());
        let supervisor = WorkerSupervisor::new(config, Arc::clone(&registry));
        let mut events = supervisor.subscribe();

        supervisor.start(1);

        let mut spawn_times = Vec::new();
        while spawn_times.len() < 3 {
            if let WorkerEvent::Spawned { .. } = next_event(&mut events).await {
                spawn_times.push(Instant::now());
            }
        }

        // Second respawn waits at least base * 2
        assert!(spawn_times[2] - spawn_times[1] >= Duration::from_millis(200));

        tokio::time::timeout(Duration::from_secs(2), supervisor.stop_all())
            .await
            .expect("stop_all interrupts backoff");
    }

    #[tokio::test]
    async fn test_missing_binary_reports_spawn_failure() {
        let mut config = WorkerConfig::local("/nonexistent/forkgate-worker");
        config.restart_backoff_base_ms = 50;

        let registry = Arc::new(WorkerRegistry::new());
        let supervisor = WorkerSupervisor::new(config, Arc::clone(&registry));
        let mut events = supervisor.subscribe();

        supervisor.start(1);
        match next_event(&mut events).await {
            WorkerEvent::SpawnFailed { id, error, retry_in } => {
                assert_eq!(id, WorkerId(1));
                assert!(error.contains("/nonexistent/forkgate-worker"));
                assert!(retry_in >= Duration::from_millis(50));
            }
            other => panic!("expected spawn failure, got {:?}", other),
        }
        assert!(registry.is_empty());

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_all_terminates_workers() {
        let registry = Arc::new(WorkerRegistry::new());
        let supervisor = WorkerSupervisor::new(sleeper_config(), Arc::clone(&registry));
        let mut events = supervisor.subscribe();

        supervisor.start(2);
        let spawned = wait_for_spawns(&mut events, 2).await;

        supervisor.stop_all().await;
        assert!(registry.is_empty());

        for (_, pid) in spawned {
            let pid = pid.unwrap() as i32;
            // Signal 0 only checks existence; the reaped child is gone
            let alive = unsafe { libc::kill(pid, 0) } == 0;
            assert!(!alive, "worker {} still running", pid);
        }
    }
}
