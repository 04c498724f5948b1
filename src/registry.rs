//! Worker registry and round-robin selection
//!
//! The registry is the single piece of shared mutable state in the front door:
//! the supervisor registers and deregisters workers, the health monitor and the
//! proxy flip the `healthy` flag, and the proxy selects workers from the healthy
//! subset. All access goes through the narrow operations below; the lock is
//! never held across an `.await`.

use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pool slot ordinal of a worker (1-based); a replacement reuses its slot's id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Book-keeping for one spawned worker process
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// Unique per spawn, distinguishes successive incarnations of a slot
    pub generation: u64,
    pub port: u16,
    pub pid: Option<u32>,
    pub healthy: bool,
    /// Most recent probe attempt, successful or not
    pub last_check: Instant,
    /// Most recent successful probe (spawn time until the first one)
    pub last_success: Instant,
    pub spawned_at: Instant,
}

/// Where a selected worker can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTarget {
    pub id: WorkerId,
    pub generation: u64,
    pub port: u16,
}

/// Result of one liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The worker answered 200
    Ready,
    /// The worker answered with another status
    NotReady(u16),
    /// Connection refused, reset, or similar
    Failed,
    /// No answer within the probe timeout
    TimedOut,
}

/// Health transition caused by a probe, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    Recovered,
    BecameUnhealthy,
    Unchanged,
}

#[derive(Debug, Default)]
struct RouterState {
    /// Registration order is preserved for round-robin
    workers: Vec<WorkerRecord>,
    /// Index into the healthy subset computed at selection time
    cursor: usize,
}

/// Process-wide registry of workers plus the round-robin cursor
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    state: Mutex<RouterState>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned worker; it starts out healthy
    ///
    /// A record left over from a previous incarnation of the same slot is
    /// replaced, and the new record goes to the back of the rotation.
    pub fn register(&self, id: WorkerId, generation: u64, port: u16, pid: Option<u32>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.workers.retain(|w| w.id != id);
        state.workers.push(WorkerRecord {
            id,
            generation,
            port,
            pid,
            healthy: true,
            last_check: now,
            last_success: now,
            spawned_at: now,
        });
        info!(
            worker_id = %id,
            generation,
            port,
            pid,
            total_workers = state.workers.len(),
            "Registered worker"
        );
    }

    /// Remove a worker whose process exited
    ///
    /// Only the given generation is removed, so a late exit notification can
    /// never evict the replacement. Returns whether a record was removed.
    pub fn deregister(&self, id: WorkerId, generation: u64) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state
            .workers
            .iter()
            .position(|w| w.id == id && w.generation == generation)
        else {
            return false;
        };
        state.workers.remove(pos);
        info!(
            worker_id = %id,
            generation,
            total_workers = state.workers.len(),
            "Deregistered worker"
        );
        true
    }

    /// Put a worker back into rotation
    pub fn mark_healthy(&self, id: WorkerId) {
        let mut state = self.state.lock();
        if let Some(worker) = state.workers.iter_mut().find(|w| w.id == id) {
            if !worker.healthy {
                info!(worker_id = %id, "Worker marked healthy");
            }
            worker.healthy = true;
        }
    }

    /// Take a worker out of rotation until a probe sees it healthy again
    pub fn mark_unhealthy(&self, id: WorkerId) {
        let mut state = self.state.lock();
        if let Some(worker) = state.workers.iter_mut().find(|w| w.id == id) {
            if worker.healthy {
                warn!(worker_id = %id, port = worker.port, "Worker marked unhealthy");
            }
            worker.healthy = false;
        }
    }

    /// Take a selected worker out of rotation after a forwarding failure
    ///
    /// Ignored if the slot has been respawned since the worker was selected.
    pub fn report_failure(&self, target: &WorkerTarget) -> bool {
        let mut state = self.state.lock();
        let Some(worker) = state
            .workers
            .iter_mut()
            .find(|w| w.id == target.id && w.generation == target.generation)
        else {
            return false;
        };
        if worker.healthy {
            warn!(worker_id = %target.id, port = worker.port, "Worker marked unhealthy after forwarding failure");
        }
        worker.healthy = false;
        true
    }

    /// Apply a probe result taken at `now` to the given incarnation
    ///
    /// Transport failures (errors and timeouts) only take the worker out of
    /// rotation once more than `grace_period` has passed since its last
    /// successful probe; a single blip never flaps a worker out.
    pub fn apply_probe(
        &self,
        id: WorkerId,
        generation: u64,
        outcome: ProbeOutcome,
        grace_period: Duration,
        now: Instant,
    ) -> HealthChange {
        let mut state = self.state.lock();
        let Some(worker) = state
            .workers
            .iter_mut()
            .find(|w| w.id == id && w.generation == generation)
        else {
            debug!(worker_id = %id, generation, "Dropping probe result for replaced worker");
            return HealthChange::Unchanged;
        };

        let was_healthy = worker.healthy;
        worker.last_check = now;

        match outcome {
            ProbeOutcome::Ready => {
                worker.healthy = true;
                worker.last_success = now;
            }
            ProbeOutcome::NotReady(_) => {
                worker.healthy = false;
            }
            ProbeOutcome::Failed | ProbeOutcome::TimedOut => {
                if now.saturating_duration_since(worker.last_success) > grace_period {
                    worker.healthy = false;
                }
            }
        }

        match (was_healthy, worker.healthy) {
            (false, true) => HealthChange::Recovered,
            (true, false) => HealthChange::BecameUnhealthy,
            _ => HealthChange::Unchanged,
        }
    }

    /// Pick the next healthy worker, round-robin over the healthy subset
    ///
    /// The subset is recomputed on every call, so pool changes between calls
    /// can make the rotation skip or repeat a worker once. Returns `None`
    /// when no worker is healthy; never waits for one to appear.
    pub fn select_worker(&self) -> Option<WorkerTarget> {
        let mut state = self.state.lock();
        let healthy: Vec<WorkerTarget> = state
            .workers
            .iter()
            .filter(|w| w.healthy)
            .map(|w| WorkerTarget {
                id: w.id,
                generation: w.generation,
                port: w.port,
            })
            .collect();

        if healthy.is_empty() {
            return None;
        }

        state.cursor = (state.cursor + 1) % healthy.len();
        let selected = healthy[state.cursor];
        debug!(
            worker_id = %selected.id,
            port = selected.port,
            healthy_workers = healthy.len(),
            "Selected worker"
        );
        Some(selected)
    }

    /// Copy of every record, in registration order
    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        self.state.lock().workers.clone()
    }

    pub fn get(&self, id: WorkerId) -> Option<WorkerRecord> {
        self.state.lock().workers.iter().find(|w| w.id == id).cloned()
    }

    pub fn is_healthy(&self, id: WorkerId) -> bool {
        self.get(id).map(|w| w.healthy).unwrap_or(false)
    }

    /// Total number of registered workers
    pub fn len(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of workers currently eligible for selection
    pub fn healthy_count(&self) -> usize {
        self.state.lock().workers.iter().filter(|w| w.healthy).count()
    }
}
