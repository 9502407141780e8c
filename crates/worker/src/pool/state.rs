//! Shared pool state
//!
//! The worker registry and broker status live behind one lock; counters
//! read on the job path are atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::worker::Worker;

/// Reachability of one configured broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerState {
    pub address: String,
    /// Last connection error; `None` while reachable
    pub error: Option<String>,
}

impl BrokerState {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct Registry {
    workers: HashMap<String, Arc<Worker>>,
    status_worker: Option<Arc<Worker>>,
    servers: Vec<BrokerState>,
}

/// State shared by the pool manager and its workers
pub struct PoolState {
    registry: RwLock<Registry>,
    tasks: AtomicU64,
    ballooning: AtomicUsize,
    utilization: AtomicUsize,
    active_workers: AtomicUsize,
    running: AtomicBool,
    next_worker: AtomicU64,
    idle_since: Mutex<Instant>,
    fatal: CancellationToken,
    fatal_message: Mutex<Option<String>>,
}

impl std::fmt::Debug for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolState")
            .field("workers", &self.worker_count())
            .field("active_workers", &self.active_workers())
            .field("tasks", &self.tasks())
            .field("ballooning", &self.ballooning())
            .finish()
    }
}

impl PoolState {
    /// State for the given brokers, all assumed reachable
    pub fn new(servers: &[String]) -> Self {
        let registry = Registry {
            servers: servers
                .iter()
                .map(|address| BrokerState {
                    address: address.clone(),
                    error: None,
                })
                .collect(),
            ..Default::default()
        };
        Self {
            registry: RwLock::new(registry),
            tasks: AtomicU64::new(0),
            ballooning: AtomicUsize::new(0),
            utilization: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            next_worker: AtomicU64::new(0),
            idle_since: Mutex::new(Instant::now()),
            fatal: CancellationToken::new(),
            fatal_message: Mutex::new(None),
        }
    }

    // ========================================================================
    // Brokers
    // ========================================================================

    /// Addresses of brokers currently considered reachable
    pub fn active_servers(&self) -> Vec<String> {
        self.registry
            .read()
            .servers
            .iter()
            .filter(|s| s.is_ok())
            .map(|s| s.address.clone())
            .collect()
    }

    pub fn servers(&self) -> Vec<BrokerState> {
        self.registry.read().servers.clone()
    }

    /// Record a broker's status
    ///
    /// Returns true when the broker flipped between reachable and
    /// unreachable.
    pub fn set_server_status(&self, address: &str, error: Option<String>) -> bool {
        let mut registry = self.registry.write();
        let Some(server) = registry.servers.iter_mut().find(|s| s.address == address) else {
            return false;
        };
        let changed = server.error.is_some() != error.is_some();
        server.error = error;
        changed
    }

    // ========================================================================
    // Workers
    // ========================================================================

    pub fn register(&self, worker: Arc<Worker>) {
        self.registry
            .write()
            .workers
            .insert(worker.id().to_string(), worker);
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<Worker>> {
        self.registry.write().workers.remove(id)
    }

    /// Snapshot of the registered check workers
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.registry.read().workers.values().cloned().collect()
    }

    pub fn worker_count(&self) -> usize {
        self.registry.read().workers.len()
    }

    /// First registered worker without a running job
    pub fn idle_worker(&self) -> Option<Arc<Worker>> {
        self.registry
            .read()
            .workers
            .values()
            .find(|w| !w.is_active())
            .cloned()
    }

    pub fn has_status_worker(&self) -> bool {
        self.registry.read().status_worker.is_some()
    }

    pub fn set_status_worker(&self, worker: Arc<Worker>) {
        self.registry.write().status_worker = Some(worker);
    }

    pub fn take_status_worker(&self) -> Option<Arc<Worker>> {
        self.registry.write().status_worker.take()
    }

    /// Drop the status worker entry if it is `id`
    pub fn clear_status_worker(&self, id: &str) {
        let mut registry = self.registry.write();
        if registry.status_worker.as_ref().is_some_and(|w| w.id() == id) {
            registry.status_worker = None;
        }
    }

    pub fn next_worker_id(&self) -> u64 {
        self.next_worker.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ========================================================================
    // Counters
    // ========================================================================

    /// Jobs received since start
    pub fn tasks(&self) -> u64 {
        self.tasks.load(Ordering::Relaxed)
    }

    pub fn add_task(&self) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Jobs running detached from their worker's job slot
    pub fn ballooning(&self) -> usize {
        self.ballooning.load(Ordering::Acquire)
    }

    /// Count one more detached job unless `capacity` is reached
    pub fn try_balloon_start(&self, capacity: usize) -> bool {
        self.ballooning
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn balloon_end(&self) {
        let _ = self
            .ballooning
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Busy workers in percent, as of the last pool tick
    pub fn utilization(&self) -> usize {
        self.utilization.load(Ordering::Relaxed)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn set_load(&self, active_workers: usize, utilization: usize) {
        self.active_workers.store(active_workers, Ordering::Relaxed);
        self.utilization.store(utilization, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Start of the current under-utilized stretch
    pub fn idle_since(&self) -> Instant {
        *self.idle_since.lock()
    }

    pub fn reset_idle(&self) {
        *self.idle_since.lock() = Instant::now();
    }

    // ========================================================================
    // Fatal errors
    // ========================================================================

    /// Record an error the process cannot recover from; the first one wins
    pub fn report_fatal(&self, message: impl Into<String>) {
        let mut slot = self.fatal_message.lock();
        if slot.is_none() {
            *slot = Some(message.into());
        }
        self.fatal.cancel();
    }

    /// Wait for a fatal error and return its message
    pub async fn fatal(&self) -> String {
        self.fatal.cancelled().await;
        self.fatal_message.lock().clone().unwrap_or_default()
    }
}

/// Busy workers in percent, truncated
pub fn utilization(active: usize, total: usize) -> usize {
    if total == 0 {
        0
    } else {
        active * 100 / total
    }
}
