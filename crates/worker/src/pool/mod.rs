//! Worker pool manager
//!
//! ```text
//!            ┌────────────── control (reload, shutdown, dump) ──────────────┐
//!            ▼                                                              │
//!   ┌────────────────┐  1s tick   ┌──────────────┐                      main/signals
//!   │  WorkerPool    │──────────▶ │ manage()     │ min → bottom → top
//!   │  run()         │            └──────┬───────┘
//!   └───────┬────────┘                   │ start / shutdown
//!           │                    ┌───────▼───────┐      ┌──────────────────┐
//!           │ 3s tick            │ Worker × N    │─────▶│ ResultDispatcher │
//!   ┌───────▼────────┐           │ status worker │      └──────────────────┘
//!   │ reachability   │──restart─▶└───────────────┘
//!   └────────────────┘
//! ```
//!
//! The pool grows while every worker is busy and the host has headroom, and
//! shrinks once utilization stays below [`LOW_WATERMARK`] for the idle
//! timeout. A broker flipping between reachable and unreachable restarts
//! all workers against the reachable set.

mod admission;
mod reload;
mod state;

use std::sync::Arc;
use std::time::Duration;

use gearcheck_exec::Executor;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::Broker;
use crate::codec::SharedCodec;
use crate::config::WorkerConfig;
use crate::dispatch::ResultDispatcher;
use crate::error::{PoolError, Result};
use crate::status::VERSION;
use crate::worker::{Worker, WorkerContext, WorkerRole};

pub use admission::{
    expected_open_files, max_possible_workers, open_files_limit, Admission, Denied, FdBudget,
    FixedProbe, LoadAverage, MemoryUsage, ResourceProbe, SystemProbe,
};
pub use reload::{epn_changed, requires_restart};
pub use state::{utilization, BrokerState, PoolState};

/// Interval of the manage tick
pub const MANAGE_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between broker reachability probes
pub const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Connect timeout for a reachability probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Utilization below which idle workers are stopped
pub const LOW_WATERMARK: usize = 90;

/// Grace period for running jobs on a graceful stop
pub const GRACEFUL_WAIT: Duration = Duration::from_secs(5);

/// Grace period for running jobs on an abrupt stop
pub const ABRUPT_WAIT: Duration = Duration::from_secs(1);

/// Longest wait for the result queue to empty on shutdown
pub const RESULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests delivered to a running pool
#[derive(Debug)]
pub enum Control {
    /// Apply a freshly parsed configuration
    Reload(Box<WorkerConfig>),
    /// Stop with a short grace period
    Shutdown,
    /// Stop and let running jobs finish
    GracefulShutdown,
    /// Log the pool's tasks
    Dump,
}

/// How [`WorkerPool::run`] ended
#[derive(Debug)]
pub enum PoolExit {
    Stopped,
    /// The configuration changed in a way that needs a new pool
    Restart {
        config: Box<WorkerConfig>,
        /// Workers to start right away
        initial_start: usize,
    },
}

/// Manages workers for one configuration
pub struct WorkerPool {
    ctx: WorkerContext,
    probe: Arc<dyn ResourceProbe>,
    budget: FdBudget,
    initial_start: usize,
    retry_interval: Duration,
    probe_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    reachability_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("state", &self.ctx.state)
            .field("budget", &self.budget)
            .finish()
    }
}

impl WorkerPool {
    /// Start the executor and result dispatcher for `config`
    ///
    /// `max_worker` is lowered to fit the open files limit.
    pub async fn start(
        mut config: WorkerConfig,
        broker: Arc<dyn Broker>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self> {
        let budget = FdBudget::current(config.max_worker);
        fit_budget(&mut config, &budget);

        let codec = SharedCodec::new(config.codec()?);
        let executor = Arc::new(Executor::start(config.exec_config()).await?);
        let state = Arc::new(PoolState::new(&config.server));
        let dispatcher = Arc::new(ResultDispatcher::start(&config, codec.clone(), broker.clone()));

        info!(
            "gearcheck-worker - version {} starting with {} workers (max {}), pid: {} (max open files: {})",
            VERSION,
            config.min_worker,
            config.max_worker,
            std::process::id(),
            budget.nofile
        );

        let ctx = WorkerContext {
            admission: Admission::new(&config, probe.clone()),
            ballooning_capacity: budget.ballooning_capacity(config.max_worker),
            config: Arc::new(config),
            codec,
            executor,
            broker,
            dispatcher,
            state,
            cancel: CancellationToken::new(),
            jobs: TaskTracker::new(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            ctx,
            probe,
            budget,
            initial_start: 0,
            retry_interval: RETRY_INTERVAL,
            probe_timeout: PROBE_TIMEOUT,
            shutdown_tx,
            shutdown_rx,
            reachability_handle: None,
        })
    }

    /// Start this many workers on the first tick instead of `min_worker`
    pub fn with_initial_start(mut self, count: usize) -> Self {
        self.initial_start = count;
        self
    }

    /// Set the interval between reachability probes
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the probe connect timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn state(&self) -> &Arc<PoolState> {
        &self.ctx.state
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.ctx.config
    }

    /// Manage workers until shut down or a restart is needed
    #[instrument(skip_all, fields(identifier = %self.ctx.config.identifier))]
    pub async fn run(mut self, control: &mut mpsc::Receiver<Control>) -> Result<PoolExit> {
        info!(
            servers = ?self.ctx.config.server,
            queues = ?self.ctx.config.job_queues(),
            min_worker = self.ctx.config.min_worker,
            max_worker = self.ctx.config.max_worker,
            "Starting worker pool"
        );
        let state = self.ctx.state.clone();
        state.set_running(true);
        self.start_reachability_loop();

        self.manage(self.initial_start).await;

        let mut ticker = tokio::time::interval(MANAGE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.manage(0).await;
                    if let Err(e) = self.ctx.executor.check_restart().await {
                        error!(error = %e, "failed to restart embedded interpreter");
                        self.shutdown(ABRUPT_WAIT).await;
                        return Err(e.into());
                    }
                }
                message = control.recv() => match message {
                    Some(Control::Reload(config)) => match self.reload(*config).await {
                        Ok(Some(exit)) => return Ok(exit),
                        Ok(None) => {}
                        Err(e) => {
                            self.shutdown(ABRUPT_WAIT).await;
                            return Err(e);
                        }
                    },
                    Some(Control::GracefulShutdown) => {
                        self.shutdown(GRACEFUL_WAIT).await;
                        return Ok(PoolExit::Stopped);
                    }
                    Some(Control::Shutdown) | None => {
                        self.shutdown(ABRUPT_WAIT).await;
                        return Ok(PoolExit::Stopped);
                    }
                    Some(Control::Dump) => self.dump(),
                },
                message = state.fatal() => {
                    error!(error = %message, "fatal error, shutting down");
                    self.shutdown(ABRUPT_WAIT).await;
                    return Err(PoolError::Fatal(message));
                }
            }
        }
    }

    // ========================================================================
    // Worker count
    // ========================================================================

    /// One pass of the pool state machine
    async fn manage(&mut self, initial_start: usize) {
        let state = self.ctx.state.clone();
        if state.active_servers().is_empty() {
            debug!("no reachable broker, retrying");
            return;
        }

        if !state.has_status_worker() {
            if let Some(worker) = Worker::start(self.ctx.clone(), WorkerRole::Status).await {
                state.set_status_worker(worker);
            }
        }

        let config = self.ctx.config.clone();
        let total = state.worker_count();
        let active = state.workers().iter().filter(|w| w.is_active()).count();
        debug!(total, active, min_worker = config.min_worker, max_worker = config.max_worker, "managing workers");

        let min_worker = if initial_start > 0 {
            initial_start.min(config.max_worker)
        } else {
            config.min_worker
        };
        while state.worker_count() < min_worker {
            if !self.spawn_worker().await {
                break;
            }
        }

        let utilization = utilization(active, total);
        state.set_load(active, utilization);

        self.adjust_bottom_level(utilization);
        if let Err(denied) = self.adjust_top_level(active).await {
            debug!(reason = %denied, "not starting more workers");
        }

        let adjusted = state.worker_count();
        if adjusted != total {
            debug!("adjusted workers: {} (utilization: {}%)", adjusted, utilization);
        }
    }

    async fn spawn_worker(&self) -> bool {
        match Worker::start(self.ctx.clone(), WorkerRole::Check).await {
            Some(worker) => {
                self.ctx.state.register(worker);
                self.ctx.state.reset_idle();
                true
            }
            None => false,
        }
    }

    /// Grow by `spawn_rate` while every worker is busy
    async fn adjust_top_level(&self, active: usize) -> std::result::Result<(), Denied> {
        let state = &self.ctx.state;
        let max_worker = self.ctx.config.max_worker;
        if active < state.worker_count() || state.worker_count() >= max_worker {
            return Ok(());
        }
        self.ctx.admission.check()?;

        for _ in 0..self.ctx.config.spawn_rate {
            if state.worker_count() >= max_worker {
                break;
            }
            if !self.spawn_worker().await {
                break;
            }
        }
        Ok(())
    }

    /// Stop idle workers once the pool was under-used for the idle timeout
    fn adjust_bottom_level(&self, utilization: usize) {
        let state = &self.ctx.state;
        let config = &self.ctx.config;
        let count = state.worker_count();
        if count == 0 || count <= config.min_worker || utilization >= LOW_WATERMARK {
            return;
        }
        if state.idle_since().elapsed() <= config.idle_timeout {
            return;
        }

        for _ in 0..config.effective_sink_rate() {
            if state.worker_count() <= config.min_worker {
                break;
            }
            match state.idle_worker() {
                Some(worker) => {
                    debug!(worker_id = %worker.id(), "stopping idle worker");
                    worker.shutdown();
                }
                None => break,
            }
        }
    }

    // ========================================================================
    // Reachability
    // ========================================================================

    fn start_reachability_loop(&mut self) {
        let state = self.ctx.state.clone();
        let broker = self.ctx.broker.clone();
        let servers = self.ctx.config.server.clone();
        let interval = self.retry_interval;
        let probe_timeout = self.probe_timeout;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !state.is_running() {
                            continue;
                        }
                        if retry_failed_connections(&state, &*broker, &servers, probe_timeout).await {
                            info!("broker availability changed, restarting workers");
                            stop_all_workers(&state, GRACEFUL_WAIT).await;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reachability loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Reachability loop exited");
        });

        self.reachability_handle = Some(handle);
    }

    // ========================================================================
    // Reload and shutdown
    // ========================================================================

    /// Apply a new configuration in place, or end the pool if it must be rebuilt
    #[instrument(skip_all)]
    async fn reload(&mut self, mut config: WorkerConfig) -> Result<Option<PoolExit>> {
        if requires_restart(&self.ctx.config, &config) {
            info!("configuration changed, restarting workers");
            let initial_start = self.shutdown(GRACEFUL_WAIT).await;
            return Ok(Some(PoolExit::Restart {
                config: Box::new(config),
                initial_start,
            }));
        }

        let codec = match config.codec() {
            Ok(codec) => codec,
            Err(e) => {
                error!(error = %e, "cannot reload configuration");
                return Ok(None);
            }
        };
        let budget = FdBudget::current(config.max_worker);
        fit_budget(&mut config, &budget);

        let exec_config = config.exec_config();
        let executor = if epn_changed(&self.ctx.config, &config) {
            info!("embedded interpreter settings changed, restarting it");
            self.ctx.executor.shutdown();
            Executor::start(exec_config).await?
        } else {
            let executor = Executor::new(exec_config);
            match self.ctx.executor.epn() {
                Some(supervisor) if config.enable_embedded_perl => executor.with_epn(supervisor.clone()),
                _ => executor,
            }
        };

        self.ctx.admission = Admission::new(&config, self.probe.clone());
        self.ctx.ballooning_capacity = budget.ballooning_capacity(config.max_worker);
        self.budget = budget;
        self.ctx.codec.replace(codec);
        self.ctx.executor = Arc::new(executor);
        self.ctx.config = Arc::new(config);
        info!("reloading configuration finished, no worker restart necessary");
        Ok(None)
    }

    /// Stop workers, drain results and stop background tasks
    ///
    /// Returns the number of workers that stopped within `wait`.
    #[instrument(skip(self))]
    async fn shutdown(&mut self, wait: Duration) -> usize {
        info!("Initiating shutdown");
        let state = &self.ctx.state;
        state.set_running(false);
        let _ = self.shutdown_tx.send(true);

        let stopped = stop_all_workers(state, wait).await;

        self.ctx.jobs.close();
        if tokio::time::timeout(wait, self.ctx.jobs.wait()).await.is_err() {
            warn!(remaining = self.ctx.jobs.len(), "canceling background jobs");
            self.ctx.cancel.cancel();
            if tokio::time::timeout(wait, self.ctx.jobs.wait()).await.is_err() {
                warn!(remaining = self.ctx.jobs.len(), "background jobs did not stop");
            }
        }

        if !self.ctx.dispatcher.drain(RESULT_DRAIN_TIMEOUT).await {
            warn!(queued = self.ctx.dispatcher.queued(), "result queue not empty after shutdown timeout");
        }
        self.ctx.dispatcher.terminate().await;
        self.ctx.executor.shutdown();

        if let Some(handle) = self.reachability_handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "reachability loop failed");
            }
        }

        info!(stopped, "Worker pool stopped");
        stopped
    }

    /// Log every worker and queue
    fn dump(&self) {
        let state = &self.ctx.state;
        info!(
            workers = state.worker_count(),
            active_workers = state.active_workers(),
            utilization = state.utilization(),
            ballooning = state.ballooning(),
            tasks = state.tasks(),
            jobs = self.ctx.jobs.len(),
            "task dump"
        );
        for server in state.servers() {
            info!(address = %server.address, error = ?server.error, "broker");
        }
        for worker in state.workers() {
            info!(worker_id = %worker.id(), active_jobs = worker.active_jobs(), "worker");
        }
        self.ctx.dispatcher.log_state();
    }
}

/// Lower `max_worker` (and `min_worker`) to what the open files limit allows
fn fit_budget(config: &mut WorkerConfig, budget: &FdBudget) {
    let Some(max_possible) = budget.clamped else {
        return;
    };
    warn!(
        "current max worker setting ({}) requires open files ulimit of at least {}, current value is {}. Setting max worker limit to {}",
        config.max_worker,
        expected_open_files(config.max_worker),
        budget.nofile,
        max_possible
    );
    config.max_worker = max_possible;
    config.min_worker = config.min_worker.min(max_possible);
}

/// Probe every broker; returns true when any flipped reachability
pub async fn retry_failed_connections(
    state: &PoolState,
    broker: &dyn Broker,
    servers: &[String],
    timeout: Duration,
) -> bool {
    let mut changed = false;
    for address in servers {
        let status = match broker.probe(address, timeout).await {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        let reachable = status.is_none();
        if state.set_server_status(address, status) {
            changed = true;
            if reachable {
                info!(address = %address, "broker reachable again");
            } else {
                warn!(address = %address, "broker unreachable");
            }
        }
    }
    changed
}

/// Shut down every worker and wait up to `wait` for them
///
/// Workers still running afterwards are canceled. Returns the number of
/// workers that stopped in time.
pub async fn stop_all_workers(state: &PoolState, wait: Duration) -> usize {
    let workers = state.workers();
    for worker in &workers {
        worker.shutdown();
    }

    let deadline = tokio::time::Instant::now() + wait;
    let stopped = futures::future::join_all(
        workers
            .iter()
            .map(|worker| tokio::time::timeout_at(deadline, worker.wait())),
    )
    .await
    .into_iter()
    .filter(|waited| waited.is_ok())
    .count();

    let status_worker = state.take_status_worker();
    let remaining = workers.len() - stopped;
    if remaining > 0 {
        warn!(
            "{:?} timeout hit while waiting for all workers to stop, remaining: {}",
            wait, remaining
        );
        if let Some(worker) = status_worker {
            worker.cancel();
        }
        for worker in workers.iter().filter(|w| !w.is_stopped()) {
            worker.cancel();
        }
    } else if let Some(worker) = status_worker {
        worker.shutdown();
    }
    stopped
}
