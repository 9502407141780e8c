//! Broker subscription and job handling
//!
//! A [`Worker`] holds one connection per reachable broker. The connections
//! share a single job slot, so a worker runs at most one job at a time
//! unless a long job gets detached ("ballooning"):
//!
//! ```text
//! running ──(threshold elapsed, pool busy, resources ok)──▶ detached
//!    │                                                         │
//!    └──────────────── finished ◀──────────────────────────────┘
//! ```
//!
//! A detached job is reported to the broker as done and keeps running in
//! the pool's job tracker, counted in the ballooning total.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gearcheck_exec::Executor;
use gearcheck_protocol::{Answer, Request};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Job, WorkerConnection};
use crate::codec::SharedCodec;
use crate::config::WorkerConfig;
use crate::dispatch::ResultDispatcher;
use crate::pool::{Admission, PoolState};
use crate::status::status_text;

/// Pool utilization in percent from which jobs may be detached
pub const BALLOONING_UTILIZATION: usize = 70;

/// Data sent with WORK_COMPLETE for check jobs
const COMPLETE_DATA: &[u8] = b"OK";

const JOB_RUNNING: u8 = 0;
const JOB_DETACHED: u8 = 1;
const JOB_DONE: u8 = 2;

/// Everything a worker needs, shared with the pool
///
/// Workers keep the context they were started with; a reload only affects
/// workers started afterwards. The codec is the exception: it is shared and
/// read per job.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<WorkerConfig>,
    pub codec: SharedCodec,
    pub executor: Arc<Executor>,
    pub broker: Arc<dyn Broker>,
    pub dispatcher: Arc<ResultDispatcher>,
    pub state: Arc<PoolState>,
    pub admission: Admission,
    /// Detached jobs allowed on top of `max_worker`
    pub ballooning_capacity: usize,
    /// Parent of every worker's cancel token
    pub cancel: CancellationToken,
    /// Every job execution, detached ones included
    pub jobs: TaskTracker,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("identifier", &self.config.identifier)
            .field("ballooning_capacity", &self.ballooning_capacity)
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

/// Job classes a worker subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Host, service, eventhandler, notification and group queues
    Check,
    /// The `worker_<identifier>` queue
    Status,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Check => f.write_str("check"),
            WorkerRole::Status => f.write_str("status"),
        }
    }
}

/// What to tell the broker about a job
#[derive(Debug, PartialEq, Eq)]
enum JobOutcome {
    Complete(Vec<u8>),
    Fail,
}

/// One subscription loop per reachable broker
pub struct Worker {
    id: String,
    role: WorkerRole,
    ctx: WorkerContext,
    active_jobs: AtomicUsize,
    /// Stop taking new jobs
    stop: CancellationToken,
    /// Abort running jobs and drop the connections
    cancel: CancellationToken,
    loops: TaskTracker,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("active_jobs", &self.active_jobs())
            .finish()
    }
}

impl Worker {
    /// Connect to every reachable broker and start the subscription loops
    ///
    /// Returns `None` when no broker is reachable or any connection fails;
    /// a failed broker is marked unreachable.
    pub async fn start(ctx: WorkerContext, role: WorkerRole) -> Option<Arc<Self>> {
        let servers = ctx.state.active_servers();
        if servers.is_empty() {
            debug!(role = %role, "no reachable broker, not starting worker");
            return None;
        }

        let queues = match role {
            WorkerRole::Check => ctx.config.job_queues(),
            WorkerRole::Status => vec![ctx.config.status_queue()],
        };
        let id = format!("{}-{}", role, ctx.state.next_worker_id());

        let mut connections = Vec::with_capacity(servers.len());
        for address in &servers {
            match ctx
                .broker
                .connect_worker(address, &ctx.config.identifier, &queues)
                .await
            {
                Ok(conn) => connections.push(conn),
                Err(e) => {
                    warn!(worker_id = %id, address = %address, error = %e, "worker failed to connect");
                    ctx.state.set_server_status(address, Some(e.to_string()));
                    return None;
                }
            }
        }

        let worker = Arc::new(Self {
            id,
            role,
            cancel: ctx.cancel.child_token(),
            ctx,
            active_jobs: AtomicUsize::new(0),
            stop: CancellationToken::new(),
            loops: TaskTracker::new(),
        });

        let slot = Arc::new(Semaphore::new(1));
        for conn in connections {
            worker
                .loops
                .spawn(worker.clone().run_connection(conn, slot.clone()));
        }
        worker.loops.close();

        debug!(worker_id = %worker.id, queues = ?queues, servers = ?servers, "worker started");
        Some(worker)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// Jobs currently executing, detached ones included
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active_jobs() > 0
    }

    /// Leave the pool and stop after the current job
    pub fn shutdown(&self) {
        self.leave_pool();
        if self.is_active() {
            debug!(worker_id = %self.id, active_jobs = self.active_jobs(), "stopping worker after current job");
        } else {
            debug!(worker_id = %self.id, "closing idle worker");
        }
        self.stop.cancel();
    }

    /// Abort running jobs and close the connections
    pub fn cancel(&self) {
        debug!(worker_id = %self.id, "canceling worker");
        self.leave_pool();
        self.stop.cancel();
        self.cancel.cancel();
    }

    fn leave_pool(&self) {
        match self.role {
            WorkerRole::Check => {
                self.ctx.state.unregister(&self.id);
            }
            WorkerRole::Status => self.ctx.state.clear_status_worker(&self.id),
        }
    }

    /// Wait until every subscription loop has exited
    pub async fn wait(&self) {
        self.loops.wait().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.loops.is_closed() && self.loops.is_empty()
    }

    async fn run_connection(self: Arc<Self>, mut conn: Box<dyn WorkerConnection>, slot: Arc<Semaphore>) {
        let address = conn.address().to_string();
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.stop.cancelled() => break,
                permit = slot.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let grabbed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                grabbed = conn.grab_job() => grabbed,
            };

            let result = match grabbed {
                Ok(Some(job)) => {
                    let outcome = self.handle_job(&job).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    match outcome {
                        JobOutcome::Complete(data) => conn.complete(&job.handle, &data).await,
                        JobOutcome::Fail => conn.fail(&job.handle).await,
                    }
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.stop.cancelled() => break,
                        woke = conn.wait_for_job() => woke,
                    }
                }
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                self.connection_failed(&address, e);
                break;
            }
        }
        debug!(worker_id = %self.id, address = %address, "subscription loop stopped");
    }

    fn connection_failed(&self, address: &str, err: BrokerError) {
        if err.is_disconnect() {
            warn!(worker_id = %self.id, address = %address, error = %err, "lost connection to broker");
            self.ctx.state.set_server_status(address, Some(err.to_string()));
        } else {
            error!(worker_id = %self.id, address = %address, error = %err, "broker error");
        }
        self.shutdown();
    }

    async fn handle_job(self: &Arc<Self>, job: &Job) -> JobOutcome {
        match self.role {
            WorkerRole::Status => {
                debug!(worker_id = %self.id, handle = %job.handle, "status request");
                JobOutcome::Complete(status_text(&self.ctx.config, &self.ctx.state).into_bytes())
            }
            WorkerRole::Check => self.run_check(job).await,
        }
    }

    async fn run_check(self: &Arc<Self>, job: &Job) -> JobOutcome {
        self.active_jobs.fetch_add(1, Ordering::AcqRel);
        let request = match self.ctx.codec.current().decode_request(&job.payload) {
            Ok(request) => request,
            Err(e) => {
                error!(worker_id = %self.id, handle = %job.handle, error = %e, "decrypt failed");
                self.active_jobs.fetch_sub(1, Ordering::AcqRel);
                return JobOutcome::Fail;
            }
        };
        self.ctx.state.add_task();
        log_job(&self.id, "incoming", &request, &job.handle, None);

        let detach = Arc::new(AtomicU8::new(JOB_RUNNING));
        let mut task = self.ctx.jobs.spawn(self.clone().execute_job(
            request,
            job.handle.clone(),
            detach.clone(),
        ));

        let threshold = self.ctx.config.backgrounding_threshold;
        if threshold.is_zero() || self.ctx.state.utilization() < BALLOONING_UTILIZATION {
            return self.outcome(task.await);
        }

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + threshold, threshold);
        loop {
            let detached = tokio::select! {
                result = &mut task => return self.outcome(result),
                _ = ticker.tick() => self.try_detach(&detach, threshold),
            };
            if detached {
                info!(worker_id = %self.id, handle = %job.handle, "job exceeded backgrounding threshold, continuing in background");
                let state = self.ctx.state.clone();
                self.ctx.jobs.spawn(async move {
                    if let Err(e) = task.await {
                        report_join_error(&state, &e);
                    }
                });
                return JobOutcome::Complete(COMPLETE_DATA.to_vec());
            }
        }
    }

    /// Move a running job to the detached state if the pool allows it
    fn try_detach(&self, detach: &AtomicU8, threshold: Duration) -> bool {
        let state = &self.ctx.state;
        if state.utilization() < BALLOONING_UTILIZATION {
            return false;
        }
        if let Err(denied) = self.ctx.admission.check() {
            debug!(worker_id = %self.id, reason = %denied, "not moving job to background");
            return false;
        }
        if !state.try_balloon_start(self.ctx.ballooning_capacity) {
            debug!(worker_id = %self.id, ballooning = state.ballooning(), "no capacity left for background jobs");
            return false;
        }

        if detach
            .compare_exchange(JOB_RUNNING, JOB_DETACHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(worker_id = %self.id, threshold = ?threshold, ballooning = state.ballooning(), "job detached");
            return true;
        }
        // finished in the meantime
        state.balloon_end();
        false
    }

    fn outcome(&self, result: Result<bool, JoinError>) -> JobOutcome {
        match result {
            Ok(false) => JobOutcome::Complete(COMPLETE_DATA.to_vec()),
            Ok(true) => JobOutcome::Fail,
            Err(e) => {
                report_join_error(&self.ctx.state, &e);
                JobOutcome::Fail
            }
        }
    }

    /// Run the job and queue its answer; returns whether it was canceled
    async fn execute_job(self: Arc<Self>, request: Request, handle: String, detach: Arc<AtomicU8>) -> bool {
        let canceled = match self.ctx.executor.execute(&request, &self.cancel).await {
            Ok(execution) if execution.canceled => {
                info!(worker_id = %self.id, handle = %handle, host = %request.host_name, "canceled");
                true
            }
            Ok(execution) => {
                log_job(&self.id, "finished", &request, &handle, Some(&execution.answer));
                if !execution.answer.result_queue.is_empty() {
                    self.ctx.dispatcher.enqueue(execution.answer).await;
                }
                false
            }
            Err(e) if e.is_fatal() => {
                error!(worker_id = %self.id, handle = %handle, error = %e, "fatal error while executing check");
                self.ctx.state.report_fatal(e.to_string());
                true
            }
            Err(e) => {
                error!(worker_id = %self.id, handle = %handle, error = %e, "check execution failed");
                false
            }
        };

        self.active_jobs.fetch_sub(1, Ordering::AcqRel);
        if detach.swap(JOB_DONE, Ordering::AcqRel) == JOB_DETACHED {
            self.ctx.state.balloon_end();
        }
        canceled
    }
}

fn report_join_error(state: &PoolState, err: &JoinError) {
    if err.is_panic() {
        error!(error = %err, "job task panicked");
        state.report_fatal(format!("job task panicked: {}", err));
    }
}

fn log_job(worker_id: &str, prefix: &str, request: &Request, handle: &str, answer: Option<&Answer>) {
    let line = format!(
        "{} {:<7} - handle: {} - host: {:>20} - service: {}",
        prefix, request.job_type, handle, request.host_name, request.service_description
    );
    match answer {
        Some(answer) => debug!(
            worker_id = %worker_id,
            "{} (took: {:.3}s | rc: {} | exec: {})",
            line,
            answer.duration(),
            answer.return_code,
            answer.exec_kind
        ),
        None => debug!(worker_id = %worker_id, "{}", line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::pool::FixedProbe;
    use gearcheck_protocol::{EncryptionKey, JobType, PayloadCodec};
    use std::time::Instant;

    const GM: &str = "gm1:4730";

    fn context(broker: &MemoryBroker, config: WorkerConfig) -> WorkerContext {
        let broker: Arc<dyn Broker> = Arc::new(broker.clone());
        let codec = SharedCodec::new(config.codec().unwrap());
        let state = Arc::new(PoolState::new(&config.server));
        let dispatcher = Arc::new(ResultDispatcher::start_with_retry(
            &config,
            codec.clone(),
            broker.clone(),
            Duration::from_millis(10),
        ));
        WorkerContext {
            executor: Arc::new(Executor::new(config.exec_config())),
            admission: Admission::new(&config, Arc::new(FixedProbe::idle())),
            config: Arc::new(config),
            codec,
            broker,
            dispatcher,
            state,
            ballooning_capacity: 10,
            cancel: CancellationToken::new(),
            jobs: TaskTracker::new(),
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new(vec![GM.into()])
            .with_identifier("node1")
            .with_checks(true, true)
            .without_encryption()
    }

    fn job(command: &str) -> String {
        let request = Request::new(JobType::Service, command)
            .with_host("h1")
            .with_service("s1")
            .with_result_queue("check_results");
        PayloadCodec::plain().encode(request.to_text().as_bytes())
    }

    async fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !f() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    #[tokio::test]
    async fn test_executes_job_and_sends_result() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let ctx = context(&broker, config());
        let worker = Worker::start(ctx.clone(), WorkerRole::Check).await.unwrap();
        assert_eq!(broker.subscribers(GM, "host"), 1);
        assert_eq!(broker.subscribers(GM, "service"), 1);

        broker.submit(GM, "service", job("/bin/sh -c 'echo hi; exit 1'"));
        assert!(
            broker
                .wait_for_queued(GM, "check_results", 1, Duration::from_secs(5))
                .await
        );
        let payload = broker.drain(GM, "check_results").remove(0);
        let text = String::from_utf8(ctx.codec.current().decode(&payload).unwrap()).unwrap();
        assert!(text.contains("host_name=h1\n"), "{}", text);
        assert!(text.contains("return_code=1\n"), "{}", text);
        assert!(text.contains("output=hi"), "{}", text);

        assert!(wait_until(Duration::from_secs(2), || broker.completed(GM).len() == 1).await);
        assert_eq!(broker.completed(GM)[0].1, b"OK");
        assert_eq!(ctx.state.tasks(), 1);
        assert_eq!(worker.active_jobs(), 0);

        worker.shutdown();
        tokio::time::timeout(Duration::from_secs(2), worker.wait())
            .await
            .unwrap();
        assert_eq!(broker.subscribers(GM, "host"), 0);
    }

    #[tokio::test]
    async fn test_undecodable_job_fails() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let ctx = context(&broker, config());
        let worker = Worker::start(ctx.clone(), WorkerRole::Check).await.unwrap();

        broker.submit(GM, "host", "garbage");
        assert!(wait_until(Duration::from_secs(2), || broker.failed(GM).len() == 1).await);
        assert_eq!(ctx.state.tasks(), 0);
        assert_eq!(worker.active_jobs(), 0);
        worker.cancel();
    }

    #[tokio::test]
    async fn test_status_worker_answers() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let ctx = context(&broker, config());
        let worker = Worker::start(ctx, WorkerRole::Status).await.unwrap();
        assert_eq!(broker.subscribers(GM, "worker_node1"), 1);
        assert_eq!(broker.subscribers(GM, "host"), 0);

        broker.submit(GM, "worker_node1", "status");
        assert!(wait_until(Duration::from_secs(2), || broker.completed(GM).len() == 1).await);
        let reply = String::from_utf8(broker.completed(GM)[0].1.clone()).unwrap();
        assert!(reply.starts_with("node1 has 0 worker and is working on 0 jobs."), "{}", reply);
        worker.cancel();
    }

    #[tokio::test]
    async fn test_no_reachable_broker() {
        let broker = MemoryBroker::new();
        let ctx = context(&broker, config());

        // connect fails and marks the broker unreachable
        assert!(Worker::start(ctx.clone(), WorkerRole::Check).await.is_none());
        assert!(ctx.state.active_servers().is_empty());

        // nothing left to connect to
        broker.add_server(GM);
        assert!(Worker::start(ctx, WorkerRole::Check).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_marks_broker_and_stops_worker() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let ctx = context(&broker, config());
        let worker = Worker::start(ctx.clone(), WorkerRole::Check).await.unwrap();
        ctx.state.register(worker.clone());

        broker.set_reachable(GM, false);
        tokio::time::timeout(Duration::from_secs(2), worker.wait())
            .await
            .unwrap();
        assert!(ctx.state.active_servers().is_empty());
        assert_eq!(ctx.state.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_job() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let ctx = context(&broker, config());
        let worker = Worker::start(ctx.clone(), WorkerRole::Check).await.unwrap();

        broker.submit(GM, "host", job("/bin/sleep 30"));
        assert!(wait_until(Duration::from_secs(2), || worker.is_active()).await);

        worker.cancel();
        tokio::time::timeout(Duration::from_secs(10), worker.wait())
            .await
            .unwrap();
        assert!(wait_until(Duration::from_secs(10), || !worker.is_active()).await);
        assert!(broker.queued(GM, "check_results").is_empty());
        assert!(broker.completed(GM).is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_long_job_is_detached_when_pool_is_busy() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let config = config().with_backgrounding_threshold(Duration::from_secs(1));
        let ctx = context(&broker, config);
        ctx.state.set_load(1, 100);
        let worker = Worker::start(ctx.clone(), WorkerRole::Check).await.unwrap();

        broker.submit(GM, "service", job("/bin/sleep 3"));
        broker.submit(GM, "host", job("/bin/true"));

        // the sleep is reported done after the threshold, then the second job runs
        assert!(wait_until(Duration::from_secs(3), || broker.completed(GM).len() == 2).await);
        assert_eq!(ctx.state.ballooning(), 1);
        assert!(worker.is_active());

        assert!(
            broker
                .wait_for_queued(GM, "check_results", 2, Duration::from_secs(6))
                .await
        );
        assert!(wait_until(Duration::from_secs(2), || ctx.state.ballooning() == 0).await);
        assert_eq!(worker.active_jobs(), 0);
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_no_detach_below_utilization() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let config = config().with_backgrounding_threshold(Duration::from_secs(1));
        let ctx = context(&broker, config);
        let worker = Worker::start(ctx.clone(), WorkerRole::Check).await.unwrap();

        broker.submit(GM, "service", job("/bin/sleep 2"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(broker.completed(GM).is_empty());
        assert_eq!(ctx.state.ballooning(), 0);

        assert!(wait_until(Duration::from_secs(3), || broker.completed(GM).len() == 1).await);
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_connected_worker_uses_replaced_key() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let ctx = context(&broker, config().with_key("old"));
        let worker = Worker::start(ctx.clone(), WorkerRole::Check).await.unwrap();

        let rotated = PayloadCodec::encrypted(&EncryptionKey::from_secret("rotated"));
        ctx.codec.replace(rotated.clone());

        let request = Request::new(JobType::Host, "/bin/true")
            .with_host("h1")
            .with_result_queue("check_results");
        broker.submit(GM, "host", rotated.encode(request.to_text().as_bytes()));

        assert!(
            broker
                .wait_for_queued(GM, "check_results", 1, Duration::from_secs(5))
                .await
        );
        let payload = broker.drain(GM, "check_results").remove(0);
        let text = String::from_utf8(rotated.decode(&payload).unwrap()).unwrap();
        assert!(text.contains("host_name=h1\n"), "{}", text);
        assert!(broker.failed(GM).is_empty());
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_no_detach_without_ballooning_capacity() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let config = config().with_backgrounding_threshold(Duration::from_secs(1));
        let mut ctx = context(&broker, config);
        ctx.ballooning_capacity = 0;
        ctx.state.set_load(1, 100);
        let worker = Worker::start(ctx.clone(), WorkerRole::Check).await.unwrap();

        broker.submit(GM, "service", job("/bin/sleep 2"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(broker.completed(GM).is_empty());
        assert_eq!(ctx.state.ballooning(), 0);

        assert!(wait_until(Duration::from_secs(3), || broker.completed(GM).len() == 1).await);
        worker.shutdown();
    }
}
