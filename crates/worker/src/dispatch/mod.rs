//! Result delivery
//!
//! ```text
//!                 ┌──▶ sender 1 ──┐
//! Worker ─enqueue─┼──▶ sender 2 ──┼──▶ first reachable primary broker
//!   │   (shared,  └──▶ sender N ──┘
//!   │    bounded)
//!   └─try_enqueue─▶ duplicate backlog per dupserver ──▶ duplicate broker
//! ```
//!
//! Primary senders keep their connection between results and retry the
//! whole server list once per second, giving up after
//! [`MAX_SEND_PASSES`] passes.

mod duplicate;

use std::sync::Arc;
use std::time::Duration;

use gearcheck_protocol::Answer;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::broker::{Broker, BrokerError, ClientConnection};
use crate::codec::SharedCodec;
use crate::config::WorkerConfig;

pub use duplicate::{duplicate_of, DuplicateSender};

/// Results queued before producers have to wait
pub const RESULT_QUEUE_SIZE: usize = 1000;

/// Full passes over the server list before a result is dropped
pub const MAX_SEND_PASSES: usize = 120;

/// Pass after which a failing delivery is logged as a warning
pub const WARN_AFTER_PASSES: usize = 30;

/// Pause between passes
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of delivering one result
#[derive(Debug)]
enum Delivery {
    Sent,
    Dropped(BrokerError),
    Terminated,
}

/// Shared result queue with its senders
pub struct ResultDispatcher {
    tx: mpsc::Sender<Answer>,
    duplicates: Vec<DuplicateSender>,
    dup_passive: bool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for ResultDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultDispatcher")
            .field("queued", &self.queued())
            .field("duplicates", &self.duplicates.len())
            .finish()
    }
}

impl ResultDispatcher {
    /// Start the senders for `config`
    ///
    /// Results are encoded with whatever `codec` holds at send time.
    pub fn start(config: &WorkerConfig, codec: SharedCodec, broker: Arc<dyn Broker>) -> Self {
        Self::start_with_retry(config, codec, broker, DEFAULT_RETRY_INTERVAL)
    }

    /// Start with a custom pause between delivery passes
    pub fn start_with_retry(
        config: &WorkerConfig,
        codec: SharedCodec,
        broker: Arc<dyn Broker>,
        retry_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(RESULT_QUEUE_SIZE);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let servers: Arc<[String]> = config.server.clone().into();

        let count = config.result_worker_count();
        debug!(count, servers = ?config.server, "creating result senders");
        for id in 0..count {
            tracker.spawn(run_sender(
                id,
                rx.clone(),
                servers.clone(),
                codec.clone(),
                broker.clone(),
                shutdown.clone(),
                retry_interval,
            ));
        }

        let duplicates = config
            .dupserver
            .iter()
            .map(|address| {
                DuplicateSender::spawn(
                    address,
                    config.dup_server_backlog_queue_size,
                    codec.clone(),
                    broker.clone(),
                    shutdown.clone(),
                    &tracker,
                    retry_interval,
                )
            })
            .collect();

        Self {
            tx,
            duplicates,
            dup_passive: config.dup_results_are_passive,
            shutdown,
            tracker,
        }
    }

    /// Queue a result for the primary brokers and every duplicate broker
    ///
    /// Waits while the shared queue is full; duplicates never wait.
    pub async fn enqueue(&self, answer: Answer) {
        for dup in &self.duplicates {
            dup.try_enqueue(duplicate_of(&answer, self.dup_passive));
        }
        if self.tx.send(answer).await.is_err() {
            warn!("result senders stopped, dropping result");
        }
    }

    /// Results waiting in the shared queue
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn duplicates(&self) -> &[DuplicateSender] {
        &self.duplicates
    }

    /// Log queue depths
    pub fn log_state(&self) {
        let backlogs: Vec<_> = self
            .duplicates
            .iter()
            .map(|d| format!("{}={}", d.address(), d.backlog()))
            .collect();
        info!(queued = self.queued(), duplicates = ?backlogs, "result dispatcher");
    }

    /// Wait up to `timeout` for the shared queue to empty
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.queued() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }

    /// Stop all senders and wait for them to exit
    #[instrument(skip(self))]
    pub async fn terminate(&self) {
        debug!("terminating result senders");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for ResultDispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_sender(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Answer>>>,
    servers: Arc<[String]>,
    codec: SharedCodec,
    broker: Arc<dyn Broker>,
    shutdown: CancellationToken,
    retry_interval: Duration,
) {
    let mut client: Option<Box<dyn ClientConnection>> = None;
    loop {
        let answer = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                answer = rx.recv() => answer,
            }
        };
        let Some(answer) = answer else {
            break;
        };

        let payload = codec.current().encode_answer(&answer);
        let delivery = send_result(
            &answer.result_queue,
            &payload,
            &servers,
            &*broker,
            &mut client,
            &shutdown,
            retry_interval,
        )
        .await;
        match delivery {
            Delivery::Sent => trace!(sender = id, host = %answer.host_name, "result sent"),
            Delivery::Dropped(e) => error!(
                sender = id,
                host = %answer.host_name,
                service = %answer.service_description,
                error = %e,
                "failed to send back result"
            ),
            Delivery::Terminated => break,
        }
    }
    debug!(sender = id, "result sender stopped");
}

async fn send_result(
    queue: &str,
    payload: &[u8],
    servers: &[String],
    broker: &dyn Broker,
    client: &mut Option<Box<dyn ClientConnection>>,
    shutdown: &CancellationToken,
    retry_interval: Duration,
) -> Delivery {
    let mut last_err = BrokerError::protocol("no server configured");
    for pass in 0..MAX_SEND_PASSES {
        // a kept connection goes first, then every server in order
        if let Some(conn) = client.as_mut() {
            match conn.submit_background(queue, payload).await {
                Ok(_) => return Delivery::Sent,
                Err(e) => {
                    last_err = e;
                    *client = None;
                }
            }
        }
        for address in servers {
            match submit(address, queue, payload, broker).await {
                Ok(conn) => {
                    *client = Some(conn);
                    return Delivery::Sent;
                }
                Err(e) => last_err = e,
            }
        }

        if pass == WARN_AFTER_PASSES {
            warn!(error = %last_err, "failed to send back result, will continue to retry for 2 minutes");
        } else {
            trace!(error = %last_err, pass, "still failing to send back result");
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Delivery::Terminated,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
    Delivery::Dropped(last_err)
}

/// Submit one payload to `address` on a fresh client connection
pub(crate) async fn submit(
    address: &str,
    queue: &str,
    payload: &[u8],
    broker: &dyn Broker,
) -> crate::broker::Result<Box<dyn ClientConnection>> {
    let mut conn = broker.connect_client(address).await?;
    conn.submit_background(queue, payload).await?;
    Ok(conn)
}
