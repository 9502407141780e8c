//! Best-effort copies of results for secondary brokers
//!
//! Every duplicate broker gets its own bounded backlog and sender task.
//! Enqueueing never blocks: a full backlog drops the result.

use std::sync::Arc;
use std::time::Duration;

use gearcheck_protocol::{Answer, CheckMode, PayloadCodec};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::broker::{Broker, ClientConnection};
use crate::codec::SharedCodec;

/// Backlog and sender for one duplicate broker
#[derive(Debug, Clone)]
pub struct DuplicateSender {
    address: String,
    tx: mpsc::Sender<Answer>,
}

impl DuplicateSender {
    /// Start the sender task for `address`
    pub fn spawn(
        address: &str,
        backlog: usize,
        codec: SharedCodec,
        broker: Arc<dyn Broker>,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
        retry_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        debug!(address, backlog, "creating duplicate result sender");
        tracker.spawn(run_sender(
            address.to_string(),
            rx,
            codec,
            broker,
            shutdown,
            retry_interval,
        ));
        Self {
            address: address.to_string(),
            tx,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Results waiting in the backlog
    pub fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Queue a copy without waiting; false when it was dropped
    pub fn try_enqueue(&self, answer: Answer) -> bool {
        match self.tx.try_send(answer) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(answer)) => {
                warn!(
                    address = %self.address,
                    host = %answer.host_name,
                    service = %answer.service_description,
                    "duplicate result backlog full, dropping result"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(address = %self.address, "duplicate sender stopped, dropping result");
                false
            }
        }
    }
}

async fn run_sender(
    address: String,
    mut rx: mpsc::Receiver<Answer>,
    codec: SharedCodec,
    broker: Arc<dyn Broker>,
    shutdown: CancellationToken,
    retry_interval: Duration,
) {
    let mut client: Option<Box<dyn ClientConnection>> = None;
    loop {
        let answer = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            answer = rx.recv() => match answer {
                Some(answer) => answer,
                None => break,
            },
        };

        if let Err(e) = send_once(&address, &answer, &codec.current(), &*broker, &mut client).await {
            debug!(address = %address, error = %e, "failed to send back result (to dupserver)");
            client = None;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(retry_interval) => {}
            }
        }
    }
    debug!(address = %address, "duplicate sender stopped");
}

async fn send_once(
    address: &str,
    answer: &Answer,
    codec: &PayloadCodec,
    broker: &dyn Broker,
    client: &mut Option<Box<dyn ClientConnection>>,
) -> crate::broker::Result<()> {
    if client.is_none() {
        *client = Some(broker.connect_client(address).await?);
    }
    if let Some(conn) = client.as_mut() {
        conn.submit_background(&answer.result_queue, &codec.encode_answer(answer))
            .await?;
    }
    Ok(())
}

/// Prepare a result for duplicate delivery
pub fn duplicate_of(answer: &Answer, passive: bool) -> Answer {
    let mut copy = answer.clone();
    if passive {
        copy.mode = CheckMode::Passive;
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use gearcheck_protocol::{JobType, Request};

    const DUP: &str = "dup:4730";

    fn answer(host: &str) -> Answer {
        let request = Request::new(JobType::Host, "true")
            .with_host(host)
            .with_result_queue("check_results");
        Answer::for_request(&request, "test")
    }

    #[test]
    fn test_duplicate_of_passive() {
        let a = answer("h1");
        assert_eq!(duplicate_of(&a, true).mode, CheckMode::Passive);
        assert_eq!(duplicate_of(&a, false).mode, CheckMode::Active);
    }

    #[test_log::test(tokio::test)]
    async fn test_full_backlog_drops_without_blocking() {
        // no server registered: the sender fails and sleeps, so the backlog fills
        let broker = MemoryBroker::new();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let sender = DuplicateSender::spawn(
            DUP,
            2,
            PayloadCodec::plain().into(),
            Arc::new(broker),
            shutdown.clone(),
            &tracker,
            Duration::from_secs(60),
        );

        let mut accepted = 0;
        for i in 0..10 {
            if sender.try_enqueue(answer(&format!("h{}", i))) {
                accepted += 1;
            }
        }
        // one result is in flight, two wait in the backlog
        assert!(accepted <= 3, "accepted {}", accepted);
        assert!(accepted >= 2, "accepted {}", accepted);

        shutdown.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delivers_to_duplicate_broker() {
        let broker = MemoryBroker::new();
        broker.add_server(DUP);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let sender = DuplicateSender::spawn(
            DUP,
            10,
            PayloadCodec::plain().into(),
            Arc::new(broker.clone()),
            shutdown.clone(),
            &tracker,
            Duration::from_millis(10),
        );

        assert!(sender.try_enqueue(duplicate_of(&answer("h1"), true)));
        assert!(
            broker
                .wait_for_queued(DUP, "check_results", 1, Duration::from_secs(2))
                .await
        );
        let payload = broker.drain(DUP, "check_results").remove(0);
        let text = String::from_utf8(PayloadCodec::plain().decode(&payload).unwrap()).unwrap();
        assert!(text.starts_with("type=passive\nhost_name=h1\n"), "{}", text);

        shutdown.cancel();
    }
}
