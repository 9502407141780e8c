//! In-memory broker
//!
//! Queues live in a shared map keyed by broker address. Servers can be
//! marked unreachable to exercise reconnect and restart paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;

use super::{Broker, BrokerError, ClientConnection, Job, Result, WorkerConnection};

struct ServerState {
    reachable: bool,
    /// Bumped whenever the server goes down; older connections are dead
    epoch: u64,
    queues: HashMap<String, VecDeque<Job>>,
    /// Connected workers per queue
    subscribers: HashMap<String, usize>,
    completed: Vec<(String, Vec<u8>)>,
    failed: Vec<String>,
    next_handle: u64,
    changed: watch::Sender<u64>,
}

impl ServerState {
    fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            reachable: true,
            epoch: 0,
            queues: HashMap::new(),
            subscribers: HashMap::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            next_handle: 0,
            changed,
        }
    }

    fn push(&mut self, address: &str, queue: &str, payload: Vec<u8>) -> String {
        self.next_handle += 1;
        let handle = format!("H:{}:{}", address, self.next_handle);
        self.queues.entry(queue.to_string()).or_default().push_back(Job {
            handle: handle.clone(),
            function: queue.to_string(),
            payload,
        });
        self.changed.send_modify(|v| *v += 1);
        handle
    }
}

/// In-process broker shared by all clones
#[derive(Clone, Default)]
pub struct MemoryBroker {
    servers: Arc<RwLock<HashMap<String, ServerState>>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("servers", &self.servers.read().len())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable server
    pub fn add_server(&self, address: &str) {
        self.servers
            .write()
            .entry(address.to_string())
            .or_insert_with(ServerState::new);
    }

    /// Take a server down or bring it back
    ///
    /// Going down breaks every open connection to it.
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let mut servers = self.servers.write();
        let server = servers
            .entry(address.to_string())
            .or_insert_with(ServerState::new);
        if server.reachable && !reachable {
            server.epoch += 1;
        }
        server.reachable = reachable;
        server.changed.send_modify(|v| *v += 1);
    }

    /// Queue a job, as a client would
    pub fn submit(&self, address: &str, queue: &str, payload: impl Into<Vec<u8>>) -> Option<String> {
        let mut servers = self.servers.write();
        let server = servers.get_mut(address)?;
        Some(server.push(address, queue, payload.into()))
    }

    /// Payloads waiting in a queue
    pub fn queued(&self, address: &str, queue: &str) -> Vec<Vec<u8>> {
        self.servers
            .read()
            .get(address)
            .and_then(|s| s.queues.get(queue))
            .map(|q| q.iter().map(|job| job.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove and return every payload waiting in a queue
    pub fn drain(&self, address: &str, queue: &str) -> Vec<Vec<u8>> {
        self.servers
            .write()
            .get_mut(address)
            .and_then(|s| s.queues.get_mut(queue))
            .map(|q| q.drain(..).map(|job| job.payload).collect())
            .unwrap_or_default()
    }

    /// Completions reported by workers, as `(handle, data)`
    pub fn completed(&self, address: &str) -> Vec<(String, Vec<u8>)> {
        self.servers
            .read()
            .get(address)
            .map(|s| s.completed.clone())
            .unwrap_or_default()
    }

    /// Handles of jobs reported as failed
    pub fn failed(&self, address: &str) -> Vec<String> {
        self.servers
            .read()
            .get(address)
            .map(|s| s.failed.clone())
            .unwrap_or_default()
    }

    /// Number of worker connections subscribed to a queue
    pub fn subscribers(&self, address: &str, queue: &str) -> usize {
        self.servers
            .read()
            .get(address)
            .and_then(|s| s.subscribers.get(queue).copied())
            .unwrap_or(0)
    }

    /// Wait until a queue holds at least `count` jobs
    pub async fn wait_for_queued(
        &self,
        address: &str,
        queue: &str,
        count: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queued(address, queue).len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn check_alive(&self, address: &str, epoch: u64) -> Result<()> {
        let servers = self.servers.read();
        match servers.get(address) {
            Some(s) if s.reachable && s.epoch == epoch => Ok(()),
            _ => Err(BrokerError::Disconnected(address.to_string())),
        }
    }
}

struct MemoryWorkerConnection {
    broker: MemoryBroker,
    address: String,
    queues: Vec<String>,
    epoch: u64,
    changed: watch::Receiver<u64>,
}

impl Drop for MemoryWorkerConnection {
    fn drop(&mut self) {
        let mut servers = self.broker.servers.write();
        if let Some(server) = servers.get_mut(&self.address) {
            for queue in &self.queues {
                if let Some(n) = server.subscribers.get_mut(queue) {
                    *n = n.saturating_sub(1);
                }
            }
        }
    }
}

#[async_trait]
impl WorkerConnection for MemoryWorkerConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn grab_job(&mut self) -> Result<Option<Job>> {
        self.broker.check_alive(&self.address, self.epoch)?;
        let mut servers = self.broker.servers.write();
        let Some(server) = servers.get_mut(&self.address) else {
            return Err(BrokerError::Disconnected(self.address.clone()));
        };
        for queue in &self.queues {
            if let Some(job) = server.queues.get_mut(queue).and_then(|q| q.pop_front()) {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn wait_for_job(&mut self) -> Result<()> {
        loop {
            self.changed.borrow_and_update();
            self.broker.check_alive(&self.address, self.epoch)?;
            let has_work = {
                let servers = self.broker.servers.read();
                servers.get(&self.address).is_some_and(|s| {
                    self.queues
                        .iter()
                        .any(|q| s.queues.get(q).is_some_and(|jobs| !jobs.is_empty()))
                })
            };
            if has_work {
                return Ok(());
            }
            if self.changed.changed().await.is_err() {
                return Err(BrokerError::Disconnected(self.address.clone()));
            }
        }
    }

    async fn complete(&mut self, handle: &str, data: &[u8]) -> Result<()> {
        self.broker.check_alive(&self.address, self.epoch)?;
        if let Some(server) = self.broker.servers.write().get_mut(&self.address) {
            server.completed.push((handle.to_string(), data.to_vec()));
            server.changed.send_modify(|v| *v += 1);
        }
        Ok(())
    }

    async fn fail(&mut self, handle: &str) -> Result<()> {
        self.broker.check_alive(&self.address, self.epoch)?;
        if let Some(server) = self.broker.servers.write().get_mut(&self.address) {
            server.failed.push(handle.to_string());
            server.changed.send_modify(|v| *v += 1);
        }
        Ok(())
    }
}

struct MemoryClientConnection {
    broker: MemoryBroker,
    address: String,
    epoch: u64,
}

#[async_trait]
impl ClientConnection for MemoryClientConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn submit_background(&mut self, queue: &str, payload: &[u8]) -> Result<String> {
        self.broker.check_alive(&self.address, self.epoch)?;
        self.broker
            .submit(&self.address, queue, payload)
            .ok_or_else(|| BrokerError::Disconnected(self.address.clone()))
    }

    async fn submit_job(&mut self, queue: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let mut changed = match self.broker.servers.read().get(&self.address) {
            Some(server) => server.changed.subscribe(),
            None => return Err(BrokerError::Disconnected(self.address.clone())),
        };
        let handle = self.submit_background(queue, payload).await?;
        loop {
            changed.borrow_and_update();
            self.broker.check_alive(&self.address, self.epoch)?;
            {
                let servers = self.broker.servers.read();
                if let Some(server) = servers.get(&self.address) {
                    if let Some((_, data)) = server.completed.iter().find(|(h, _)| *h == handle) {
                        return Ok(data.clone());
                    }
                    if server.failed.contains(&handle) {
                        return Err(BrokerError::protocol(format!("job {} failed", handle)));
                    }
                }
            }
            if changed.changed().await.is_err() {
                return Err(BrokerError::Disconnected(self.address.clone()));
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect_worker(
        &self,
        address: &str,
        _client_id: &str,
        queues: &[String],
    ) -> Result<Box<dyn WorkerConnection>> {
        let (epoch, changed) = {
            let mut servers = self.servers.write();
            let server = match servers.get_mut(address) {
                Some(s) if s.reachable => s,
                _ => return Err(BrokerError::connect(address, "connection refused")),
            };
            for queue in queues {
                *server.subscribers.entry(queue.clone()).or_default() += 1;
            }
            (server.epoch, server.changed.subscribe())
        };
        Ok(Box::new(MemoryWorkerConnection {
            broker: self.clone(),
            address: address.to_string(),
            queues: queues.to_vec(),
            epoch,
            changed,
        }))
    }

    async fn connect_client(&self, address: &str) -> Result<Box<dyn ClientConnection>> {
        let epoch = match self.servers.read().get(address) {
            Some(s) if s.reachable => s.epoch,
            _ => return Err(BrokerError::connect(address, "connection refused")),
        };
        Ok(Box::new(MemoryClientConnection {
            broker: self.clone(),
            address: address.to_string(),
            epoch,
        }))
    }

    async fn probe(&self, address: &str, _timeout: Duration) -> Result<()> {
        match self.servers.read().get(address) {
            Some(s) if s.reachable => Ok(()),
            _ => Err(BrokerError::connect(address, "connection refused")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GM: &str = "gm1:4730";

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        broker
    }

    #[tokio::test]
    async fn test_grab_in_subscription_order() {
        let broker = broker();
        broker.submit(GM, "service", "s1");
        broker.submit(GM, "host", "h1");
        broker.submit(GM, "other", "o1");

        let mut conn = broker
            .connect_worker(GM, "w", &["host".into(), "service".into()])
            .await
            .unwrap();
        assert_eq!(broker.subscribers(GM, "host"), 1);

        assert_eq!(conn.grab_job().await.unwrap().unwrap().payload, b"h1");
        assert_eq!(conn.grab_job().await.unwrap().unwrap().payload, b"s1");
        assert!(conn.grab_job().await.unwrap().is_none());
        assert_eq!(broker.queued(GM, "other").len(), 1);

        drop(conn);
        assert_eq!(broker.subscribers(GM, "host"), 0);
    }

    #[tokio::test]
    async fn test_wait_for_job_wakes_on_submit() {
        let broker = broker();
        let mut conn = broker
            .connect_worker(GM, "w", &["host".into()])
            .await
            .unwrap();

        let submitter = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            submitter.submit(GM, "host", "h1");
        });

        tokio::time::timeout(Duration::from_secs(2), conn.wait_for_job())
            .await
            .unwrap()
            .unwrap();
        assert!(conn.grab_job().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_breaks_connections() {
        let broker = broker();
        let mut conn = broker
            .connect_worker(GM, "w", &["host".into()])
            .await
            .unwrap();

        broker.set_reachable(GM, false);
        assert!(conn.grab_job().await.unwrap_err().is_disconnect());
        assert!(broker.connect_client(GM).await.is_err());
        assert!(broker.probe(GM, Duration::from_secs(1)).await.is_err());

        broker.set_reachable(GM, true);
        assert!(conn.grab_job().await.unwrap_err().is_disconnect());
        assert!(broker.probe(GM, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_job_returns_worker_reply() {
        let broker = broker();
        let mut worker = broker
            .connect_worker(GM, "w", &["worker_node1".into()])
            .await
            .unwrap();
        tokio::spawn(async move {
            worker.wait_for_job().await.unwrap();
            let job = worker.grab_job().await.unwrap().unwrap();
            assert_eq!(job.payload, b"check");
            worker.complete(&job.handle, b"node1 has 1 worker").await.unwrap();
        });

        let mut client = broker.connect_client(GM).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), client.submit_job("worker_node1", b"check"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"node1 has 1 worker");
    }

    #[tokio::test]
    async fn test_client_submit_and_complete() {
        let broker = broker();
        let mut client = broker.connect_client(GM).await.unwrap();
        client.submit_background("check_results", b"r1").await.unwrap();
        assert_eq!(broker.drain(GM, "check_results"), vec![b"r1".to_vec()]);

        let mut conn = broker.connect_worker(GM, "w", &[]).await.unwrap();
        conn.complete("H:1", b"OK").await.unwrap();
        assert_eq!(broker.completed(GM), vec![("H:1".to_string(), b"OK".to_vec())]);

        conn.fail("H:2").await.unwrap();
        assert_eq!(broker.failed(GM), vec!["H:2".to_string()]);
    }
}
