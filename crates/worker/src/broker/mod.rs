//! Broker access
//!
//! The pool only talks to brokers through the traits in this module:
//!
//! ```text
//! Broker ──connect_worker──▶ WorkerConnection   (subscribe, grab, complete)
//!        ──connect_client──▶ ClientConnection   (job submission)
//!        ──probe───────────▶ reachability check
//! ```
//!
//! [`gearman::TcpBroker`] speaks the binary job protocol over TCP,
//! [`memory::MemoryBroker`] keeps queues in process for tests.

pub mod admin;
pub mod gearman;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use gearcheck_protocol::ProtocolError;
use thiserror::Error;

pub use gearman::TcpBroker;
pub use memory::MemoryBroker;

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not reach the broker
    #[error("connect to {address} failed: {message}")]
    Connect { address: String, message: String },

    /// The broker closed the connection
    #[error("disconnected from {0}")]
    Disconnected(String),

    /// The broker sent something unexpected or an error packet
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No answer in time
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    pub fn connect(address: impl Into<String>, message: impl ToString) -> Self {
        BrokerError::Connect {
            address: address.into(),
            message: message.to_string(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BrokerError::Protocol(msg.into())
    }

    /// True when the peer went away and the connection cannot be reused
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BrokerError::Disconnected(_))
    }
}

impl From<ProtocolError> for BrokerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => BrokerError::Io(e),
            other => BrokerError::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// A job handed out by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Broker assigned handle, used for completion and logging
    pub handle: String,
    /// Queue the job was submitted to
    pub function: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

/// Connection used by a worker to receive jobs from one broker
#[async_trait]
pub trait WorkerConnection: Send {
    /// Broker address this connection belongs to
    fn address(&self) -> &str;

    /// Ask for a job, `None` when every subscribed queue is empty
    async fn grab_job(&mut self) -> Result<Option<Job>>;

    /// Wait until the broker signals that new work may be available
    async fn wait_for_job(&mut self) -> Result<()>;

    /// Report a job as done
    async fn complete(&mut self, handle: &str, data: &[u8]) -> Result<()>;

    /// Report a job as failed
    async fn fail(&mut self, handle: &str) -> Result<()>;
}

/// Connection used to submit background jobs
#[async_trait]
pub trait ClientConnection: Send {
    fn address(&self) -> &str;

    /// Submit a background job and return its handle
    async fn submit_background(&mut self, queue: &str, payload: &[u8]) -> Result<String>;

    /// Submit a job and wait for the worker's reply
    async fn submit_job(&mut self, queue: &str, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Factory for broker connections
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a worker connection subscribed to `queues`
    async fn connect_worker(
        &self,
        address: &str,
        client_id: &str,
        queues: &[String],
    ) -> Result<Box<dyn WorkerConnection>>;

    /// Open a client connection
    async fn connect_client(&self, address: &str) -> Result<Box<dyn ClientConnection>>;

    /// Check that the broker accepts connections
    async fn probe(&self, address: &str, timeout: Duration) -> Result<()>;
}
