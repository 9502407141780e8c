//! Passive result submission
//!
//! Hands check results produced outside the worker to the result queue,
//! encoded with the same codec the worker uses:
//!
//! ```text
//! --host/--message ─┐
//!                   ├─▶ PassiveResult ─▶ Answer ─encode─▶ SUBMIT_JOB_BG result_queue
//! stdin lines ──────┘
//! ```
//!
//! Delimited stdin lines are `host<d>service<d>return_code<d>output` for
//! service results and `host<d>return_code<d>output` for host results.

use std::sync::Arc;
use std::time::Duration;

use gearcheck_protocol::{now_epoch, Answer, CheckMode, JobType, PayloadCodec, Request};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::debug;

use crate::broker::{Broker, BrokerError, ClientConnection};
use crate::dispatch::submit;

/// Queue results go to unless told otherwise
pub const DEFAULT_RESULT_QUEUE: &str = "check_results";

/// Source recorded in submitted results
pub const SEND_SOURCE: &str = "gearcheck send";

#[derive(Debug, Error)]
pub enum SendError {
    /// A stdin line could not be parsed
    #[error("invalid data, {0}")]
    InvalidLine(String),

    /// Nothing arrived on stdin in time
    #[error("got no input after {0:?}, send plugin output to stdin or use --message/--host")]
    NoInput(Duration),

    #[error("reading stdin failed: {0}")]
    Io(#[from] std::io::Error),

    /// No broker accepted the result
    #[error("failed to send back result: {0}")]
    Broker(#[from] BrokerError),
}

pub type Result<T> = std::result::Result<T, SendError>;

/// One result to submit
#[derive(Debug, Clone, PartialEq)]
pub struct PassiveResult {
    pub host_name: String,
    /// Empty for host results
    pub service_description: String,
    pub return_code: i32,
    pub output: String,
    pub result_queue: String,
    /// Submit as an active check result
    pub active: bool,
    /// Unix time, 0 means now
    pub start_time: f64,
    /// Unix time, 0 means now
    pub finish_time: f64,
}

impl Default for PassiveResult {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            service_description: String::new(),
            return_code: 0,
            output: String::new(),
            result_queue: DEFAULT_RESULT_QUEUE.to_string(),
            active: false,
            start_time: 0.0,
            finish_time: 0.0,
        }
    }
}

impl PassiveResult {
    /// Fill host, service, return code and output from a delimited line
    ///
    /// Four or more fields make a service result; the output keeps any
    /// further delimiters.
    pub fn with_line(&self, line: &str, delimiter: &str) -> Result<Self> {
        let fields: Vec<&str> = line.splitn(4, delimiter).collect();
        let (host, service, rc, output) = match fields.as_slice() {
            [host, service, rc, output] => (*host, *service, *rc, *output),
            [host, rc, output] => (*host, "", *rc, *output),
            _ => {
                return Err(SendError::InvalidLine(format!(
                    "expected 3 or 4 fields: {}",
                    line
                )))
            }
        };
        if host.is_empty() {
            return Err(SendError::InvalidLine("no hostname parsed".into()));
        }
        let return_code = rc
            .trim()
            .parse()
            .map_err(|_| SendError::InvalidLine(format!("bad return code {:?}", rc)))?;

        Ok(Self {
            host_name: host.to_string(),
            service_description: service.to_string(),
            return_code,
            output: output.to_string(),
            ..self.clone()
        })
    }

    /// Build the answer; unset times become now
    pub fn to_answer(&self) -> Answer {
        let job_type = if self.service_description.is_empty() {
            JobType::Host
        } else {
            JobType::Service
        };
        let request = Request::new(job_type, "")
            .with_host(&self.host_name)
            .with_service(&self.service_description)
            .with_result_queue(&self.result_queue);

        let now = now_epoch();
        let mut answer = Answer::for_request(&request, SEND_SOURCE);
        answer.service_description = self.service_description.clone();
        answer.return_code = self.return_code;
        answer.output = self.output.clone();
        answer.mode = if self.active {
            CheckMode::Active
        } else {
            CheckMode::Passive
        };
        answer.start_time = if self.start_time > 0.0 { self.start_time } else { now };
        answer.finish_time = if self.finish_time > 0.0 { self.finish_time } else { now };
        answer
    }
}

/// Read the whole of `reader` as one plugin output
///
/// Fails when nothing at all arrives within `timeout`.
pub async fn read_message<R>(reader: &mut R, timeout: Duration) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    tokio::time::timeout(timeout, reader.read_to_end(&mut buf))
        .await
        .map_err(|_| SendError::NoInput(timeout))??;
    Ok(String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string())
}

/// Read the next delimited result line, `None` at the end of input
///
/// An empty line ends the input.
pub async fn read_line<R>(reader: &mut R, timeout: Duration) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = tokio::time::timeout(timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| SendError::NoInput(timeout))??;
    let line = line.trim_end_matches(['\r', '\n']);
    if n == 0 || line.is_empty() {
        return Ok(None);
    }
    Ok(Some(line.to_string()))
}

/// Submits results to the first broker that accepts them
///
/// The connection that last worked is kept for the next result.
pub struct ResultSender {
    servers: Vec<String>,
    codec: PayloadCodec,
    broker: Arc<dyn Broker>,
    client: Option<Box<dyn ClientConnection>>,
    sent: usize,
}

impl ResultSender {
    pub fn new(servers: Vec<String>, codec: PayloadCodec, broker: Arc<dyn Broker>) -> Self {
        Self {
            servers,
            codec,
            broker,
            client: None,
            sent: 0,
        }
    }

    /// Results submitted so far
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Submit one result and return the address that took it
    pub async fn send(&mut self, result: &PassiveResult) -> Result<String> {
        let answer = result.to_answer();
        let payload = self.codec.encode_answer(&answer);

        let mut last_err = BrokerError::protocol("no server configured");
        if let Some(conn) = self.client.as_mut() {
            match conn.submit_background(&answer.result_queue, &payload).await {
                Ok(_) => {
                    self.sent += 1;
                    return Ok(conn.address().to_string());
                }
                Err(e) => {
                    debug!(address = conn.address(), error = %e, "kept connection failed");
                    last_err = e;
                    self.client = None;
                }
            }
        }
        for address in &self.servers {
            debug!(address = %address, "connecting");
            match submit(address, &answer.result_queue, &payload, &*self.broker).await {
                Ok(conn) => {
                    self.client = Some(conn);
                    self.sent += 1;
                    return Ok(address.clone());
                }
                Err(e) => {
                    debug!(address = %address, error = %e, "connection failed");
                    last_err = e;
                }
            }
        }
        Err(last_err.into())
    }
}
