//! Binary job protocol over TCP
//!
//! Worker side:
//!
//! ```text
//! SET_CLIENT_ID, CAN_DO xN
//! loop:
//!   GRAB_JOB ──▶ JOB_ASSIGN (handle, queue, payload) ──▶ ... ──▶ WORK_COMPLETE
//!            └─▶ NO_JOB ──▶ PRE_SLEEP ──▶ (wait) NOOP
//! ```
//!
//! Client side: `SUBMIT_JOB_BG` answered by `JOB_CREATED`, or `SUBMIT_JOB`
//! answered by `JOB_CREATED` and later `WORK_COMPLETE` / `WORK_FAIL`.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use gearcheck_protocol::{Packet, PacketType, ProtocolError};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use super::{Broker, BrokerError, ClientConnection, Job, Result, WorkerConnection};

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP broker factory
#[derive(Debug, Clone)]
pub struct TcpBroker {
    connect_timeout: Duration,
}

impl Default for TcpBroker {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TcpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

async fn dial(address: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(BrokerError::connect(address, e)),
        Err(_) => Err(BrokerError::connect(
            address,
            format!("timeout after {:?}", timeout),
        )),
    }
}

/// One framed connection to a broker
struct Conn {
    address: String,
    stream: TcpStream,
}

impl Conn {
    async fn send(&mut self, kind: PacketType, args: &[&[u8]]) -> Result<()> {
        Packet::request(kind, args)
            .write_to(&mut self.stream)
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn recv(&mut self) -> Result<Packet> {
        Packet::read_from(&mut self.stream)
            .await
            .map_err(|e| self.map_err(e))
    }

    fn map_err(&self, err: ProtocolError) -> BrokerError {
        match err {
            ProtocolError::Io(e)
                if matches!(
                    e.kind(),
                    ErrorKind::UnexpectedEof
                        | ErrorKind::ConnectionReset
                        | ErrorKind::BrokenPipe
                        | ErrorKind::ConnectionAborted
                ) =>
            {
                BrokerError::Disconnected(self.address.clone())
            }
            other => other.into(),
        }
    }
}

fn error_packet(packet: &Packet) -> BrokerError {
    let args = packet.args(2);
    let text = args
        .iter()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect::<Vec<_>>()
        .join(": ");
    BrokerError::protocol(format!("broker error: {}", text))
}

fn unexpected(packet: &Packet) -> BrokerError {
    BrokerError::protocol(format!("unexpected packet {:?}", packet.kind))
}

/// Worker connection to one broker
pub struct TcpWorkerConnection {
    conn: Conn,
}

#[async_trait]
impl WorkerConnection for TcpWorkerConnection {
    fn address(&self) -> &str {
        &self.conn.address
    }

    async fn grab_job(&mut self) -> Result<Option<Job>> {
        self.conn.send(PacketType::GrabJob, &[]).await?;
        loop {
            let packet = self.conn.recv().await?;
            match packet.kind {
                PacketType::Noop => continue,
                PacketType::NoJob => return Ok(None),
                PacketType::JobAssign => {
                    let args = packet.args(3);
                    if args.len() < 3 {
                        return Err(BrokerError::protocol("short JOB_ASSIGN packet"));
                    }
                    return Ok(Some(Job {
                        handle: String::from_utf8_lossy(args[0]).into_owned(),
                        function: String::from_utf8_lossy(args[1]).into_owned(),
                        payload: args[2].to_vec(),
                    }));
                }
                PacketType::Error => return Err(error_packet(&packet)),
                _ => return Err(unexpected(&packet)),
            }
        }
    }

    async fn wait_for_job(&mut self) -> Result<()> {
        self.conn.send(PacketType::PreSleep, &[]).await?;
        loop {
            let packet = self.conn.recv().await?;
            match packet.kind {
                PacketType::Noop => return Ok(()),
                PacketType::Error => return Err(error_packet(&packet)),
                _ => debug!(kind = ?packet.kind, "ignoring packet while sleeping"),
            }
        }
    }

    async fn complete(&mut self, handle: &str, data: &[u8]) -> Result<()> {
        self.conn
            .send(PacketType::WorkComplete, &[handle.as_bytes(), data])
            .await
    }

    async fn fail(&mut self, handle: &str) -> Result<()> {
        self.conn.send(PacketType::WorkFail, &[handle.as_bytes()]).await
    }
}

/// Client connection to one broker
pub struct TcpClientConnection {
    conn: Conn,
}

#[async_trait]
impl ClientConnection for TcpClientConnection {
    fn address(&self) -> &str {
        &self.conn.address
    }

    async fn submit_background(&mut self, queue: &str, payload: &[u8]) -> Result<String> {
        self.submit(PacketType::SubmitJobBg, queue, payload).await
    }

    async fn submit_job(&mut self, queue: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let handle = self.submit(PacketType::SubmitJob, queue, payload).await?;
        loop {
            let packet = self.conn.recv().await?;
            match packet.kind {
                PacketType::WorkComplete => {
                    let args = packet.args(2);
                    if args.first().copied() != Some(handle.as_bytes()) {
                        debug!(handle, "ignoring completion of another job");
                        continue;
                    }
                    return Ok(args.get(1).map(|data| data.to_vec()).unwrap_or_default());
                }
                PacketType::WorkFail => {
                    return Err(BrokerError::protocol(format!("job {} failed", handle)))
                }
                PacketType::WorkStatus | PacketType::Noop => continue,
                PacketType::Error => return Err(error_packet(&packet)),
                _ => return Err(unexpected(&packet)),
            }
        }
    }
}

impl TcpClientConnection {
    /// Send a submit packet and return the handle from `JOB_CREATED`
    async fn submit(&mut self, kind: PacketType, queue: &str, payload: &[u8]) -> Result<String> {
        let unique = Uuid::now_v7().to_string();
        self.conn
            .send(kind, &[queue.as_bytes(), unique.as_bytes(), payload])
            .await?;
        loop {
            let packet = self.conn.recv().await?;
            match packet.kind {
                PacketType::JobCreated => {
                    return Ok(String::from_utf8_lossy(&packet.data).into_owned())
                }
                PacketType::Noop => continue,
                PacketType::Error => return Err(error_packet(&packet)),
                _ => return Err(unexpected(&packet)),
            }
        }
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn connect_worker(
        &self,
        address: &str,
        client_id: &str,
        queues: &[String],
    ) -> Result<Box<dyn WorkerConnection>> {
        let stream = dial(address, self.connect_timeout).await?;
        let mut conn = Conn {
            address: address.to_string(),
            stream,
        };
        conn.send(PacketType::SetClientId, &[client_id.as_bytes()])
            .await?;
        for queue in queues {
            conn.send(PacketType::CanDo, &[queue.as_bytes()]).await?;
        }
        debug!(address, client_id, queues = ?queues, "worker connected");
        Ok(Box::new(TcpWorkerConnection { conn }))
    }

    async fn connect_client(&self, address: &str) -> Result<Box<dyn ClientConnection>> {
        let stream = dial(address, self.connect_timeout).await?;
        Ok(Box::new(TcpClientConnection {
            conn: Conn {
                address: address.to_string(),
                stream,
            },
        }))
    }

    async fn probe(&self, address: &str, timeout: Duration) -> Result<()> {
        dial(address, timeout).await.map(drop)
    }
}
