//! Interpreter daemon lifecycle and the per-check socket protocol
//!
//! ```text
//!  start ──spawn p1 [-c] [-v|-vv] <socket>──▶ daemon
//!    │                                          │ stdout → debug log
//!    │ poll for socket (50ms, up to 5s)         │ stderr → error log
//!    ▼                                          │ (crash patterns → restart)
//!  current ◀── check_restart: old daemon retires with a grace period
//!    │
//!  execute: connect (15 retries) ─ write JSON line ─ read to EOF ─ parse
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EpnConfig;
use crate::error::{ExecError, Result};

/// How long the daemon may take to create its socket
pub const START_TIMEOUT: Duration = Duration::from_secs(5);

const START_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_CONNECT_RETRIES: u32 = 15;
const SOCKET_REMOVE_DELAY: Duration = Duration::from_secs(1);

/// Output fragments that mean the interpreter is in a broken state
pub const RESTART_PATTERNS: [&str; 4] = [
    "Attempt to free nonexistent shared string",
    ", Perl interpreter: ",
    "**ePN: invalid request:",
    "gearcheck_epn.pl line ",
];

fn matches_restart_pattern(text: &str) -> Option<&'static str> {
    RESTART_PATTERNS.iter().copied().find(|p| text.contains(p))
}

/// Request line sent to the daemon
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpnRequest {
    pub bin: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: i64,
}

/// Response written by the daemon before it closes the connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EpnResponse {
    pub rc: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub run_duration: f64,
    #[serde(default)]
    pub compile_duration: f64,
    #[serde(default)]
    pub cpu_user: f64,
}

/// Result of one check run in the daemon
#[derive(Debug, Clone, PartialEq)]
pub enum EpnOutcome {
    Finished { response: EpnResponse, timed_out: bool },
    /// Job canceled, or the daemon reported a crash signature
    Canceled,
}

struct EpnDaemon {
    pid: u32,
    socket: PathBuf,
    exited: CancellationToken,
}

impl EpnDaemon {
    fn remove_socket(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(socket = %self.socket.display(), error = %e, "cannot remove socket");
            }
        }
    }

    fn interrupt(&self) {
        if self.exited.is_cancelled() {
            return;
        }
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGINT) {
            debug!(pid = self.pid, error = %e, "cannot interrupt daemon");
        }
    }

    /// Stop now, or after `grace` so running checks can finish
    fn stop(self: &Arc<Self>, grace: Duration) {
        if grace.is_zero() || self.exited.is_cancelled() {
            self.remove_socket();
            self.interrupt();
            debug!(pid = self.pid, "interpreter daemon shutdown complete");
            return;
        }

        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = daemon.exited.cancelled() => {}
                _ = tokio::time::sleep(SOCKET_REMOVE_DELAY) => daemon.remove_socket(),
            }
            tokio::select! {
                _ = daemon.exited.cancelled() => {}
                _ = tokio::time::sleep(grace) => daemon.interrupt(),
            }
            daemon.remove_socket();
            debug!(pid = daemon.pid, "interpreter daemon shutdown complete");
        });
    }
}

struct Inner {
    current: Option<Arc<EpnDaemon>>,
    retiring: Vec<Arc<EpnDaemon>>,
    started_at: Instant,
    generation: u64,
}

/// Keeps at most one interpreter daemon alive and talks to it
pub struct EpnSupervisor {
    config: EpnConfig,
    restart: Arc<AtomicBool>,
    inner: Mutex<Inner>,
    retry_interval: Duration,
}

impl EpnSupervisor {
    pub fn new(config: EpnConfig) -> Self {
        Self {
            config,
            restart: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(Inner {
                current: None,
                retiring: Vec::new(),
                started_at: Instant::now(),
                generation: 0,
            }),
            retry_interval: Duration::from_secs(1),
        }
    }

    /// Pause between connection attempts
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Socket of the daemon currently accepting checks
    pub fn socket(&self) -> Option<PathBuf> {
        self.inner.lock().current.as_ref().map(|d| d.socket.clone())
    }

    /// Mark the daemon for replacement on the next [`check_restart`](Self::check_restart)
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    fn daemon_args(&self, socket: &std::path::Path) -> Vec<String> {
        let mut args = Vec::new();
        if self.config.use_cache {
            args.push("-c".to_string());
        }
        match self.config.verbosity {
            0 => {}
            1 => args.push("-v".to_string()),
            _ => args.push("-vv".to_string()),
        }
        args.push(socket.to_string_lossy().into_owned());
        args
    }

    /// Start a new daemon and make it the target for new checks
    pub async fn start(&self) -> Result<()> {
        let socket = std::env::temp_dir().join(format!("gearcheck_epn_{}.socket", Uuid::now_v7()));
        let args = self.daemon_args(&socket);
        debug!(p1_file = %self.config.p1_file.display(), ?args, "starting interpreter daemon");

        let mut child = Command::new(&self.config.p1_file)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                ExecError::epn_startup(format!(
                    "failed to start {}: {}",
                    self.config.p1_file.display(),
                    e
                ))
            })?;

        let daemon = Arc::new(EpnDaemon {
            pid: child.id().unwrap_or_default(),
            socket,
            exited: CancellationToken::new(),
        });

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(passthrough_logs(stdout, false, Arc::clone(&self.restart)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(passthrough_logs(stderr, true, Arc::clone(&self.restart)));
        }

        let watched = Arc::clone(&daemon);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    error!(pid = watched.pid, %status, "interpreter daemon exited")
                }
                Ok(_) => debug!(pid = watched.pid, "interpreter daemon exited"),
                Err(e) => error!(pid = watched.pid, error = %e, "interpreter daemon errored"),
            }
            watched.exited.cancel();
            watched.remove_socket();
        });

        let deadline = Instant::now() + START_TIMEOUT;
        while !daemon.socket.exists() {
            if daemon.exited.is_cancelled() || Instant::now() >= deadline {
                daemon.stop(Duration::ZERO);
                return Err(ExecError::epn_startup(format!(
                    "timeout ({}s) while waiting for socket {}",
                    START_TIMEOUT.as_secs(),
                    daemon.socket.display()
                )));
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }

        info!(pid = daemon.pid, socket = %daemon.socket.display(), "interpreter daemon started");
        let mut inner = self.inner.lock();
        if let Some(old) = inner.current.replace(daemon) {
            old.stop(self.config.restart_grace);
            inner.retiring.push(old);
        }
        inner.retiring.retain(|d| !d.exited.is_cancelled());
        inner.started_at = Instant::now();
        inner.generation += 1;
        self.restart.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Replace the daemon if a restart was requested
    pub async fn check_restart(&self) -> Result<()> {
        if !self.restart.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        warn!("restarting interpreter daemon");
        {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.current.take() {
                old.stop(self.config.restart_grace);
                inner.retiring.push(old);
            }
        }
        self.start().await
    }

    /// Stop the current and all retiring daemons without grace
    pub fn stop_all(&self) {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.current.take() {
            current.stop(Duration::ZERO);
        }
        for daemon in inner.retiring.drain(..) {
            daemon.stop(Duration::ZERO);
        }
    }

    /// Run one check in the daemon
    pub async fn execute(&self, request: &EpnRequest, cancel: &CancellationToken) -> Result<EpnOutcome> {
        let mut line = serde_json::to_vec(request).map_err(|e| ExecError::epn(format!("json error: {}", e)))?;
        line.push(b'\n');

        let mut stream = tokio::select! {
            stream = self.connect() => stream?,
            _ = cancel.cancelled() => return Ok(EpnOutcome::Canceled),
        };
        stream
            .write_all(&line)
            .await
            .map_err(|e| ExecError::epn(format!("sending to daemon failed: {}", e)))?;

        let deadline = Instant::now() + Duration::from_secs(request.timeout.max(0) as u64);
        let mut buf = Vec::new();
        tokio::select! {
            read = stream.read_to_end(&mut buf) => {
                read.map_err(|e| ExecError::epn(format!("reading daemon response failed: {}", e)))?;
            }
            _ = cancel.cancelled() => {
                debug!(bin = %request.bin, "closing daemon connection");
                return Ok(EpnOutcome::Canceled);
            }
        }
        let timed_out = Instant::now() > deadline;

        if buf.is_empty() {
            return Err(ExecError::epn("zero sized result, daemon closed connection"));
        }
        let response: EpnResponse = serde_json::from_slice(&buf)
            .map_err(|e| ExecError::epn(format!("json unpacking failed: {}", e)))?;

        if let Some(pattern) = matches_restart_pattern(&response.stdout) {
            error!(pattern, output = %response.stdout, "found interpreter error, triggering daemon restart");
            self.request_restart();
            return Ok(EpnOutcome::Canceled);
        }

        Ok(EpnOutcome::Finished { response, timed_out })
    }

    async fn connect(&self) -> Result<UnixStream> {
        let mut retries = 0;
        loop {
            let (socket, generation, started_at) = {
                let inner = self.inner.lock();
                (
                    inner.current.as_ref().map(|d| d.socket.clone()),
                    inner.generation,
                    inner.started_at,
                )
            };

            let err = match socket {
                Some(socket) => match UnixStream::connect(&socket).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => e.to_string(),
                },
                None => "no socket exists".to_string(),
            };

            if retries == 0 {
                warn!(retry = retries, error = %err, "connecting to interpreter daemon failed");
            } else {
                debug!(retry = retries, error = %err, "connecting to interpreter daemon failed");
            }
            retries += 1;
            if retries > MAX_CONNECT_RETRIES {
                return Err(ExecError::epn(format!("socket connect failed: {}", err)));
            }

            tokio::time::sleep(self.retry_interval).await;

            let same_daemon = self.inner.lock().generation == generation;
            if retries % 3 == 0 && same_daemon && started_at.elapsed() > START_TIMEOUT {
                debug!("daemon unreachable, requesting restart");
                self.request_restart();
            }
        }
    }
}

impl std::fmt::Debug for EpnSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpnSupervisor")
            .field("p1_file", &self.config.p1_file)
            .field("socket", &self.socket())
            .field("restart", &self.restart_requested())
            .finish()
    }
}

async fn passthrough_logs<R: AsyncRead + Unpin>(pipe: R, is_stderr: bool, restart: Arc<AtomicBool>) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.is_empty() {
            if is_stderr {
                error!(target: "gearcheck_exec::epn::daemon", "{}", line);
            } else {
                debug!(target: "gearcheck_exec::epn::daemon", "{}", line);
            }
        }
        if matches_restart_pattern(&line).is_some() {
            error!("found interpreter error, triggering daemon restart");
            restart.store(true, Ordering::SeqCst);
        }
    }
}
