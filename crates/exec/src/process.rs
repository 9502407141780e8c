//! Child process execution
//!
//! Plugins run in their own process group so that signals aimed at the
//! worker are not forwarded and a timeout can take down everything the
//! plugin forked.
//!
//! ```text
//!            spawn (setpgid 0)
//!                  │
//!   ┌──────────────┼─────────────────────┐
//!   │ exit         │ deadline            │ cancel
//!   ▼              ▼                     ▼
//! Finished   TERM ─1s─ INT ─1s─ KILL   KILL (group)
//!            (stops once reaped)          │
//!                  │                      ▼
//!                  ▼                   Canceled
//!               TimedOut
//! ```

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::signal::{killpg, Signal};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::command::ResolvedCommand;
use crate::output::Termination;

/// Pause between escalation steps after a timeout
pub const KILL_STEP: Duration = Duration::from_secs(1);

/// Held while reaping, so a child's CPU times are the change in
/// `RUSAGE_CHILDREN` across its own reap
static REAP_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// What a finished child left behind
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// User CPU seconds
    pub user_time: f64,
    /// System CPU seconds
    pub sys_time: f64,
}

/// How a run ended
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Finished(ProcessOutput),
    /// Deadline fired; holds whatever the plugin wrote before dying
    TimedOut(ProcessOutput),
    Canceled,
}

/// Run a resolved command until it exits, times out or is canceled
///
/// Spawn failures are returned unchanged so the caller can tell a missing
/// binary from resource exhaustion.
pub async fn run_process(
    command: &ResolvedCommand,
    timeout: Duration,
    cancel: &CancellationToken,
) -> io::Result<ProcessOutcome> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let pid = child.id() as i32;
    trace!(pid, program = %command.program, "spawned plugin");

    let stdout = child.stdout.take().map(ChildStdout::from_std).transpose()?;
    let stderr = child.stderr.take().map(ChildStderr::from_std).transpose()?;
    // The std handle is only used for its pipes; reaping happens in wait_child
    drop(child);

    let collect = async move {
        let wait = tokio::task::spawn_blocking(move || wait_child(pid));
        let (status, out, err) = tokio::join!(wait, read_pipe(stdout), read_pipe(stderr));
        let (status, user_time, sys_time) = status.map_err(io::Error::other)??;
        Ok::<_, io::Error>(ProcessOutput {
            termination: termination(status),
            stdout: out,
            stderr: err,
            user_time,
            sys_time,
        })
    };
    tokio::pin!(collect);

    tokio::select! {
        output = &mut collect => Ok(ProcessOutcome::Finished(output?)),
        _ = tokio::time::sleep(timeout) => {
            debug!(pid, timeout_secs = timeout.as_secs(), "plugin timed out, killing process group");
            let reaped = CancellationToken::new();
            tokio::spawn(escalate_kill(pid, reaped.clone()));
            let output = collect.await;
            reaped.cancel();
            Ok(ProcessOutcome::TimedOut(output?))
        }
        _ = cancel.cancelled() => {
            debug!(pid, "plugin canceled, killing process group");
            signal_group(pid, Signal::SIGKILL);
            let _ = collect.await;
            Ok(ProcessOutcome::Canceled)
        }
    }
}

/// TERM, then INT, then KILL, each a second apart, until the child is reaped
async fn escalate_kill(pid: i32, reaped: CancellationToken) {
    for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGKILL] {
        if reaped.is_cancelled() {
            return;
        }
        signal_group(pid, signal);
        tokio::select! {
            _ = reaped.cancelled() => return,
            _ = tokio::time::sleep(KILL_STEP) => {}
        }
    }
}

fn signal_group(pid: i32, signal: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        trace!(pid, signal = %signal, error = %e, "cannot signal process group");
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "reading plugin output failed");
        }
    }
    buf
}

/// Block until the child exits, then reap it and measure its CPU times
fn wait_child(pid: i32) -> io::Result<(WaitStatus, f64, f64)> {
    let pid = Pid::from_raw(pid);
    // leaves the exited child in place until the lock is held
    retry_interrupted(|| waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT))?;

    let _reaping = REAP_LOCK.lock();
    let before = getrusage(UsageWho::RUSAGE_CHILDREN)?;
    let status = retry_interrupted(|| waitpid(pid, None))?;
    let after = getrusage(UsageWho::RUSAGE_CHILDREN)?;

    let user = seconds(after.user_time()) - seconds(before.user_time());
    let sys = seconds(after.system_time()) - seconds(before.system_time());
    Ok((status, user.max(0.0), sys.max(0.0)))
}

fn retry_interrupted<T>(mut call: impl FnMut() -> nix::Result<T>) -> io::Result<T> {
    loop {
        match call() {
            Err(Errno::EINTR) => continue,
            result => return result.map_err(io::Error::from),
        }
    }
}

fn seconds(tv: TimeVal) -> f64 {
    tv.tv_sec() as f64 + tv.tv_usec() as f64 / 1_000_000.0
}

fn termination(status: WaitStatus) -> Termination {
    match status {
        WaitStatus::Exited(_, code) => Termination::Exited(code),
        WaitStatus::Signaled(_, signal, _) => Termination::Signaled(signal as i32),
        other => {
            debug!(status = ?other, "unexpected wait status");
            Termination::Exited(3)
        }
    }
}
