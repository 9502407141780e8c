//! Job execution
//!
//! [`Executor::execute`] turns a [`Request`] into an [`Answer`]:
//!
//! 1. jobs older than `max_age` are answered without running anything
//! 2. commands outside `restrict_path` are refused
//! 3. the command line is resolved and run as shell, exec, embedded
//!    interpreter or internal check
//! 4. timeouts and negate remapping are applied to the result

use std::io;
use std::sync::Arc;
use std::time::Duration;

use gearcheck_protocol::{escape_newlines, now_epoch, Answer, ExecKind, Request};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::command::{CommandResolver, ExecType, ResolvedCommand};
use crate::config::ExecConfig;
use crate::epn::{EpnDetector, EpnOutcome, EpnRequest, EpnSupervisor};
use crate::error::{is_resource_exhaustion, ExecError, Result};
use crate::internal::CheckRegistry;
use crate::output::{apply_timeout, fix_return_code, normalize_output, worker_tag, Termination};
use crate::process::{run_process, ProcessOutcome, ProcessOutput};

/// Outcome of [`Executor::execute`]
#[derive(Debug, Clone)]
pub struct Execution {
    pub answer: Answer,
    /// Set when the job was canceled; its answer must not be delivered
    pub canceled: bool,
}

/// What a strategy produced before timeout and negate handling
enum RunResult {
    Done,
    TimedOut,
    Canceled,
}

/// Runs check jobs
#[derive(Debug)]
pub struct Executor {
    config: ExecConfig,
    resolver: CommandResolver,
    epn: Option<Arc<EpnSupervisor>>,
}

impl Executor {
    /// Executor without an interpreter daemon
    pub fn new(config: ExecConfig) -> Self {
        let registry = CheckRegistry::with_builtins(config.internal_check_dummy);
        let resolver = CommandResolver::new(config.internal_negate, registry);
        Self {
            config,
            resolver,
            epn: None,
        }
    }

    /// Route eligible scripts to the given daemon supervisor
    pub fn with_epn(mut self, supervisor: Arc<EpnSupervisor>) -> Self {
        let detector = Arc::new(EpnDetector::new(self.config.epn.implicit));
        self.resolver = self.resolver.with_epn(detector);
        self.epn = Some(supervisor);
        self
    }

    /// Executor with the interpreter daemon started when enabled
    pub async fn start(config: ExecConfig) -> Result<Self> {
        let enabled = config.epn.enabled;
        let supervisor = Arc::new(EpnSupervisor::new(config.epn.clone()));
        let executor = Self::new(config);
        if !enabled {
            return Ok(executor);
        }
        supervisor.start().await?;
        Ok(executor.with_epn(supervisor))
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn resolver(&self) -> &CommandResolver {
        &self.resolver
    }

    /// Interpreter daemon supervisor, when one is attached
    pub fn epn(&self) -> Option<&Arc<EpnSupervisor>> {
        self.epn.as_ref()
    }

    /// Replace the interpreter daemon if it asked for a restart
    pub async fn check_restart(&self) -> Result<()> {
        match &self.epn {
            Some(supervisor) => supervisor.check_restart().await,
            None => Ok(()),
        }
    }

    /// Stop helper processes
    pub fn shutdown(&self) {
        if let Some(supervisor) = &self.epn {
            supervisor.stop_all();
        }
    }

    /// Execute one job
    ///
    /// Plugin failures become answers; only fatal conditions are errors.
    #[instrument(skip(self, request, cancel), fields(job_type = %request.job_type, host = %request.host_name))]
    pub async fn execute(&self, request: &Request, cancel: &CancellationToken) -> Result<Execution> {
        let mut answer = Answer::for_request(request, self.config.source_label());
        let id = &self.config.identifier;

        if self.config.max_age > 0
            && request.core_time > 0.0
            && answer.start_time - request.core_time > self.config.max_age as f64
        {
            warn!(
                core_time = request.core_time,
                max_age = self.config.max_age,
                "job too old, skipping"
            );
            answer.output = format!("Could not start check in time {}", worker_tag(id));
            answer.exec_kind = ExecKind::TooLate;
            return Ok(self.finish(answer, request, false));
        }

        let mut timeout = self.config.timeout_for(request.timeout);

        if !self.path_allowed(&request.command_line) {
            warn!(command = %request.command_line, "command contains bad path");
            answer.exec_kind = ExecKind::BadPath;
            answer.output = "command contains bad path".to_string();
            return Ok(self.finish(answer, request, false));
        }

        let command = self.resolver.resolve(&request.command_line);
        if let Some(negate) = &command.negate {
            if negate.timeout > 0 {
                timeout = negate.timeout;
            }
        }
        answer.exec_kind = command.exec_type.kind();
        debug!(exec = %answer.exec_kind, program = %command.program, timeout, "running check");

        let run = match &command.exec_type {
            ExecType::Epn if self.epn.is_some() => self.run_epn(&command, timeout, &mut answer, cancel).await?,
            ExecType::Internal(name) => self.run_internal(name, &command, timeout, &mut answer, cancel).await,
            _ => {
                if command.exec_type == ExecType::Epn {
                    answer.exec_kind = ExecKind::Exec;
                }
                self.run_command(&command, timeout, &mut answer, cancel).await?
            }
        };

        match run {
            RunResult::Canceled => Ok(self.finish(answer, request, true)),
            RunResult::TimedOut => {
                info!(
                    host = %request.host_name,
                    service = %request.service_description,
                    timeout,
                    "check ran into timeout"
                );
                apply_timeout(&mut answer, &request.job_type, id, self.config.timeout_return);
                if let Some(negate) = &command.negate {
                    negate.apply_timeout(&mut answer);
                }
                Ok(self.finish(answer, request, false))
            }
            RunResult::Done => {
                if let Some(negate) = &command.negate {
                    negate.apply(&mut answer);
                }
                Ok(self.finish(answer, request, false))
            }
        }
    }

    fn finish(&self, mut answer: Answer, request: &Request, canceled: bool) -> Execution {
        if !request.service_description.is_empty() {
            answer.service_description = request.service_description.clone();
        }
        answer.output = escape_newlines(&answer.output);
        answer.finish_time = now_epoch();
        Execution { answer, canceled }
    }

    /// First word of the command line must start with an allowed prefix
    fn path_allowed(&self, command_line: &str) -> bool {
        if self.config.restrict_path.is_empty() {
            return true;
        }
        let first = command_line.split_whitespace().next().unwrap_or_default();
        self.config
            .restrict_path
            .iter()
            .any(|prefix| first.starts_with(prefix.as_str()))
    }

    async fn run_command(
        &self,
        command: &ResolvedCommand,
        timeout: i64,
        answer: &mut Answer,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let timeout = Duration::from_secs(timeout.max(0) as u64);
        let outcome = match run_process(command, timeout, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.spawn_failure(e, answer)?;
                return Ok(RunResult::Done);
            }
        };

        match outcome {
            ProcessOutcome::Finished(output) => {
                self.fill_from_process(answer, &output);
                let rc = match output.termination {
                    Termination::Exited(rc) => rc,
                    Termination::Signaled(sig) => 128 + sig,
                };
                answer.output = normalize_output(&output.stdout, &output.stderr, rc, self.config.show_error_output);
                fix_return_code(
                    answer,
                    output.termination,
                    &self.config.identifier,
                    self.config.worker_name_in_result,
                );
                Ok(RunResult::Done)
            }
            ProcessOutcome::TimedOut(output) => {
                self.fill_from_process(answer, &output);
                answer.output = normalize_output(&output.stdout, &output.stderr, 3, self.config.show_error_output);
                Ok(RunResult::TimedOut)
            }
            ProcessOutcome::Canceled => Ok(RunResult::Canceled),
        }
    }

    fn fill_from_process(&self, answer: &mut Answer, output: &ProcessOutput) {
        answer.run_user_duration = output.user_time;
        answer.run_sys_duration = output.sys_time;
    }

    /// Map a spawn error onto an answer, or fail the worker on exhaustion
    fn spawn_failure(&self, err: io::Error, answer: &mut Answer) -> Result<()> {
        let tag = worker_tag(&self.config.identifier);
        answer.return_code = 3;
        answer.output = match err.kind() {
            io::ErrorKind::NotFound => format!(
                "UNKNOWN: Return code of 127 is out of bounds. Make sure the plugin you're trying to run actually exists. {}",
                tag
            ),
            io::ErrorKind::PermissionDenied => format!(
                "UNKNOWN: Return code of 126 is out of bounds. Make sure the plugin you're trying to run is executable. {}",
                tag
            ),
            _ if is_resource_exhaustion(&err) => {
                return Err(ExecError::Fatal(err));
            }
            _ => {
                warn!(error = %err, "system error starting check");
                format!("UNKNOWN: {} {}", err, tag)
            }
        };
        Ok(())
    }

    async fn run_internal(
        &self,
        name: &str,
        command: &ResolvedCommand,
        timeout: i64,
        answer: &mut Answer,
        cancel: &CancellationToken,
    ) -> RunResult {
        let Some(check) = self.resolver.registry().get(name) else {
            answer.output = format!("UNKNOWN: internal check {} is not available {}", name, worker_tag(&self.config.identifier));
            return RunResult::Done;
        };

        let deadline = Duration::from_secs(timeout.max(0) as u64);
        tokio::select! {
            outcome = tokio::time::timeout(deadline, check.check(&command.args)) => match outcome {
                Ok(outcome) => {
                    answer.output = outcome.output;
                    fix_return_code(
                        answer,
                        Termination::Exited(outcome.return_code),
                        &self.config.identifier,
                        self.config.worker_name_in_result,
                    );
                    RunResult::Done
                }
                Err(_) => RunResult::TimedOut,
            },
            _ = cancel.cancelled() => RunResult::Canceled,
        }
    }

    async fn run_epn(
        &self,
        command: &ResolvedCommand,
        timeout: i64,
        answer: &mut Answer,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let Some(supervisor) = &self.epn else {
            return Ok(RunResult::Done);
        };
        let request = EpnRequest {
            bin: command.program.clone(),
            args: command.args.clone(),
            env: command.env.iter().cloned().collect(),
            timeout,
        };

        match supervisor.execute(&request, cancel).await {
            Ok(EpnOutcome::Finished { response, timed_out }) => {
                answer.output = normalize_output(response.stdout.as_bytes(), b"", response.rc, false);
                answer.compile_duration = response.compile_duration;
                answer.run_user_duration = response.cpu_user;
                if timed_out {
                    return Ok(RunResult::TimedOut);
                }
                fix_return_code(
                    answer,
                    Termination::Exited(response.rc),
                    &self.config.identifier,
                    self.config.worker_name_in_result,
                );
                Ok(RunResult::Done)
            }
            Ok(EpnOutcome::Canceled) => Ok(RunResult::Canceled),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                if cancel.is_cancelled() {
                    debug!(bin = %command.program, error = %e, "embedded interpreter failed during shutdown");
                    return Ok(RunResult::Canceled);
                }
                warn!(bin = %command.program, error = %e, "embedded interpreter failed");
                answer.return_code = 3;
                answer.output = format!("UNKNOWN: {} {}", e, worker_tag(&self.config.identifier));
                Ok(RunResult::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearcheck_protocol::JobType;

    fn executor() -> Executor {
        Executor::new(ExecConfig::new("lab01"))
    }

    async fn run(executor: &Executor, request: Request) -> Execution {
        executor.execute(&request, &CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_internal_dummy() {
        let request = Request::new(JobType::Service, r#"ENV1=test ./lib/check_dummy 1 test' 'out"put""#)
            .with_host("web01")
            .with_service("dummy");
        let execution = run(&executor(), request).await;

        assert!(!execution.canceled);
        let answer = execution.answer;
        assert_eq!(answer.return_code, 1);
        assert_eq!(answer.output, "WARNING: test output");
        assert_eq!(answer.exec_kind, ExecKind::Internal);
        assert_eq!(answer.service_description, "dummy");
        assert_eq!(answer.source, "gearcheck worker @ lab01");
        assert!(answer.finish_time >= answer.start_time);
    }

    #[tokio::test]
    async fn test_too_late() {
        let executor = Executor::new(ExecConfig::new("lab01").with_max_age(10));
        let request = Request::new(JobType::Host, "/bin/true").with_core_time(now_epoch() - 60.0);
        let answer = run(&executor, request).await.answer;

        assert_eq!(answer.exec_kind, ExecKind::TooLate);
        assert_eq!(answer.return_code, 3);
        assert_eq!(answer.output, "Could not start check in time (worker: lab01)");
    }

    #[tokio::test]
    async fn test_restricted_path() {
        let executor =
            Executor::new(ExecConfig::new("lab01").with_restrict_path(vec!["/usr/lib/plugins/".to_string()]));
        let answer = run(&executor, Request::new(JobType::Host, "/bin/true")).await.answer;
        assert_eq!(answer.exec_kind, ExecKind::BadPath);
        assert_eq!(answer.return_code, 3);
        assert_eq!(answer.output, "command contains bad path");

        let answer = run(&executor, Request::new(JobType::Host, "/usr/lib/plugins/check_dummy 0"))
            .await
            .answer;
        assert_eq!(answer.return_code, 0);
    }

    #[tokio::test]
    async fn test_internal_negate_wraps_dummy() {
        let answer = run(&executor(), Request::new(JobType::Host, "/usr/lib/negate /lib/check_dummy 0 fine"))
            .await
            .answer;
        assert_eq!(answer.return_code, 2);
        assert_eq!(answer.output, "OK: fine");
    }
}
