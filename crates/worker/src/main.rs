use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gearcheck_exec::Executor;
use gearcheck_protocol::admin::{render_table, with_default_port};
use gearcheck_protocol::{JobType, Request};
use gearcheck_worker::broker::admin::query_status;
use gearcheck_worker::check::{check_queues, check_worker, CheckReport, PluginState, QueueThresholds, WorkerJob};
use gearcheck_worker::cli::{Cli, Commands};
use gearcheck_worker::pool::{Control, PoolExit, ResourceProbe, SystemProbe, WorkerPool};
use gearcheck_worker::send::{read_line, read_message, PassiveResult, ResultSender};
use gearcheck_worker::telemetry::{init_telemetry, TelemetryConfig};
use gearcheck_worker::{Broker, TcpBroker, WorkerConfig};
use tokio::io::BufReader;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config().context("Failed to load configuration")?;

    // RUST_LOG wins over the configured debug level
    let telemetry_config = TelemetryConfig::from_env()
        .with_debug(config.debug)
        .with_logfile(config.logfile.clone());
    init_telemetry(telemetry_config).context("Failed to open log file")?;

    match cli.command() {
        Commands::Run => run(cli, config).await,
        Commands::Testcmd { command } => testcmd(config, command).await,
        Commands::Status {
            servers,
            timeout,
            json,
        } => status(servers, Duration::from_secs(timeout), json).await,
        Commands::Send {
            host,
            service,
            return_code,
            message,
            result_queue,
            active,
            start_time,
            finish_time,
            delimiter,
            timeout,
        } => {
            let template = PassiveResult {
                host_name: host.unwrap_or_default(),
                service_description: service.unwrap_or_default(),
                return_code,
                output: message.unwrap_or_default(),
                result_queue,
                active,
                start_time,
                finish_time,
            };
            send(config, template, &delimiter, Duration::from_secs(timeout)).await
        }
        Commands::Check {
            host,
            timeout,
            job_warning,
            job_critical,
            worker_warning,
            worker_critical,
            crit_zero_worker,
            queue,
            send,
            expect,
            background,
        } => {
            let address = with_default_port(&host);
            let timeout = Duration::from_secs(timeout);
            let report = match send {
                Some(text) => {
                    let Some(queue) = queue else {
                        eprintln!("--send needs --queue");
                        std::process::exit(PluginState::Unknown.code());
                    };
                    let job = WorkerJob {
                        queue,
                        text,
                        expect,
                        background,
                    };
                    let broker = TcpBroker::new();
                    with_deadline(timeout, check_worker(&broker, &address, &job)).await
                }
                None => {
                    let thresholds = QueueThresholds {
                        job_warning,
                        job_critical,
                        worker_warning,
                        worker_critical,
                        critical_on_zero_worker: crit_zero_worker,
                        queue,
                    };
                    check_queues(&address, &thresholds, timeout).await
                }
            };
            println!("{}", report.text);
            std::process::exit(report.state.code());
        }
    }
}

/// Run the daemon until stopped by a signal
async fn run(cli: Cli, mut config: WorkerConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    install_panic_hook();

    let broker: Arc<dyn Broker> = Arc::new(TcpBroker::new());
    let probe: Arc<dyn ResourceProbe> = Arc::new(SystemProbe::new());

    let (control_tx, mut control_rx) = mpsc::channel(8);
    let signals = Signals::install().context("Failed to install signal handlers")?;
    let signal_task = tokio::spawn(signals.forward(cli, control_tx));

    let mut initial_start = 0;
    let result = loop {
        let pool = match WorkerPool::start(config, broker.clone(), probe.clone()).await {
            Ok(pool) => pool.with_initial_start(initial_start),
            Err(e) => break Err(e).context("Failed to start worker pool"),
        };

        match pool.run(&mut control_rx).await {
            Ok(PoolExit::Stopped) => break Ok(()),
            Ok(PoolExit::Restart {
                config: next,
                initial_start: started,
            }) => {
                info!(initial_start = started, "configuration changed, restarting worker pool");
                config = *next;
                initial_start = started;
            }
            Err(e) => {
                error!(error = %e, "worker pool failed");
                break Err(e).context("Worker pool failed");
            }
        }
    };

    signal_task.abort();
    if result.is_ok() {
        info!("gearcheck-worker stopped");
    }
    result
}

/// Run one command as a service check and exit with its return code
async fn testcmd(config: WorkerConfig, command: Vec<String>) -> Result<()> {
    let executor = Executor::start(config.exec_config())
        .await
        .context("Failed to start executor")?;
    let request = Request::new(JobType::Service, command.join(" "))
        .with_host("testcmd")
        .with_service("testcmd");

    let execution = executor.execute(&request, &CancellationToken::new()).await;
    executor.shutdown();
    let answer = execution.context("Failed to run command")?.answer;

    println!("{}", answer.output);
    std::process::exit(answer.return_code);
}

/// Print the queue table of each broker
async fn status(servers: Vec<String>, timeout: Duration, json: bool) -> Result<()> {
    let mut failed = 0;
    for server in servers {
        let address = with_default_port(&server);
        match query_status(&address, timeout).await {
            Ok(status) if json => {
                let value = serde_json::json!({ "server": address, "status": status });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Ok(status) => println!("{}", render_table(&address, &status)),
            Err(e) => {
                eprintln!("{}: {}", address, e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} broker(s) did not answer", failed);
    }
    Ok(())
}

/// Submit one result from flags or stdin, or one per stdin line
async fn send(config: WorkerConfig, template: PassiveResult, delimiter: &str, timeout: Duration) -> Result<()> {
    if config.server.is_empty() {
        anyhow::bail!("no server specified");
    }
    let codec = config.codec().context("Invalid encryption settings")?;
    let broker: Arc<dyn Broker> = Arc::new(TcpBroker::new());
    let mut sender = ResultSender::new(config.server.clone(), codec, broker);
    let mut stdin = BufReader::new(tokio::io::stdin());

    if !template.host_name.is_empty() {
        let mut result = template;
        if result.output.is_empty() {
            result.output = read_message(&mut stdin, timeout)
                .await
                .context("Failed to read plugin output")?;
        }
        let address = sender.send(&result).await.context("Failed to send result")?;
        info!(address = %address, host = %result.host_name, "result sent");
        return Ok(());
    }

    while let Some(line) = read_line(&mut stdin, timeout)
        .await
        .context("Failed to read result line")?
    {
        let result = template.with_line(&line, delimiter)?;
        let address = sender.send(&result).await.context("Failed to send result")?;
        info!(address = %address, host = %result.host_name, "result sent");
    }
    info!(count = sender.sent(), "all results sent");
    Ok(())
}

/// Turn a check that overruns into a CRITICAL report
async fn with_deadline(timeout: Duration, check: impl std::future::Future<Output = CheckReport>) -> CheckReport {
    match tokio::time::timeout(timeout, check).await {
        Ok(report) => report,
        Err(_) => CheckReport::new(
            PluginState::Critical,
            format!("timed out after {}s", timeout.as_secs()),
        ),
    }
}

/// Log panics with a backtrace and exit instead of leaving a half dead pool
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!(panic = %info, backtrace = %backtrace, "panic in worker task, exiting");
        std::process::exit(1);
    }));
}

/// Unix signals mapped onto pool control messages
struct Signals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
    user1: Signal,
}

impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
            user1: signal(SignalKind::user_defined1())?,
        })
    }

    async fn forward(mut self, cli: Cli, control: mpsc::Sender<Control>) {
        loop {
            let message = tokio::select! {
                _ = self.terminate.recv() => {
                    info!("received SIGTERM, stopping after running jobs");
                    Control::GracefulShutdown
                }
                _ = self.interrupt.recv() => {
                    info!("received SIGINT, shutting down");
                    Control::Shutdown
                }
                _ = self.hangup.recv() => {
                    info!("received SIGHUP, reloading configuration");
                    match reload_config(&cli) {
                        Ok(config) => Control::Reload(Box::new(config)),
                        Err(e) => {
                            error!(error = %e, "cannot reload configuration");
                            continue;
                        }
                    }
                }
                _ = self.user1.recv() => Control::Dump,
            };
            if control.send(message).await.is_err() {
                break;
            }
        }
    }
}

fn reload_config(cli: &Cli) -> Result<WorkerConfig> {
    let mut config = cli.load_config()?;
    config.validate()?;
    Ok(config)
}
