// Command-line interface
//
// Flags override values from config files; anything without a dedicated
// flag can be set with `-o key=value`.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::config::{ConfigLoader, Result, WorkerConfig};

#[derive(Debug, Clone, Parser)]
#[command(name = "gearcheck-worker")]
#[command(about = "Check worker - runs monitoring checks handed out by a job broker")]
#[command(version)]
pub struct Cli {
    /// Config file or directory, may be given more than once
    #[arg(long, short, value_name = "PATH")]
    pub config: Vec<PathBuf>,

    /// Broker address (host[:port]), may be given more than once
    #[arg(long, value_name = "ADDRESS")]
    pub server: Vec<String>,

    /// Worker identifier, defaults to the host name
    #[arg(long, env = "GEARCHECK_IDENTIFIER")]
    pub identifier: Option<String>,

    /// Increase log verbosity (-d debug, -dd trace)
    #[arg(long, short, action = ArgAction::Count)]
    pub debug: u8,

    /// Write logs to this file
    #[arg(long, value_name = "PATH")]
    pub logfile: Option<PathBuf>,

    /// Set any configuration option
    #[arg(long = "option", short = 'o', value_name = "KEY=VALUE")]
    pub options: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Run the worker daemon (default)
    Run,

    /// Run a single command as a service check and exit with its return code
    Testcmd {
        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print the queue table of a broker
    Status {
        /// Broker address (host[:port])
        #[arg(long = "server", required = true, value_name = "ADDRESS")]
        servers: Vec<String>,

        /// Seconds to wait for an answer
        #[arg(long, default_value = "10")]
        timeout: u64,

        /// Print the queues as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send check results to the result queue
    ///
    /// Uses the brokers and encryption settings of the configuration. Without
    /// --host every stdin line is one delimited result; without --message
    /// the plugin output is read from stdin.
    Send {
        /// Host name of the result
        #[arg(long = "host")]
        host: Option<String>,

        /// Service description, omit for host results
        #[arg(long)]
        service: Option<String>,

        /// Plugin return code
        #[arg(long = "returncode", short = 'r', default_value = "0")]
        return_code: i32,

        /// Plugin output
        #[arg(long, short)]
        message: Option<String>,

        /// Queue to submit to
        #[arg(long, default_value = "check_results")]
        result_queue: String,

        /// Submit as an active check result
        #[arg(long)]
        active: bool,

        /// Check start as unix time
        #[arg(long = "starttime", default_value = "0")]
        start_time: f64,

        /// Check end as unix time
        #[arg(long = "finishtime", default_value = "0")]
        finish_time: f64,

        /// Field delimiter of stdin lines
        #[arg(long, default_value = "\t")]
        delimiter: String,

        /// Seconds to wait for stdin
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Monitoring plugin for a broker's queues or a worker
    ///
    /// Exits 0, 1, 2 or 3 (OK, WARNING, CRITICAL, UNKNOWN).
    Check {
        /// Broker address (host[:port])
        #[arg(short = 'H', long = "host", value_name = "ADDRESS")]
        host: String,

        /// Seconds before the check gives up
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Waiting jobs per queue for WARNING, 0 disables
        #[arg(short = 'w', long, default_value = "10")]
        job_warning: i64,

        /// Waiting jobs per queue for CRITICAL, 0 disables
        #[arg(short = 'c', long, default_value = "100")]
        job_critical: i64,

        /// Workers per queue for WARNING, 0 disables
        #[arg(short = 'W', long, default_value = "25")]
        worker_warning: i64,

        /// Workers per queue for CRITICAL, 0 disables
        #[arg(short = 'C', long, default_value = "50")]
        worker_critical: i64,

        /// Critical when a queue has no worker
        #[arg(short = 'x', long, default_value = "true", action = ArgAction::Set)]
        crit_zero_worker: bool,

        /// Queue to check, or to send the job to
        #[arg(short, long)]
        queue: Option<String>,

        /// Send this text as a job to --queue and check the reply
        #[arg(short, long)]
        send: Option<String>,

        /// Text the reply has to contain
        #[arg(short, long)]
        expect: Option<String>,

        /// Submit the job in the background, ignores --expect
        #[arg(short = 'a', long = "async")]
        background: bool,
    },
}

impl Cli {
    /// Selected subcommand, `run` when none was given
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }

    /// Build the configuration from config files and flags
    ///
    /// The result is not validated; `testcmd` runs without any broker.
    pub fn load_config(&self) -> Result<WorkerConfig> {
        let mut loader = ConfigLoader::new();
        for path in &self.config {
            loader.read_path(path)?;
        }
        for server in &self.server {
            loader.apply_item(&format!("server={}", server))?;
        }
        if let Some(identifier) = &self.identifier {
            loader.apply_item(&format!("identifier={}", identifier))?;
        }
        if self.debug > 0 {
            loader.apply_item(&format!("debug={}", self.debug))?;
        }
        if let Some(logfile) = &self.logfile {
            loader.apply_item(&format!("logfile={}", logfile.display()))?;
        }
        loader.apply_args(&self.options)?;
        Ok(loader.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server=gm1").unwrap();
        writeln!(file, "identifier=from-file").unwrap();
        writeln!(file, "services=yes").unwrap();
        writeln!(file, "max_worker=10").unwrap();

        let path = file.path().display().to_string();
        let cli = Cli::try_parse_from([
            "gearcheck-worker",
            "--config",
            &path,
            "--server",
            "gm2:4731",
            "--identifier",
            "from-flag",
            "-dd",
            "-o",
            "max_worker=30",
        ])
        .unwrap();

        let config = cli.load_config().unwrap();
        assert_eq!(config.server, vec!["gm1:4730", "gm2:4731"]);
        assert_eq!(config.identifier, "from-flag");
        assert_eq!(config.debug, 2);
        assert_eq!(config.max_worker, 30);
        assert!(config.services);
        assert!(matches!(cli.command(), Commands::Run));
    }

    #[test]
    fn test_testcmd_keeps_plugin_flags() {
        let cli = Cli::try_parse_from([
            "gearcheck-worker",
            "testcmd",
            "--",
            "/usr/lib/plugins/check_ping",
            "-H",
            "localhost",
        ])
        .unwrap();
        match cli.command() {
            Commands::Testcmd { command } => {
                assert_eq!(command, vec!["/usr/lib/plugins/check_ping", "-H", "localhost"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_status_requires_server() {
        assert!(Cli::try_parse_from(["gearcheck-worker", "status"]).is_err());

        let cli =
            Cli::try_parse_from(["gearcheck-worker", "status", "--server", "gm1"]).unwrap();
        assert!(matches!(
            cli.command(),
            Commands::Status { servers, timeout: 10, json: false } if servers == ["gm1"]
        ));
    }

    #[test]
    fn test_send_defaults() {
        let cli = Cli::try_parse_from([
            "gearcheck-worker",
            "--server",
            "gm1",
            "send",
            "--host",
            "web1",
            "-r",
            "2",
            "-m",
            "CRITICAL - down",
        ])
        .unwrap();
        match cli.command() {
            Commands::Send {
                host,
                service,
                return_code,
                message,
                result_queue,
                active,
                delimiter,
                timeout,
                ..
            } => {
                assert_eq!(host.as_deref(), Some("web1"));
                assert!(service.is_none());
                assert_eq!(return_code, 2);
                assert_eq!(message.as_deref(), Some("CRITICAL - down"));
                assert_eq!(result_queue, "check_results");
                assert!(!active);
                assert_eq!(delimiter, "\t");
                assert_eq!(timeout, 10);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.load_config().unwrap().server, vec!["gm1:4730"]);
    }

    #[test]
    fn test_check_flags() {
        let cli = Cli::try_parse_from([
            "gearcheck-worker",
            "check",
            "-H",
            "gm1",
            "-q",
            "worker_node1",
            "-s",
            "check",
            "-x",
            "false",
            "-w",
            "0",
        ])
        .unwrap();
        match cli.command() {
            Commands::Check {
                host,
                queue,
                send,
                crit_zero_worker,
                job_warning,
                job_critical,
                background,
                ..
            } => {
                assert_eq!(host, "gm1");
                assert_eq!(queue.as_deref(), Some("worker_node1"));
                assert_eq!(send.as_deref(), Some("check"));
                assert!(!crit_zero_worker);
                assert_eq!(job_warning, 0);
                assert_eq!(job_critical, 100);
                assert!(!background);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(Cli::try_parse_from(["gearcheck-worker", "check"]).is_err());
    }

    #[test]
    fn test_missing_config_file_is_rejected() {
        let cli = Cli::try_parse_from(["gearcheck-worker", "--config", "/nonexistent/gc.cfg"])
            .unwrap();
        assert!(cli.load_config().is_err());
    }
}
