//! Worker configuration
//!
//! Values are layered: built-in defaults, then `key=value` files, then
//! command-line flags. Parsing lives in [`file`]; this module holds the
//! resulting struct, its builders and [`WorkerConfig::validate`].

mod file;

use std::path::PathBuf;
use std::time::Duration;

use gearcheck_exec::{EpnConfig, ExecConfig};
use gearcheck_protocol::{EncryptionKey, PayloadCodec, ProtocolError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::{parse_bool, ConfigLoader};

/// Highest supported debug level
pub const MAX_DEBUG_LEVEL: u8 = 2;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A line is not of the form `key=value`
    #[error("parse error, expected key=value in {0}")]
    Syntax(String),

    /// A line of a config file failed to parse
    #[error("parse error in file {file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    /// A config file or directory could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The resulting configuration cannot run a worker
    #[error("{0}")]
    Invalid(String),

    /// Key material could not be loaded
    #[error(transparent)]
    Key(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Full worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name used in the status queue, result source and log messages
    pub identifier: String,

    /// 0 = info, 1 = debug, 2 = trace
    pub debug: u8,

    /// Write logs to this file instead of stdout
    pub logfile: Option<PathBuf>,

    /// Broker addresses (`host:port`)
    pub server: Vec<String>,

    /// Brokers receiving duplicate results
    pub dupserver: Vec<String>,

    // Job classes
    pub hosts: bool,
    pub services: bool,
    pub eventhandler: bool,
    pub notifications: bool,
    pub hostgroups: Vec<String>,
    pub servicegroups: Vec<String>,

    // Encryption
    pub encryption: bool,
    pub key: Option<String>,
    pub keyfile: Option<PathBuf>,

    // Pool sizing
    pub min_worker: usize,
    pub max_worker: usize,
    pub spawn_rate: usize,
    /// Workers stopped per tick when idle, 0 uses `spawn_rate`
    pub sink_rate: usize,

    /// How long the pool must stay under-utilized before shrinking
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Run time after which a job may be moved to the background, zero disables
    #[serde(with = "duration_secs")]
    pub backgrounding_threshold: Duration,

    // Admission control
    pub load_limit1: f64,
    pub load_limit5: f64,
    pub load_limit15: f64,
    pub load_cpu_multi: f64,
    /// Highest memory usage in percent at which workers are still added
    pub mem_limit: u8,

    // Result delivery
    pub dup_server_backlog_queue_size: usize,
    pub dup_results_are_passive: bool,
    /// Number of result senders, 0 derives it from `max_worker`
    pub result_workers: usize,

    // Execution
    pub timeout_return: i32,
    pub job_timeout: i64,
    pub max_age: i64,
    pub show_error_output: bool,
    pub worker_name_in_result: bool,
    pub restrict_path: Vec<String>,
    pub internal_negate: bool,
    pub internal_check_dummy: bool,

    // Embedded interpreter
    pub enable_embedded_perl: bool,
    pub use_embedded_perl_implicitly: bool,
    pub use_perl_cache: bool,
    pub p1_file: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let exec = ExecConfig::default();
        Self {
            identifier: default_identifier(),
            debug: 0,
            logfile: None,
            server: vec![],
            dupserver: vec![],
            hosts: false,
            services: false,
            eventhandler: false,
            notifications: false,
            hostgroups: vec![],
            servicegroups: vec![],
            encryption: true,
            key: None,
            keyfile: None,
            min_worker: 1,
            max_worker: 20,
            spawn_rate: 3,
            sink_rate: 1,
            idle_timeout: Duration::from_secs(10),
            backgrounding_threshold: Duration::from_secs(30),
            load_limit1: 0.0,
            load_limit5: 0.0,
            load_limit15: 0.0,
            load_cpu_multi: 2.5,
            mem_limit: 70,
            dup_server_backlog_queue_size: 1000,
            dup_results_are_passive: true,
            result_workers: 0,
            timeout_return: exec.timeout_return,
            job_timeout: exec.job_timeout,
            max_age: 0,
            show_error_output: true,
            worker_name_in_result: false,
            restrict_path: vec![],
            internal_negate: true,
            internal_check_dummy: true,
            enable_embedded_perl: false,
            use_embedded_perl_implicitly: false,
            use_perl_cache: true,
            p1_file: exec.epn.p1_file,
        }
    }
}

/// Host name of this machine, or `unknown`
fn default_identifier() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

impl WorkerConfig {
    /// Create a configuration for the given brokers
    pub fn new(server: Vec<String>) -> Self {
        Self {
            server,
            ..Default::default()
        }
    }

    /// Set the identifier
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Subscribe to host and service checks
    pub fn with_checks(mut self, hosts: bool, services: bool) -> Self {
        self.hosts = hosts;
        self.services = services;
        self
    }

    /// Set the worker bounds
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_worker = min;
        self.max_worker = max;
        self
    }

    /// Set the spawn and sink rates
    pub fn with_rates(mut self, spawn: usize, sink: usize) -> Self {
        self.spawn_rate = spawn;
        self.sink_rate = sink;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set duplicate result brokers
    pub fn with_dupserver(mut self, dupserver: Vec<String>) -> Self {
        self.dupserver = dupserver;
        self
    }

    /// Use a shared secret for payload encryption
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.encryption = true;
        self.key = Some(key.into());
        self
    }

    /// Disable payload encryption
    pub fn without_encryption(mut self) -> Self {
        self.encryption = false;
        self
    }

    /// Set the backgrounding threshold
    pub fn with_backgrounding_threshold(mut self, threshold: Duration) -> Self {
        self.backgrounding_threshold = threshold;
        self
    }

    /// Check the configuration and fill in derived values
    pub fn validate(&mut self) -> Result<()> {
        self.clean_lists();

        if self.server.is_empty() {
            return Err(ConfigError::Invalid("no server specified".into()));
        }
        if self.job_queues().is_empty() {
            return Err(ConfigError::Invalid("no listen queues defined".into()));
        }
        if self.encryption && self.key.is_none() && self.keyfile.is_none() {
            return Err(ConfigError::Invalid(
                "encryption enabled but no keys defined".into(),
            ));
        }
        if !(0..=3).contains(&self.timeout_return) {
            return Err(ConfigError::Invalid(format!(
                "timeout_return must be between 0 and 3, got {}",
                self.timeout_return
            )));
        }
        if self.min_worker > self.max_worker {
            self.max_worker = self.min_worker;
        }
        if self.load_cpu_multi > 0.0 {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1) as f64;
            let derived = self.load_cpu_multi * cpus;
            for limit in [
                &mut self.load_limit1,
                &mut self.load_limit5,
                &mut self.load_limit15,
            ] {
                if *limit == 0.0 {
                    *limit = derived;
                }
            }
        }
        Ok(())
    }

    /// Remove empty and duplicate list entries, keeping the first occurrence
    pub fn clean_lists(&mut self) {
        for list in [
            &mut self.server,
            &mut self.dupserver,
            &mut self.hostgroups,
            &mut self.servicegroups,
            &mut self.restrict_path,
        ] {
            let mut seen = std::collections::HashSet::new();
            list.retain(|entry| !entry.is_empty() && seen.insert(entry.clone()));
        }
    }

    /// Queues the check workers subscribe to
    pub fn job_queues(&self) -> Vec<String> {
        let mut queues = Vec::new();
        if self.eventhandler {
            queues.push("eventhandler".to_string());
        }
        if self.hosts {
            queues.push("host".to_string());
        }
        if self.services {
            queues.push("service".to_string());
        }
        if self.notifications {
            queues.push("notification".to_string());
        }
        queues.extend(self.hostgroups.iter().map(|g| format!("hostgroup_{}", g)));
        queues.extend(self.servicegroups.iter().map(|g| format!("servicegroup_{}", g)));
        queues
    }

    /// Queue answered by the status worker
    pub fn status_queue(&self) -> String {
        format!("worker_{}", self.identifier)
    }

    /// Workers stopped per shrink step
    pub fn effective_sink_rate(&self) -> usize {
        if self.sink_rate == 0 {
            self.spawn_rate
        } else {
            self.sink_rate
        }
    }

    /// Number of result senders
    ///
    /// `max_worker / 10`, at least 1 and at most 10, unless set explicitly;
    /// never more than `max_worker`.
    pub fn result_worker_count(&self) -> usize {
        let derived = if self.result_workers > 0 {
            self.result_workers
        } else {
            (self.max_worker / 10).clamp(1, 10)
        };
        derived.min(self.max_worker).max(1)
    }

    /// Payload codec for the configured encryption settings
    pub fn codec(&self) -> Result<PayloadCodec> {
        if !self.encryption {
            return Ok(PayloadCodec::plain());
        }
        let key = match (&self.keyfile, &self.key) {
            (Some(path), _) => EncryptionKey::from_file(path)?,
            (None, Some(secret)) => EncryptionKey::from_secret(secret),
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "encryption enabled but no keys defined".into(),
                ))
            }
        };
        Ok(PayloadCodec::encrypted(&key))
    }

    /// Settings for the check executor
    pub fn exec_config(&self) -> ExecConfig {
        ExecConfig::new(self.identifier.clone())
            .with_timeout_return(self.timeout_return)
            .with_job_timeout(self.job_timeout)
            .with_max_age(self.max_age)
            .with_restrict_path(self.restrict_path.clone())
            .with_worker_name_in_result(self.worker_name_in_result)
            .with_show_error_output(self.show_error_output)
            .with_internal_checks(self.internal_negate, self.internal_check_dummy)
            .with_epn(EpnConfig {
                enabled: self.enable_embedded_perl,
                implicit: self.use_embedded_perl_implicitly,
                use_cache: self.use_perl_cache,
                p1_file: self.p1_file.clone(),
                verbosity: self.debug,
                ..Default::default()
            })
    }
}

/// Serde support for Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
