//! Executor configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default check timeout in seconds
pub const DEFAULT_JOB_TIMEOUT_SECS: i64 = 60;

/// Embedded interpreter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpnConfig {
    /// Run eligible scripts in the interpreter daemon
    pub enabled: bool,

    /// Eligibility of scripts without an explicit directive
    pub implicit: bool,

    /// Ask the daemon to cache compiled scripts
    pub use_cache: bool,

    /// Daemon script
    pub p1_file: PathBuf,

    /// Daemon verbosity, 0 to 2
    pub verbosity: u8,

    /// How long a replaced daemon may finish running checks
    #[serde(with = "duration_millis")]
    pub restart_grace: Duration,
}

impl Default for EpnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            implicit: false,
            use_cache: true,
            p1_file: PathBuf::from("/usr/share/gearcheck/gearcheck_epn.pl"),
            verbosity: 0,
            restart_grace: Duration::from_secs(60),
        }
    }
}

/// Settings that shape how checks are run and reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Worker identifier used in result sources and messages
    pub identifier: String,

    /// Return code reported for timed out checks
    pub timeout_return: i32,

    /// Append stderr to the output of failed checks
    pub show_error_output: bool,

    /// Add `(worker: <identifier>)` to every output
    pub worker_name_in_result: bool,

    /// Default timeout in seconds when a job carries none
    pub job_timeout: i64,

    /// Skip jobs older than this many seconds, 0 disables
    pub max_age: i64,

    /// Allowed command prefixes; empty allows everything
    pub restrict_path: Vec<String>,

    /// Handle the `negate` wrapper in process
    pub internal_negate: bool,

    /// Serve `check_dummy` in process
    pub internal_check_dummy: bool,

    pub epn: EpnConfig,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            identifier: "localhost".to_string(),
            timeout_return: 3,
            show_error_output: true,
            worker_name_in_result: false,
            job_timeout: DEFAULT_JOB_TIMEOUT_SECS,
            max_age: 0,
            restrict_path: Vec::new(),
            internal_negate: true,
            internal_check_dummy: true,
            epn: EpnConfig::default(),
        }
    }
}

impl ExecConfig {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    /// Set the timeout return code
    pub fn with_timeout_return(mut self, rc: i32) -> Self {
        self.timeout_return = rc;
        self
    }

    /// Set the default job timeout
    pub fn with_job_timeout(mut self, seconds: i64) -> Self {
        self.job_timeout = seconds;
        self
    }

    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = seconds;
        self
    }

    pub fn with_restrict_path(mut self, prefixes: Vec<String>) -> Self {
        self.restrict_path = prefixes;
        self
    }

    pub fn with_worker_name_in_result(mut self, enabled: bool) -> Self {
        self.worker_name_in_result = enabled;
        self
    }

    pub fn with_show_error_output(mut self, enabled: bool) -> Self {
        self.show_error_output = enabled;
        self
    }

    /// Toggle the in-process `negate` wrapper and `check_dummy`
    pub fn with_internal_checks(mut self, negate: bool, dummy: bool) -> Self {
        self.internal_negate = negate;
        self.internal_check_dummy = dummy;
        self
    }

    pub fn with_epn(mut self, epn: EpnConfig) -> Self {
        self.epn = epn;
        self
    }

    /// Label stamped into the `source` field of every answer
    pub fn source_label(&self) -> String {
        format!("gearcheck worker @ {}", self.identifier)
    }

    /// Effective timeout in seconds for a job
    pub fn timeout_for(&self, requested: i64) -> i64 {
        if requested > 0 {
            requested
        } else if self.job_timeout > 0 {
            self.job_timeout
        } else {
            DEFAULT_JOB_TIMEOUT_SECS
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
