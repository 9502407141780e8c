//! Job records exchanged with the broker
//!
//! A [`Request`] is decoded from the payload of an inbound job. An [`Answer`]
//! is built while the job executes and rendered back into the same
//! `key=value` line format for delivery to the result queue.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current wall clock time as fractional unix seconds
pub fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Kind of job carried by a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Host,
    Service,
    EventHandler,
    Notification,
    /// Any other type tag, kept verbatim
    Other(String),
}

impl JobType {
    /// Map a wire type tag onto a job type
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "host" => JobType::Host,
            "service" => JobType::Service,
            "eventhandler" => JobType::EventHandler,
            "notification" => JobType::Notification,
            other => JobType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobType::Host => "host",
            JobType::Service => "service",
            JobType::EventHandler => "eventhandler",
            JobType::Notification => "notification",
            JobType::Other(s) => s,
        }
    }
}

impl FromStr for JobType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from_tag(s))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound job as decoded from the broker payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub job_type: JobType,
    pub result_queue: String,
    pub target_queue: String,
    pub host_name: String,
    pub service_description: String,
    pub start_time: f64,
    pub next_check: f64,
    /// Time the monitoring core issued the job
    pub core_time: f64,
    /// Per-job timeout override in seconds, 0 when unset
    pub timeout: i64,
    pub command_line: String,
    /// Payload bytes exactly as delivered, kept for diagnostics
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl Request {
    /// Create a request of the given type for a command line
    pub fn new(job_type: JobType, command_line: impl Into<String>) -> Self {
        Self {
            job_type,
            result_queue: String::new(),
            target_queue: String::new(),
            host_name: String::new(),
            service_description: String::new(),
            start_time: 0.0,
            next_check: 0.0,
            core_time: 0.0,
            timeout: 0,
            command_line: command_line.into(),
            raw: Vec::new(),
        }
    }

    /// Set the host name
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host_name = host.into();
        self
    }

    /// Set the service description
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service_description = service.into();
        self
    }

    /// Set the result queue
    pub fn with_result_queue(mut self, queue: impl Into<String>) -> Self {
        self.result_queue = queue.into();
        self
    }

    /// Set the per-job timeout in seconds
    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Set the core issue time
    pub fn with_core_time(mut self, core_time: f64) -> Self {
        self.core_time = core_time;
        self
    }

    /// Parse the decrypted `key=value` text of a job
    ///
    /// The text must start with `type=`; unknown keys are ignored and
    /// numeric fields that fail to parse default to zero.
    pub fn parse(text: &[u8]) -> Result<Self> {
        if !text.starts_with(b"type=") {
            return Err(ProtocolError::MissingType);
        }

        let text = String::from_utf8_lossy(text);
        let fields = parse_fields(&text);
        let get = |key: &str| fields.get(key).cloned().unwrap_or_default();

        Ok(Self {
            job_type: JobType::from_tag(&get("type")),
            result_queue: get("result_queue"),
            target_queue: get("target_queue"),
            host_name: get("host_name"),
            service_description: get("service_description"),
            start_time: parse_float(&get("start_time")),
            next_check: parse_float(&get("next_check")),
            core_time: parse_float(&get("core_time")),
            timeout: parse_int(&get("timeout")),
            command_line: get("command_line"),
            raw: Vec::new(),
        })
    }

    /// Render the request in its `key=value` text form
    pub fn to_text(&self) -> String {
        let mut text = format!("type={}\n", self.job_type);
        let mut push = |key: &str, value: &str| {
            if !value.is_empty() {
                text.push_str(key);
                text.push('=');
                text.push_str(value);
                text.push('\n');
            }
        };
        push("result_queue", &self.result_queue);
        push("target_queue", &self.target_queue);
        push("host_name", &self.host_name);
        push("service_description", &self.service_description);
        if self.start_time > 0.0 {
            push("start_time", &format!("{:.6}", self.start_time));
        }
        if self.next_check > 0.0 {
            push("next_check", &format!("{:.6}", self.next_check));
        }
        if self.core_time > 0.0 {
            push("core_time", &format!("{:.6}", self.core_time));
        }
        if self.timeout > 0 {
            push("timeout", &self.timeout.to_string());
        }
        push("command_line", &self.command_line);
        text
    }
}

/// Whether a result is reported as actively or passively checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckMode {
    Active,
    Passive,
}

impl CheckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckMode::Active => "active",
            CheckMode::Passive => "passive",
        }
    }
}

/// Execution strategy label recorded on every answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecKind {
    Shell,
    Exec,
    Epn,
    Internal,
    /// Job was skipped because it waited too long before starting
    TooLate,
    /// Command rejected by the restricted path list
    BadPath,
}

impl ExecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecKind::Shell => "shell",
            ExecKind::Exec => "exec",
            ExecKind::Epn => "epn",
            ExecKind::Internal => "internal",
            ExecKind::TooLate => "too_late",
            ExecKind::BadPath => "bad_path",
        }
    }
}

impl fmt::Display for ExecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound check result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub result_queue: String,
    pub host_name: String,
    pub service_description: String,
    /// Upstream core issue time, 0 when unknown
    pub core_start_time: f64,
    pub start_time: f64,
    pub finish_time: f64,
    pub return_code: i32,
    /// Plugin output; real newlines are escaped when rendered
    pub output: String,
    pub source: String,
    pub mode: CheckMode,
    pub exec_kind: ExecKind,
    pub run_user_duration: f64,
    pub run_sys_duration: f64,
    pub compile_duration: f64,
    pub timed_out: bool,
}

impl Answer {
    /// Start a new answer for a request, stamping the start time now
    pub fn for_request(request: &Request, source: impl Into<String>) -> Self {
        Self {
            result_queue: request.result_queue.clone(),
            host_name: request.host_name.clone(),
            service_description: String::new(),
            core_start_time: request.core_time,
            start_time: now_epoch(),
            finish_time: 0.0,
            return_code: 3,
            output: String::new(),
            source: source.into(),
            mode: CheckMode::Active,
            exec_kind: ExecKind::Exec,
            run_user_duration: 0.0,
            run_sys_duration: 0.0,
            compile_duration: 0.0,
            timed_out: false,
        }
    }

    /// Wall clock duration of the execution window
    pub fn duration(&self) -> f64 {
        (self.finish_time - self.start_time).max(0.0)
    }

    /// Render the answer in its `key=value` wire text form
    pub fn to_text(&self) -> String {
        let mut text = format!("type={}\nhost_name={}\n", self.mode.as_str(), self.host_name);
        if !self.service_description.is_empty() {
            text.push_str(&format!("service_description={}\n", self.service_description));
        }
        text.push_str(&format!(
            "start_time={:.6}\nfinish_time={:.6}\nreturn_code={}\nexited_ok=1\nsource={}\noutput={}\n",
            self.start_time,
            self.finish_time,
            self.return_code,
            self.source,
            escape_newlines(&self.output),
        ));
        if self.core_start_time > 0.0 {
            text.push_str(&format!("core_start_time={:.6}\n", self.core_start_time));
        }
        text
    }
}

/// Replace every real newline with the two character sequence `\n`
pub fn escape_newlines(output: &str) -> String {
    output.replace('\n', "\\n")
}

/// Split `key=value` lines into a map; keys and values are trimmed of spaces
pub fn parse_fields(text: &str) -> HashMap<String, String> {
    text.split('\n')
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim_matches(' ').to_string(), v.trim_matches(' ').to_string()))
        .collect()
}

fn parse_float(value: &str) -> f64 {
    value.trim().parse().unwrap_or(0.0)
}

fn parse_int(value: &str) -> i64 {
    let value = value.trim();
    value
        .parse::<i64>()
        .unwrap_or_else(|_| parse_float(value) as i64)
}
