//! The `negate` wrapper
//!
//! `negate [options] /path/to/plugin args...` runs the wrapped plugin and
//! remaps its exit status. Without any status option OK and CRITICAL are
//! swapped.

use std::fmt;
use std::str::FromStr;

use gearcheck_protocol::Answer;
use thiserror::Error;

/// Timeout applied to wrapped commands unless `--timeout` is given
pub const DEFAULT_TIMEOUT_SECS: i64 = 11;

/// Plugin status names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl Status {
    /// Status for a plugin return code, `None` outside 0..=3
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Warning),
            2 => Some(Status::Critical),
            3 => Some(Status::Unknown),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Warning => 1,
            Status::Critical => 2,
            Status::Unknown => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Critical => "CRITICAL",
            Status::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for Status {
    type Err = NegateError;

    /// Accepts numeric codes as well as status names in any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "0" | "OK" => Ok(Status::Ok),
            "1" | "WARNING" => Ok(Status::Warning),
            "2" | "CRITICAL" => Ok(Status::Critical),
            "3" | "UNKNOWN" => Ok(Status::Unknown),
            _ => Err(NegateError::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors while parsing negate options
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegateError {
    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("flag needs an argument: {0}")]
    MissingValue(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
}

/// Parsed negate options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negate {
    /// Seconds before the wrapped plugin times out
    pub timeout: i64,
    /// Status reported when the wrapped plugin times out
    pub timeout_result: Option<Status>,
    pub ok: Option<Status>,
    pub warning: Option<Status>,
    pub critical: Option<Status>,
    pub unknown: Option<Status>,
    /// Also replace the status word in the plugin output
    pub substitute: bool,
}

impl Default for Negate {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT_SECS,
            timeout_result: None,
            ok: None,
            warning: None,
            critical: None,
            unknown: None,
            substitute: false,
        }
    }
}

impl Negate {
    /// Parse the options that precede the wrapped plugin path
    ///
    /// Flags accept `-x value`, `-x=value`, `--long value` and
    /// `--long=value`.
    pub fn parse(args: &[String]) -> Result<Self, NegateError> {
        let mut negate = Negate::default();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            let flag = arg.trim_start_matches('-');
            if flag.len() == arg.len() {
                // positional arguments end the option list
                break;
            }
            let (name, inline) = match flag.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (flag, None),
            };

            if matches!(name, "s" | "substitute") {
                negate.substitute = match inline.as_deref() {
                    None | Some("true") | Some("1") => true,
                    Some(_) => false,
                };
                continue;
            }

            let value = match inline {
                Some(v) => v,
                None => iter
                    .next()
                    .cloned()
                    .ok_or_else(|| NegateError::MissingValue(arg.clone()))?,
            };

            match name {
                "t" | "timeout" => {
                    negate.timeout = value
                        .parse()
                        .map_err(|_| NegateError::InvalidTimeout(value.clone()))?;
                }
                "T" | "timeout-result" => negate.timeout_result = Some(value.parse()?),
                "o" | "ok" => negate.ok = Some(value.parse()?),
                "w" | "warning" => negate.warning = Some(value.parse()?),
                "c" | "critical" => negate.critical = Some(value.parse()?),
                "u" | "unknown" => negate.unknown = Some(value.parse()?),
                _ => return Err(NegateError::UnknownFlag(arg.clone())),
            }
        }

        if negate.ok.is_none()
            && negate.warning.is_none()
            && negate.critical.is_none()
            && negate.unknown.is_none()
        {
            negate.ok = Some(Status::Critical);
            negate.critical = Some(Status::Ok);
        }

        Ok(negate)
    }

    fn target_for(&self, status: Status) -> Option<Status> {
        match status {
            Status::Ok => self.ok,
            Status::Warning => self.warning,
            Status::Critical => self.critical,
            Status::Unknown => self.unknown,
        }
    }

    /// Remap the return code of a finished check
    pub fn apply(&self, answer: &mut Answer) {
        let Some(from) = Status::from_code(answer.return_code) else {
            return;
        };
        let Some(to) = self.target_for(from) else {
            return;
        };

        answer.return_code = to.code();
        if self.substitute {
            answer.output = answer.output.replacen(from.as_str(), to.as_str(), 1);
        }
    }

    /// Override the return code of a timed out check
    pub fn apply_timeout(&self, answer: &mut Answer) {
        if let Some(status) = self.timeout_result {
            answer.return_code = status.code();
        }
    }
}
