//! `key=value` configuration files and items

use std::path::{Path, PathBuf};
use std::time::Duration;

use gearcheck_protocol::admin::with_default_port;
use tracing::{debug, error, warn};

use super::{ConfigError, Result, WorkerConfig, MAX_DEBUG_LEVEL};

/// Options accepted for compatibility that have no effect
const IGNORED_KEYS: &[&str] = &[
    "fork_on_exec",
    "workaround_rc_25",
    "gearman_connection_timeout",
    "max_jobs",
    "pidfile",
    "logmode",
    "daemon",
    "debug_result",
    "prometheus_server",
    "internal_check_nsc_web",
    "internal_check_prometheus",
];

/// Includes nested deeper than this are rejected
const MAX_INCLUDE_DEPTH: usize = 16;

/// `yes`, `on`, `1` and `true` are true, anything else is false
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "on" | "1" | "true"
    )
}

/// Integer value, falling back to a truncated float, then 0
fn parse_int(value: &str) -> i64 {
    if value.is_empty() {
        return 0;
    }
    match value.parse::<i64>() {
        Ok(v) => v,
        Err(_) => {
            debug!(value, "not an integer, trying float");
            parse_float(value) as i64
        }
    }
}

fn parse_float(value: &str) -> f64 {
    if value.is_empty() {
        return 0.0;
    }
    value.parse().unwrap_or_else(|_| {
        error!(value, "cannot convert to number");
        0.0
    })
}

fn parse_count(value: &str) -> usize {
    parse_int(value).max(0) as usize
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value.split(',').map(|item| item.trim().to_string())
}

/// Builds a [`WorkerConfig`] from files and items
///
/// ```ignore
/// let mut loader = ConfigLoader::new();
/// loader.read_path("/etc/gearcheck/worker.cfg")?;
/// loader.apply_item("max-worker=50")?;
/// let config = loader.finish();
/// ```
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config: WorkerConfig,
    depth: usize,
}

impl ConfigLoader {
    /// Start from the built-in defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: WorkerConfig) -> Self {
        Self { config, depth: 0 }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Return the configuration with list entries cleaned
    pub fn finish(mut self) -> WorkerConfig {
        self.config.clean_lists();
        self.config
    }

    /// Read a file, or every `*.cfg`/`*.conf` file in a directory
    pub fn read_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        if !meta.is_dir() {
            return self.read_file(path);
        }

        let mut files = Vec::new();
        collect_config_files(path, &mut files)?;
        files.sort();
        for file in files {
            self.read_file(&file)?;
        }
        Ok(())
    }

    /// Read one file of `key=value` lines
    pub fn read_file(&mut self, path: &Path) -> Result<()> {
        if self.depth >= MAX_INCLUDE_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "config includes nested too deep at {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        self.depth += 1;
        let result = self.read_lines(path, &content);
        self.depth -= 1;
        result
    }

    fn read_lines(&mut self, path: &Path, content: &str) -> Result<()> {
        for (nr, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.apply_item(line).map_err(|e| match e {
                // nested file errors already carry their location
                e @ ConfigError::Parse { .. } => e,
                e => ConfigError::Parse {
                    file: path.display().to_string(),
                    line: nr + 1,
                    message: e.to_string(),
                },
            })?;
        }
        Ok(())
    }

    /// Apply command-line style arguments
    ///
    /// `--key=value` sets a value and a bare `--flag` means `flag=yes`.
    pub fn apply_args<I, S>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            let arg = arg.as_ref().trim_start_matches('-');
            if arg.is_empty() {
                continue;
            }
            if arg.contains('=') {
                self.apply_item(arg)?;
            } else {
                self.apply_item(&format!("{}=yes", arg))?;
            }
        }
        Ok(())
    }

    /// Apply a single `key=value` item
    pub fn apply_item(&mut self, raw: &str) -> Result<()> {
        let Some((key, value)) = raw.split_once('=') else {
            return Err(ConfigError::Syntax(raw.to_string()));
        };
        let key = key.trim().to_ascii_lowercase().replace('-', "_");
        let value = value.trim();
        if key == "config" {
            return self.read_path(value);
        }
        let c = &mut self.config;

        match key.as_str() {
            "server" => c
                .server
                .extend(split_list(value).map(|s| with_default_port(&s))),
            "dupserver" => c
                .dupserver
                .extend(split_list(value).map(|s| with_default_port(&s))),
            "hostgroups" | "hostgroup" => c.hostgroups.extend(split_list(value)),
            "servicegroups" | "servicegroup" => c.servicegroups.extend(split_list(value)),
            "restrict_path" => c.restrict_path.extend(split_list(value)),
            "identifier" => c.identifier = value.to_string(),
            "debug" => c.debug = parse_int(value).clamp(0, MAX_DEBUG_LEVEL as i64) as u8,
            "logfile" => {
                c.logfile = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "hosts" => c.hosts = parse_bool(value),
            "services" => c.services = parse_bool(value),
            "eventhandler" => c.eventhandler = parse_bool(value),
            "notifications" => c.notifications = parse_bool(value),
            "encryption" => c.encryption = parse_bool(value),
            "key" => c.key = (!value.is_empty()).then(|| value.to_string()),
            "keyfile" => c.keyfile = (!value.is_empty()).then(|| PathBuf::from(value)),
            "min_worker" => c.min_worker = parse_count(value),
            "max_worker" => c.max_worker = parse_count(value),
            "spawn_rate" => c.spawn_rate = parse_count(value),
            "sink_rate" => c.sink_rate = parse_count(value),
            "idle_timeout" => c.idle_timeout = Duration::from_secs(parse_count(value) as u64),
            "backgrounding_threshold" => {
                c.backgrounding_threshold = Duration::from_secs(parse_count(value) as u64)
            }
            "max_age" => c.max_age = parse_int(value),
            "job_timeout" => c.job_timeout = parse_int(value),
            "timeout_return" => c.timeout_return = parse_int(value) as i32,
            "load_limit1" => c.load_limit1 = parse_float(value),
            "load_limit5" => c.load_limit5 = parse_float(value),
            "load_limit15" => c.load_limit15 = parse_float(value),
            "load_cpu_multi" => c.load_cpu_multi = parse_float(value),
            "mem_limit" => c.mem_limit = parse_int(value).clamp(0, 100) as u8,
            "show_error_output" => c.show_error_output = parse_bool(value),
            "dup_results_are_passive" => c.dup_results_are_passive = parse_bool(value),
            "dupserver_backlog_queue_size" | "dup_server_backlog_queue_size" => {
                c.dup_server_backlog_queue_size = parse_count(value)
            }
            "result_workers" => c.result_workers = parse_count(value),
            "worker_name_in_result" => c.worker_name_in_result = parse_bool(value),
            "internal_negate" => c.internal_negate = parse_bool(value),
            "internal_check_dummy" => c.internal_check_dummy = parse_bool(value),
            "enable_embedded_perl" => c.enable_embedded_perl = parse_bool(value),
            "use_embedded_perl_implicitly" => c.use_embedded_perl_implicitly = parse_bool(value),
            "use_perl_cache" => c.use_perl_cache = parse_bool(value),
            "p1_file" => c.p1_file = PathBuf::from(value),
            k if IGNORED_KEYS.contains(&k) => {}
            _ => warn!(option = raw, "unknown configuration option"),
        }
        Ok(())
    }
}

fn collect_config_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let read_err = |source| ConfigError::Read {
        path: dir.display().to_string(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.is_dir() {
            collect_config_files(&path, files)?;
            continue;
        }
        let wanted = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "cfg" || ext == "conf");
        if wanted {
            files.push(path);
        }
    }
    Ok(())
}
