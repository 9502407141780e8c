//! Command line resolution
//!
//! ```text
//! command_line
//!     │ split_command_line
//!     ├── error ───────────────────────────▶ Shell  (/bin/sh -c line)
//!     ▼
//! env + args
//!     │ program ends in /negate            (negate options parsed,
//!     ├──────────────────────────────────▶  wrapped command resolved)
//!     ▼
//! program matches a registered check ────▶ Internal
//! program is an eligible script ─────────▶ Epn
//! otherwise ─────────────────────────────▶ Exec
//! ```

use std::sync::Arc;

use gearcheck_protocol::ExecKind;
use tracing::debug;

use crate::epn::EpnDetector;
use crate::internal::CheckRegistry;
use crate::negate::Negate;
use crate::tokenizer::{split_command_line, Tokens};

/// Shell used for lines that cannot be split directly
pub const SHELL: &str = "/bin/sh";

/// How a resolved command is run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecType {
    /// Through `/bin/sh -c`
    Shell,
    /// Direct exec of the program
    Exec,
    /// In the embedded interpreter daemon
    Epn,
    /// In process by the named check
    Internal(&'static str),
}

impl ExecType {
    pub fn kind(&self) -> ExecKind {
        match self {
            ExecType::Shell => ExecKind::Shell,
            ExecType::Exec => ExecKind::Exec,
            ExecType::Epn => ExecKind::Epn,
            ExecType::Internal(_) => ExecKind::Internal,
        }
    }
}

/// A command ready to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub exec_type: ExecType,
    pub program: String,
    pub args: Vec<String>,
    /// Variables added to the inherited environment
    pub env: Vec<(String, String)>,
    /// Options of an unwrapped negate call
    pub negate: Option<Negate>,
}

impl ResolvedCommand {
    fn shell(line: &str) -> Self {
        Self {
            exec_type: ExecType::Shell,
            program: SHELL.to_string(),
            args: vec!["-c".to_string(), line.to_string()],
            env: Vec::new(),
            negate: None,
        }
    }

    fn exec(tokens: Tokens) -> Self {
        let mut args = tokens.args;
        let program = args.remove(0);
        Self {
            exec_type: ExecType::Exec,
            program,
            args,
            env: tokens.env,
            negate: None,
        }
    }
}

/// Turns command lines into [`ResolvedCommand`]s
#[derive(Debug, Clone)]
pub struct CommandResolver {
    internal_negate: bool,
    registry: CheckRegistry,
    epn: Option<Arc<EpnDetector>>,
}

impl CommandResolver {
    pub fn new(internal_negate: bool, registry: CheckRegistry) -> Self {
        Self {
            internal_negate,
            registry,
            epn: None,
        }
    }

    /// Enable embedded interpreter detection
    pub fn with_epn(mut self, detector: Arc<EpnDetector>) -> Self {
        self.epn = Some(detector);
        self
    }

    pub fn registry(&self) -> &CheckRegistry {
        &self.registry
    }

    /// Resolve a raw command line
    pub fn resolve(&self, line: &str) -> ResolvedCommand {
        let tokens = match split_command_line(line) {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!(error = %e, "using shell for command line");
                return ResolvedCommand::shell(line);
            }
        };

        let mut command = ResolvedCommand::exec(tokens);
        if self.internal_negate && command.program.ends_with("/negate") {
            if let Some(unwrapped) = self.unwrap_negate(&command) {
                command = unwrapped;
            }
        }
        if command.exec_type != ExecType::Exec {
            return command;
        }

        if let Some(name) = self.registry.match_program(&command.program) {
            command.exec_type = ExecType::Internal(name);
        } else if let Some(detector) = &self.epn {
            if detector.uses_epn(&command.program) {
                command.exec_type = ExecType::Epn;
            }
        }
        command
    }

    /// Split `negate [options] /wrapped/plugin args` into the wrapped command
    ///
    /// Returns `None` when the options cannot be parsed, in which case the
    /// negate binary itself is run.
    fn unwrap_negate(&self, command: &ResolvedCommand) -> Option<ResolvedCommand> {
        let split = command.args.iter().position(|a| a.starts_with('/'))?;
        let negate = match Negate::parse(&command.args[..split]) {
            Ok(negate) => negate,
            Err(e) => {
                debug!(error = %e, "cannot parse negate options");
                return None;
            }
        };

        let wrapped = &command.args[split..];
        let mut inner = if wrapped.len() == 1 {
            // `negate '/path/check -a x'` passes the whole command as one word
            match split_command_line(&wrapped[0]) {
                Ok(tokens) => ResolvedCommand::exec(tokens),
                Err(_) => ResolvedCommand::shell(&wrapped[0]),
            }
        } else {
            ResolvedCommand::exec(Tokens {
                env: Vec::new(),
                args: wrapped.to_vec(),
            })
        };

        let mut env = command.env.clone();
        env.append(&mut inner.env);
        inner.env = env;
        inner.negate = Some(negate);
        Some(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negate::Status;
    use std::io::Write;

    fn resolver() -> CommandResolver {
        CommandResolver::new(true, CheckRegistry::with_builtins(true))
    }

    #[test]
    fn test_plain_exec() {
        let cmd = resolver().resolve("/usr/lib/plugins/check_ping -H 10.0.0.1");
        assert_eq!(cmd.exec_type, ExecType::Exec);
        assert_eq!(cmd.program, "/usr/lib/plugins/check_ping");
        assert_eq!(cmd.args, vec!["-H", "10.0.0.1"]);
        assert!(cmd.negate.is_none());
    }

    #[test]
    fn test_shell_fallback() {
        let cmd = resolver().resolve("echo hi; exit 2");
        assert_eq!(cmd.exec_type, ExecType::Shell);
        assert_eq!(cmd.program, SHELL);
        assert_eq!(cmd.args, vec!["-c", "echo hi; exit 2"]);
    }

    #[test]
    fn test_internal_check_with_env() {
        let cmd = resolver().resolve(r#"ENV1=test ./lib/check_dummy 1 test' 'out"put""#);
        assert_eq!(cmd.exec_type, ExecType::Internal("check_dummy"));
        assert_eq!(cmd.args, vec!["1", "test output"]);
        assert_eq!(cmd.env, vec![("ENV1".to_string(), "test".to_string())]);
    }

    #[test]
    fn test_negate_unwrapped() {
        let cmd = resolver().resolve("/usr/lib/plugins/negate -w OK /usr/lib/plugins/check_load -w 5");
        assert_eq!(cmd.exec_type, ExecType::Exec);
        assert_eq!(cmd.program, "/usr/lib/plugins/check_load");
        assert_eq!(cmd.args, vec!["-w", "5"]);
        assert_eq!(cmd.negate.unwrap().warning, Some(Status::Ok));
    }

    #[test]
    fn test_negate_single_quoted_command() {
        let cmd = resolver().resolve("A=1 /bin/negate -t 5 '/lib/check_dummy 0 fine'");
        assert_eq!(cmd.exec_type, ExecType::Internal("check_dummy"));
        assert_eq!(cmd.args, vec!["0", "fine"]);
        assert_eq!(cmd.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(cmd.negate.unwrap().timeout, 5);
    }

    #[test]
    fn test_negate_with_bad_options_runs_binary() {
        let cmd = resolver().resolve("/bin/negate --bogus 1 /bin/check");
        assert_eq!(cmd.program, "/bin/negate");
        assert!(cmd.negate.is_none());
    }

    #[test]
    fn test_negate_disabled() {
        let cmd = CommandResolver::new(false, CheckRegistry::new()).resolve("/bin/negate /bin/true");
        assert_eq!(cmd.program, "/bin/negate");
        assert!(cmd.negate.is_none());
    }

    #[test]
    fn test_epn_detection() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        script.write_all(b"#!/usr/bin/perl\n# nagios: +epn\n").unwrap();
        script.flush().unwrap();
        let path = script.path().to_string_lossy().into_owned();

        let resolver = resolver().with_epn(Arc::new(EpnDetector::new(false)));
        let cmd = resolver.resolve(&format!("{} -H x", path));
        assert_eq!(cmd.exec_type, ExecType::Epn);
        assert_eq!(cmd.program, path);
    }
}
