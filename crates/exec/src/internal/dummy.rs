use async_trait::async_trait;

use super::{CheckOutcome, InternalCheck};

const HELP: &str = "This plugin will simply return the state corresponding to the numeric value
of the <state> argument with optional text


Usage:
 check_dummy <integer state> [optional text]

Options:
 -h, --help
	Print detailed help screen
 -V, --version
	Print version information
";

/// `check_dummy <state> [text]`
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyCheck;

impl DummyCheck {
    fn version() -> String {
        format!(
            "check_dummy (internal gearcheck worker v{})\n",
            env!("CARGO_PKG_VERSION")
        )
    }
}

#[async_trait]
impl InternalCheck for DummyCheck {
    fn name(&self) -> &'static str {
        "check_dummy"
    }

    async fn check(&self, args: &[String]) -> CheckOutcome {
        let Some(state) = args.first() else {
            return CheckOutcome::new(3, format!("{}{}", Self::version(), HELP));
        };

        let (code, label) = match state.as_str() {
            "0" => (0, "OK:"),
            "1" => (1, "WARNING:"),
            "2" => (2, "CRITICAL:"),
            "3" => (3, "UNKNOWN:"),
            "-h" | "--help" => return CheckOutcome::new(3, format!("{}{}", Self::version(), HELP)),
            "-V" | "-v" | "--version" => return CheckOutcome::new(3, Self::version()),
            other => {
                return CheckOutcome::new(
                    3,
                    format!("UNKNOWN: Status {} is not a supported error state", other),
                )
            }
        };

        match args.get(1) {
            Some(text) => CheckOutcome::new(code, format!("{} {}", label, text)),
            None => CheckOutcome::new(code, label),
        }
    }
}
