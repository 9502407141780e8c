// Result text shaping: plugin output normalization, out-of-bounds return
// codes and timeout messages.

use gearcheck_protocol::{Answer, JobType};

/// Build the output of a finished plugin from its raw streams
///
/// Stdout is trimmed of NUL bytes and whitespace. When `show_error_output`
/// is set and the plugin failed, stderr follows in square brackets.
pub fn normalize_output(stdout: &[u8], stderr: &[u8], return_code: i32, show_error_output: bool) -> String {
    let mut output = trim_stream(stdout);

    if show_error_output && return_code != 0 {
        let err = trim_stream(stderr);
        if !err.is_empty() {
            output.push_str("\n[");
            output.push_str(&err);
            output.push(']');
        }
    }

    output.trim_matches(['\r', '\n']).to_string()
}

fn trim_stream(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// Suffix naming the worker in messages
pub fn worker_tag(identifier: &str) -> String {
    format!("(worker: {})", identifier)
}

/// How a plugin process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

/// Bring the return code into 0..=3, rewriting the output where it is not
pub fn fix_return_code(answer: &mut Answer, termination: Termination, identifier: &str, name_in_result: bool) {
    let tag = worker_tag(identifier);

    let message = match termination {
        Termination::Exited(rc @ 0..=3) => {
            answer.return_code = rc;
            if name_in_result {
                answer.output = match answer.output.split_once('|') {
                    Some((text, perf)) => format!("{} {} |{}", text, tag, perf),
                    None => format!("{} {}", answer.output, tag),
                };
            }
            return;
        }
        Termination::Exited(126) => format!(
            "UNKNOWN: Return code of 126 is out of bounds. Make sure the plugin you're trying to run is executable. {}",
            tag
        ),
        Termination::Exited(127) => format!(
            "UNKNOWN: Return code of 127 is out of bounds. Make sure the plugin you're trying to run actually exists. {}",
            tag
        ),
        Termination::Signaled(sig) => format!(
            "UNKNOWN: Return code of {} is out of bounds. Plugin exited by signal: {}. {}",
            sig,
            signal_name(sig),
            tag
        ),
        Termination::Exited(rc) => {
            format!("CRITICAL: Return code of {} is out of bounds. {}", rc, tag)
        }
    };

    answer.return_code = 3;
    answer.output = if answer.output.is_empty() {
        message
    } else {
        format!("{}\n{}", message, answer.output)
    };
}

/// Message reported when a check hits its timeout
pub fn timeout_message(job_type: &JobType, identifier: &str) -> String {
    match job_type {
        JobType::Service => format!("(Service Check Timed Out On Worker: {})", identifier),
        JobType::Host => format!("(Host Check Timed Out On Worker: {})", identifier),
        _ => format!("(Check Timed Out On Worker: {})", identifier),
    }
}

/// Replace a timed out answer's output and return code
///
/// `timeout_return` outside 0..=3 is reported as UNKNOWN.
pub fn apply_timeout(answer: &mut Answer, job_type: &JobType, identifier: &str, timeout_return: i32) {
    let message = timeout_message(job_type, identifier);
    answer.output = if answer.output.is_empty() {
        message
    } else {
        format!("{}\n{}", message, answer.output)
    };
    answer.return_code = if (0..=3).contains(&timeout_return) {
        timeout_return
    } else {
        3
    };
    answer.timed_out = true;
}

fn signal_name(sig: i32) -> String {
    nix::sys::signal::Signal::try_from(sig)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", sig))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearcheck_protocol::Request;

    fn answer(output: &str) -> Answer {
        let mut answer = Answer::for_request(&Request::new(JobType::Service, ""), "src");
        answer.output = output.to_string();
        answer
    }

    #[test]
    fn test_normalize_trims_and_appends_stderr() {
        assert_eq!(normalize_output(b"\0 OK - fine \n\n", b"ignored", 0, true), "OK - fine");
        assert_eq!(
            normalize_output(b"stdout\nstdout\n", b"stderr\nstderr\n", 2, true),
            "stdout\nstdout\n[stderr\nstderr]"
        );
        assert_eq!(normalize_output(b"", b"stderr\n", 2, true), "[stderr]");
        assert_eq!(normalize_output(b"CRITICAL\n", b"boom\n", 2, false), "CRITICAL");
        assert_eq!(normalize_output(b"", b"", 2, true), "");
    }

    #[test]
    fn test_in_bounds_code_kept() {
        let mut a = answer("OK - load 0.1");
        fix_return_code(&mut a, Termination::Exited(1), "lab01", false);
        assert_eq!(a.return_code, 1);
        assert_eq!(a.output, "OK - load 0.1");
    }

    #[test]
    fn test_worker_name_before_perfdata() {
        let mut a = answer("OK - load 0.1|load=0.1");
        fix_return_code(&mut a, Termination::Exited(0), "lab01", true);
        assert_eq!(a.output, "OK - load 0.1 (worker: lab01) |load=0.1");

        let mut a = answer("OK");
        fix_return_code(&mut a, Termination::Exited(0), "lab01", true);
        assert_eq!(a.output, "OK (worker: lab01)");
    }

    #[test]
    fn test_not_executable_and_missing() {
        let mut a = answer("sh: denied");
        fix_return_code(&mut a, Termination::Exited(126), "lab01", false);
        assert_eq!(a.return_code, 3);
        assert_eq!(
            a.output,
            "UNKNOWN: Return code of 126 is out of bounds. Make sure the plugin you're trying to run is executable. (worker: lab01)\nsh: denied"
        );

        let mut a = answer("");
        fix_return_code(&mut a, Termination::Exited(127), "lab01", false);
        assert!(a.output.ends_with("actually exists. (worker: lab01)"));
    }

    #[test]
    fn test_signal_and_other_codes() {
        let mut a = answer("");
        fix_return_code(&mut a, Termination::Signaled(9), "lab01", false);
        assert_eq!(a.return_code, 3);
        assert_eq!(
            a.output,
            "UNKNOWN: Return code of 9 is out of bounds. Plugin exited by signal: SIGKILL. (worker: lab01)"
        );

        let mut a = answer("x");
        fix_return_code(&mut a, Termination::Exited(42), "lab01", false);
        assert_eq!(a.return_code, 3);
        assert_eq!(a.output, "CRITICAL: Return code of 42 is out of bounds. (worker: lab01)\nx");
    }

    #[test]
    fn test_timeout_messages() {
        let mut a = answer("partial");
        apply_timeout(&mut a, &JobType::Service, "lab01", 2);
        assert_eq!(a.output, "(Service Check Timed Out On Worker: lab01)\npartial");
        assert_eq!(a.return_code, 2);
        assert!(a.timed_out);

        assert_eq!(
            timeout_message(&JobType::Host, "w"),
            "(Host Check Timed Out On Worker: w)"
        );
        assert_eq!(
            timeout_message(&JobType::EventHandler, "w"),
            "(Check Timed Out On Worker: w)"
        );
    }

    #[test]
    fn test_timeout_return_stays_in_bounds() {
        let mut a = answer("");
        apply_timeout(&mut a, &JobType::Host, "lab01", 3);
        assert_eq!(a.return_code, 3);

        for rc in [4, 7, -1] {
            let mut a = answer("");
            apply_timeout(&mut a, &JobType::Host, "lab01", rc);
            assert_eq!(a.return_code, 3, "timeout_return {}", rc);
        }
    }
}
