//! End-to-end execution through real child processes

use std::time::{Duration, Instant};

use gearcheck_exec::{ExecConfig, Executor};
use gearcheck_protocol::{ExecKind, JobType, Request};
use tokio_util::sync::CancellationToken;

fn executor() -> Executor {
    Executor::new(ExecConfig::new("lab01").with_timeout_return(2))
}

async fn execute(executor: &Executor, request: Request) -> gearcheck_exec::Execution {
    executor
        .execute(&request, &CancellationToken::new())
        .await
        .expect("execution failed")
}

#[tokio::test]
async fn test_shell_exit_code_and_output() {
    let request = Request::new(JobType::Service, "/bin/sh -c \"echo hi; exit 2\"").with_service("sh");
    let answer = execute(&executor(), request).await.answer;

    assert_eq!(answer.exec_kind, ExecKind::Exec);
    assert_eq!(answer.return_code, 2);
    assert_eq!(answer.output, "hi");
    assert!(!answer.timed_out);
}

#[tokio::test]
async fn test_shell_metacharacters_use_shell() {
    let request = Request::new(JobType::Host, "echo one; echo two >&2; exit 1");
    let answer = execute(&executor(), request).await.answer;

    assert_eq!(answer.exec_kind, ExecKind::Shell);
    assert_eq!(answer.return_code, 1);
    assert_eq!(answer.output, "one\\n[two]");
}

#[tokio::test]
async fn test_timeout() {
    let started = Instant::now();
    let request = Request::new(JobType::Service, "/bin/sleep 10").with_timeout(1);
    let answer = execute(&executor(), request).await.answer;

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(answer.timed_out);
    assert_eq!(answer.return_code, 2);
    assert_eq!(answer.output, "(Service Check Timed Out On Worker: lab01)");
}

#[tokio::test]
async fn test_missing_binary() {
    let request = Request::new(JobType::Host, "/nonexistent/check_nothing -H x");
    let answer = execute(&executor(), request).await.answer;

    assert_eq!(answer.return_code, 3);
    assert!(answer
        .output
        .starts_with("UNKNOWN: Return code of 127 is out of bounds."));
}

#[tokio::test]
async fn test_out_of_bounds_exit_code() {
    let request = Request::new(JobType::Host, "/bin/sh -c 'echo broken; exit 42'");
    let answer = execute(&executor(), request).await.answer;

    assert_eq!(answer.return_code, 3);
    assert_eq!(
        answer.output,
        "CRITICAL: Return code of 42 is out of bounds. (worker: lab01)\\nbroken"
    );
}

#[tokio::test]
async fn test_negate_of_ok_command_is_critical() {
    let request = Request::new(JobType::Host, "/usr/lib/plugins/negate /bin/sh -c 'echo OK; exit 0'");
    let answer = execute(&executor(), request).await.answer;

    assert_eq!(answer.return_code, 2);
    assert_eq!(answer.output, "OK");
}

#[tokio::test]
async fn test_negate_timeout_result() {
    let request = Request::new(JobType::Host, "/usr/lib/plugins/negate -t 1 -T UNKNOWN /bin/sleep 10");
    let answer = execute(&executor(), request).await.answer;

    assert!(answer.timed_out);
    assert_eq!(answer.return_code, 3);
    assert!(answer.output.starts_with("(Host Check Timed Out On Worker: lab01)"));
}

#[tokio::test]
async fn test_cancel_marks_execution() {
    let executor = executor();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let request = Request::new(JobType::Host, "/bin/sleep 10");
    let execution = executor.execute(&request, &cancel).await.unwrap();
    assert!(execution.canceled);
}

#[tokio::test]
async fn test_worker_name_in_result() {
    let executor = Executor::new(ExecConfig::new("lab01").with_worker_name_in_result(true));
    let request = Request::new(JobType::Host, "/bin/sh -c 'echo \"OK - fine|x=1\"'");
    let answer = execute(&executor, request).await.answer;

    assert_eq!(answer.return_code, 0);
    assert_eq!(answer.output, "OK - fine (worker: lab01) |x=1");
}
