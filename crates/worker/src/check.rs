//! Monitoring plugin for brokers and workers
//!
//! Two modes, both reporting a plugin state and one line of text:
//!
//! - queue check: read the broker's admin status table and compare waiting
//!   jobs and available workers per queue against thresholds
//! - worker check: submit a job (usually to `worker_<identifier>`) and
//!   judge the reply

use std::fmt;
use std::time::Duration;

use gearcheck_protocol::{QueueStatus, ServerStatus};

use crate::broker::admin::query_status;
use crate::broker::Broker;

/// Name leading every report line
pub const PLUGIN_NAME: &str = "check_gearcheck";

/// Plugin exit states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginState {
    Ok = 0,
    Warning = 1,
    Critical = 2,
    Unknown = 3,
}

impl PluginState {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => PluginState::Ok,
            1 => PluginState::Warning,
            2 => PluginState::Critical,
            _ => PluginState::Unknown,
        }
    }

    /// Process exit code
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Ok => "OK",
            PluginState::Warning => "WARNING",
            PluginState::Critical => "CRITICAL",
            PluginState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub state: PluginState,
    /// Full plugin output line, perfdata included
    pub text: String,
}

impl CheckReport {
    pub fn new(state: PluginState, message: impl fmt::Display) -> Self {
        Self {
            state,
            text: format!("{} {} - {}", PLUGIN_NAME, state, message),
        }
    }
}

/// Queue check limits; a limit of 0 is disabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueThresholds {
    pub job_warning: i64,
    pub job_critical: i64,
    pub worker_warning: i64,
    pub worker_critical: i64,
    /// Critical when a checked queue has no worker at all
    pub critical_on_zero_worker: bool,
    /// Only look at this queue
    pub queue: Option<String>,
}

impl Default for QueueThresholds {
    fn default() -> Self {
        Self {
            job_warning: 10,
            job_critical: 100,
            worker_warning: 25,
            worker_critical: 50,
            critical_on_zero_worker: true,
            queue: None,
        }
    }
}

impl QueueThresholds {
    fn selects(&self, queue: &QueueStatus) -> bool {
        self.queue.as_deref().map_or(true, |name| name == queue.name)
    }

    /// State and message for one queue
    fn judge(&self, q: &QueueStatus) -> Option<(PluginState, String)> {
        let jobs = |n: i64| if n == 1 { "job" } else { "jobs" };
        let exceeds = |limit: i64, value: i64| limit > 0 && value >= limit;

        if q.waiting > 0 && q.available_workers == 0 {
            Some((
                PluginState::Critical,
                format!("Queue {} has {} {} without any worker.", q.name, q.waiting, jobs(q.waiting)),
            ))
        } else if exceeds(self.job_critical, q.waiting) {
            Some((
                PluginState::Critical,
                format!("Queue {} has {} waiting {}.", q.name, q.waiting, jobs(q.waiting)),
            ))
        } else if exceeds(self.worker_critical, q.available_workers) {
            Some((
                PluginState::Critical,
                format!("Queue {} has {} worker.", q.name, q.available_workers),
            ))
        } else if self.critical_on_zero_worker && q.available_workers == 0 {
            Some((PluginState::Critical, format!("Queue {} has no worker.", q.name)))
        } else if exceeds(self.job_warning, q.waiting) {
            Some((
                PluginState::Warning,
                format!("Queue {} has {} waiting {}.", q.name, q.waiting, jobs(q.waiting)),
            ))
        } else if exceeds(self.worker_warning, q.available_workers) {
            Some((
                PluginState::Warning,
                format!("Queue {} has {} worker.", q.name, q.available_workers),
            ))
        } else {
            None
        }
    }

    fn perfdata(&self, q: &QueueStatus) -> String {
        format!(
            "'{name}_waiting'={};{};{};0 '{name}_running'={} '{name}_worker'={};{};{};0",
            q.waiting,
            self.job_warning,
            self.job_critical,
            q.running,
            q.available_workers,
            self.worker_warning,
            self.worker_critical,
            name = q.name,
        )
    }
}

/// Judge a broker's queue table
///
/// The worst queue decides the state; its message is reported.
pub fn evaluate_queues(status: &ServerStatus, thresholds: &QueueThresholds) -> CheckReport {
    let selected: Vec<&QueueStatus> = status.queues.iter().filter(|q| thresholds.selects(q)).collect();

    let mut worst: Option<(PluginState, String)> = None;
    for queue in &selected {
        if let Some((state, message)) = thresholds.judge(queue) {
            if worst.as_ref().map_or(true, |(current, _)| state > *current) {
                worst = Some((state, message));
            }
        }
    }
    if selected.is_empty() {
        if let Some(name) = &thresholds.queue {
            worst = Some((PluginState::Warning, format!("Queue {} not found.", name)));
        }
    }

    let mut report = match worst {
        Some((state, message)) => CheckReport::new(state, message),
        None => {
            let running: i64 = selected.iter().map(|q| q.running).sum();
            let waiting: i64 = selected.iter().map(|q| q.waiting).sum();
            let plural = |n: i64| if n == 1 { "" } else { "s" };
            CheckReport::new(
                PluginState::Ok,
                format!(
                    "{} job{} running and {} job{} waiting. Version: {}",
                    running,
                    plural(running),
                    waiting,
                    plural(waiting),
                    status.version.as_deref().unwrap_or("unknown"),
                ),
            )
        }
    };

    if !selected.is_empty() {
        let perf: Vec<String> = selected.iter().map(|q| thresholds.perfdata(q)).collect();
        report.text.push('|');
        report.text.push_str(&perf.join(" "));
    }
    report
}

/// Query a broker's admin port and judge its queues
pub async fn check_queues(address: &str, thresholds: &QueueThresholds, timeout: Duration) -> CheckReport {
    match query_status(address, timeout).await {
        Ok(status) => evaluate_queues(&status, thresholds),
        Err(e) => CheckReport::new(PluginState::Critical, format!("{}: {}", address, e)),
    }
}

/// What to submit for a worker check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerJob {
    pub queue: String,
    /// Payload sent as is
    pub text: String,
    /// Reply must contain this
    pub expect: Option<String>,
    /// Submit as a background job and only check the submission
    pub background: bool,
}

/// Submit a job and judge the reply
///
/// A reply of the form `<digit>:<text>` sets the state itself.
pub async fn check_worker(broker: &dyn Broker, address: &str, job: &WorkerJob) -> CheckReport {
    let mut client = match broker.connect_client(address).await {
        Ok(client) => client,
        Err(e) => return CheckReport::new(PluginState::Critical, format!("job failed: {}", e)),
    };

    if job.background {
        return match client.submit_background(&job.queue, job.text.as_bytes()).await {
            Ok(_) => CheckReport::new(PluginState::Ok, "sending background job succeeded"),
            Err(e) => CheckReport::new(PluginState::Critical, format!("job failed: {}", e)),
        };
    }

    let reply = match client.submit_job(&job.queue, job.text.as_bytes()).await {
        Ok(reply) => String::from_utf8_lossy(&reply).into_owned(),
        Err(e) => return CheckReport::new(PluginState::Critical, format!("job failed: {}", e)),
    };
    if reply.is_empty() {
        return CheckReport::new(
            PluginState::Critical,
            format!("send worker: '{}' got no response", job.text),
        );
    }

    if let Some(expect) = &job.expect {
        return if reply.contains(expect.as_str()) {
            CheckReport::new(
                PluginState::Ok,
                format!("send worker: '{}' response: '{}'", job.text, reply),
            )
        } else {
            CheckReport::new(
                PluginState::Critical,
                format!(
                    "send worker: '{}' response: '{}', expected '{}'",
                    job.text, reply, expect
                ),
            )
        };
    }

    let mut chars = reply.chars();
    if let (Some(code), Some(':')) = (chars.next().and_then(|c| c.to_digit(10)), chars.next()) {
        return CheckReport {
            state: PluginState::from_code(code),
            text: reply[2..].to_string(),
        };
    }
    CheckReport::new(PluginState::Ok, reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use gearcheck_protocol::admin::parse_status;

    const GM: &str = "gm1:4730";

    fn status(table: &str) -> ServerStatus {
        parse_status(&format!("{}.\nOK 1.1.21\n", table)).unwrap()
    }

    #[test]
    fn test_healthy_broker_is_ok_with_perfdata() {
        let report = evaluate_queues(
            &status("host\t1\t1\t4\nservice\t3\t1\t4\n"),
            &QueueThresholds::default(),
        );
        assert_eq!(report.state, PluginState::Ok);
        assert_eq!(
            report.text,
            "check_gearcheck OK - 2 jobs running and 2 jobs waiting. Version: v1.1.21\
             |'host_waiting'=0;10;100;0 'host_running'=1 'host_worker'=4;25;50;0 \
             'service_waiting'=2;10;100;0 'service_running'=1 'service_worker'=4;25;50;0"
        );
    }

    #[test]
    fn test_jobs_without_worker_are_critical() {
        let report = evaluate_queues(
            &status("host\t0\t0\t4\nperfdata\t155\t0\t0\n"),
            &QueueThresholds::default(),
        );
        assert_eq!(report.state, PluginState::Critical);
        assert!(
            report.text.starts_with("check_gearcheck CRITICAL - Queue perfdata has 155 jobs without any worker.|"),
            "{}",
            report.text
        );
    }

    #[test]
    fn test_worst_queue_wins() {
        let thresholds = QueueThresholds {
            critical_on_zero_worker: false,
            ..Default::default()
        };
        // warning first, critical second, warning last
        let report = evaluate_queues(
            &status("a\t12\t0\t1\nb\t150\t0\t1\nc\t11\t0\t1\n"),
            &thresholds,
        );
        assert_eq!(report.state, PluginState::Critical);
        assert!(report.text.contains("Queue b has 150 waiting jobs."), "{}", report.text);
    }

    #[test]
    fn test_thresholds_and_zero_worker() {
        let q = status("service\t30\t0\t1\nidle\t0\t0\t0\n");

        let thresholds = QueueThresholds {
            queue: Some("service".into()),
            ..Default::default()
        };
        let report = evaluate_queues(&q, &thresholds);
        assert_eq!(report.state, PluginState::Warning);
        assert!(report.text.contains("Queue service has 30 waiting jobs."));
        assert!(!report.text.contains("idle_waiting"));

        let thresholds = QueueThresholds {
            queue: Some("idle".into()),
            ..Default::default()
        };
        assert_eq!(evaluate_queues(&q, &thresholds).state, PluginState::Critical);

        let thresholds = QueueThresholds {
            queue: Some("idle".into()),
            critical_on_zero_worker: false,
            ..Default::default()
        };
        assert_eq!(evaluate_queues(&q, &thresholds).state, PluginState::Ok);

        let thresholds = QueueThresholds {
            job_warning: 0,
            job_critical: 0,
            queue: Some("service".into()),
            ..Default::default()
        };
        assert_eq!(evaluate_queues(&q, &thresholds).state, PluginState::Ok);
    }

    #[test]
    fn test_missing_queue_is_warning() {
        let thresholds = QueueThresholds {
            queue: Some("worker_node9".into()),
            ..Default::default()
        };
        let report = evaluate_queues(&status("host\t0\t0\t1\n"), &thresholds);
        assert_eq!(report.state, PluginState::Warning);
        assert_eq!(report.text, "check_gearcheck WARNING - Queue worker_node9 not found.");
    }

    #[tokio::test]
    async fn test_unreachable_admin_port_is_critical() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let report = check_queues(&address, &QueueThresholds::default(), Duration::from_secs(1)).await;
        assert_eq!(report.state, PluginState::Critical);
    }

    async fn answer_once(broker: &MemoryBroker, queue: &str, reply: &'static [u8]) {
        let mut worker = broker.connect_worker(GM, "w", &[queue.to_string()]).await.unwrap();
        tokio::spawn(async move {
            worker.wait_for_job().await.unwrap();
            let job = worker.grab_job().await.unwrap().unwrap();
            worker.complete(&job.handle, reply).await.unwrap();
        });
    }

    fn job(expect: Option<&str>) -> WorkerJob {
        WorkerJob {
            queue: "worker_node1".into(),
            text: "check".into(),
            expect: expect.map(String::from),
            background: false,
        }
    }

    #[tokio::test]
    async fn test_worker_reply_is_ok() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        answer_once(&broker, "worker_node1", b"node1 has 2 worker and is working on 0 jobs").await;

        let report = check_worker(&broker, GM, &job(None)).await;
        assert_eq!(report.state, PluginState::Ok);
        assert_eq!(
            report.text,
            "check_gearcheck OK - node1 has 2 worker and is working on 0 jobs"
        );
    }

    #[tokio::test]
    async fn test_worker_reply_with_state_prefix() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        answer_once(&broker, "worker_node1", b"1:result worker is slow").await;

        let report = check_worker(&broker, GM, &job(None)).await;
        assert_eq!(report.state, PluginState::Warning);
        assert_eq!(report.text, "result worker is slow");
    }

    #[tokio::test]
    async fn test_worker_reply_must_match_expectation() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        answer_once(&broker, "worker_node1", b"node1 has 2 worker").await;
        let report = check_worker(&broker, GM, &job(Some("3 worker"))).await;
        assert_eq!(report.state, PluginState::Critical);
        assert!(report.text.ends_with("expected '3 worker'"), "{}", report.text);

        answer_once(&broker, "worker_node1", b"node1 has 2 worker").await;
        let report = check_worker(&broker, GM, &job(Some("2 worker"))).await;
        assert_eq!(report.state, PluginState::Ok);
    }

    #[tokio::test]
    async fn test_empty_worker_reply_is_critical() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        answer_once(&broker, "worker_node1", b"").await;

        let report = check_worker(&broker, GM, &job(None)).await;
        assert_eq!(report.state, PluginState::Critical);
        assert!(report.text.ends_with("got no response"), "{}", report.text);
    }

    #[tokio::test]
    async fn test_worker_check_against_missing_broker() {
        let broker = MemoryBroker::new();
        let report = check_worker(&broker, GM, &job(None)).await;
        assert_eq!(report.state, PluginState::Critical);
        assert!(report.text.contains("job failed"), "{}", report.text);
    }

    #[tokio::test]
    async fn test_background_submission() {
        let broker = MemoryBroker::new();
        broker.add_server(GM);
        let background = WorkerJob {
            background: true,
            ..job(None)
        };
        let report = check_worker(&broker, GM, &background).await;
        assert_eq!(report.state, PluginState::Ok);
        assert_eq!(broker.queued(GM, "worker_node1"), vec![b"check".to_vec()]);
    }

    #[test]
    fn test_plugin_state_codes() {
        assert_eq!(PluginState::from_code(2).code(), 2);
        assert_eq!(PluginState::from_code(7), PluginState::Unknown);
        assert!(PluginState::Critical > PluginState::Warning);
    }
}
