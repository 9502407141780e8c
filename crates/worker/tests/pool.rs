//! Full pool runs against the in-memory broker

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gearcheck_protocol::job::parse_fields;
use gearcheck_protocol::{EncryptionKey, JobType, PayloadCodec, Request};
use gearcheck_worker::pool::{Control, FixedProbe, PoolExit, PoolState, WorkerPool};
use gearcheck_worker::{MemoryBroker, PoolError, WorkerConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

const GM1: &str = "gm1:4730";
const GM2: &str = "gm2:4730";
const DUP: &str = "dup1:4730";
const RESULTS: &str = "check_results";
const WAIT: Duration = Duration::from_secs(10);

fn config(servers: &[&str]) -> WorkerConfig {
    WorkerConfig::new(servers.iter().map(|s| s.to_string()).collect())
        .with_identifier("node1")
        .with_checks(true, true)
        .without_encryption()
        .with_workers(2, 4)
}

struct RunningPool {
    state: Arc<PoolState>,
    control: mpsc::Sender<Control>,
    handle: JoinHandle<Result<PoolExit, PoolError>>,
}

async fn start(broker: &MemoryBroker, config: WorkerConfig) -> RunningPool {
    let pool = WorkerPool::start(config, Arc::new(broker.clone()), Arc::new(FixedProbe::idle()))
        .await
        .unwrap()
        .with_retry_interval(Duration::from_millis(100))
        .with_probe_timeout(Duration::from_millis(100));
    let state = pool.state().clone();
    let (control, mut rx) = mpsc::channel(4);
    let handle = tokio::spawn(async move { pool.run(&mut rx).await });
    RunningPool {
        state,
        control,
        handle,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn submit_service_check(broker: &MemoryBroker, address: &str, command: &str) {
    let request = Request::new(JobType::Service, command)
        .with_host("web1")
        .with_service("http")
        .with_result_queue(RESULTS);
    let payload = PayloadCodec::plain().encode(request.to_text().as_bytes());
    broker.submit(address, "service", payload).unwrap();
}

fn decode_results(broker: &MemoryBroker, address: &str) -> Vec<HashMap<String, String>> {
    broker
        .queued(address, RESULTS)
        .iter()
        .map(|payload| {
            let text = PayloadCodec::plain().decode(payload).unwrap();
            parse_fields(&String::from_utf8_lossy(&text))
        })
        .collect()
}

#[test_log::test(tokio::test)]
async fn test_pool_keeps_min_workers_until_shutdown() {
    let broker = MemoryBroker::new();
    broker.add_server(GM1);
    let pool = start(&broker, config(&[GM1])).await;

    assert!(eventually(|| pool.state.worker_count() == 2).await);
    assert!(pool.state.has_status_worker());
    assert!(pool.state.worker_count() <= 4);
    assert!(pool.state.active_workers() <= pool.state.worker_count());
    assert_eq!(broker.subscribers(GM1, "worker_node1"), 1);

    pool.control.send(Control::Shutdown).await.unwrap();
    let exit = assert_ok!(pool.handle.await.unwrap());
    assert!(matches!(exit, PoolExit::Stopped));
    assert_eq!(pool.state.worker_count(), 0);
    assert!(!pool.state.is_running());
    assert!(eventually(|| broker.subscribers(GM1, "host") == 0).await);
}

#[test_log::test(tokio::test)]
async fn test_check_result_is_sent_back() {
    let broker = MemoryBroker::new();
    broker.add_server(GM1);
    let pool = start(&broker, config(&[GM1])).await;

    submit_service_check(&broker, GM1, "/bin/sh -c \"echo hi; exit 2\"");
    assert!(broker.wait_for_queued(GM1, RESULTS, 1, WAIT).await);

    let results = decode_results(&broker, GM1);
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result["host_name"], "web1");
    assert_eq!(result["service_description"], "http");
    assert_eq!(result["return_code"], "2");
    assert_eq!(result["output"], "hi");
    assert_eq!(result["source"], "gearcheck worker @ node1");

    assert!(eventually(|| broker.completed(GM1).len() == 1).await);
    assert_eq!(broker.completed(GM1)[0].1, b"OK".to_vec());

    pool.control.send(Control::Shutdown).await.unwrap();
    assert_ok!(pool.handle.await.unwrap());
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_running_job() {
    let broker = MemoryBroker::new();
    broker.add_server(GM1);
    let pool = start(&broker, config(&[GM1])).await;

    submit_service_check(&broker, GM1, "/bin/sh -c \"sleep 1; echo done\"");
    assert!(eventually(|| broker.queued(GM1, "service").is_empty()).await);

    pool.control.send(Control::GracefulShutdown).await.unwrap();
    assert_ok!(pool.handle.await.unwrap());

    let results = decode_results(&broker, GM1);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["output"], "done");
    assert_eq!(results[0]["return_code"], "0");
}

#[tokio::test]
async fn test_unreachable_duplicate_does_not_block_results() {
    let broker = MemoryBroker::new();
    broker.add_server(GM1);
    broker.set_reachable(DUP, false);
    let config = config(&[GM1]).with_dupserver(vec![DUP.into()]);
    let pool = start(&broker, config).await;

    submit_service_check(&broker, GM1, "/bin/echo primary");
    assert!(broker.wait_for_queued(GM1, RESULTS, 1, WAIT).await);
    assert_eq!(decode_results(&broker, GM1)[0]["output"], "primary");
    assert!(broker.queued(DUP, RESULTS).is_empty());

    pool.control.send(Control::Shutdown).await.unwrap();
    assert_ok!(pool.handle.await.unwrap());
}

#[tokio::test]
async fn test_duplicate_broker_receives_result() {
    let broker = MemoryBroker::new();
    broker.add_server(GM1);
    broker.add_server(DUP);
    let config = config(&[GM1]).with_dupserver(vec![DUP.into()]);
    let pool = start(&broker, config).await;

    submit_service_check(&broker, GM1, "/bin/echo copied");
    assert!(broker.wait_for_queued(GM1, RESULTS, 1, WAIT).await);
    assert!(broker.wait_for_queued(DUP, RESULTS, 1, WAIT).await);

    let duplicate = &decode_results(&broker, DUP)[0];
    assert_eq!(duplicate["output"], "copied");
    assert_eq!(duplicate["type"], "passive");

    pool.control.send(Control::Shutdown).await.unwrap();
    assert_ok!(pool.handle.await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_workers_follow_broker_reachability() {
    let broker = MemoryBroker::new();
    broker.add_server(GM1);
    broker.add_server(GM2);
    let pool = start(&broker, config(&[GM1, GM2])).await;

    assert!(eventually(|| broker.subscribers(GM2, "host") == 2).await);

    broker.set_reachable(GM2, false);
    assert!(eventually(|| pool.state.active_servers() == vec![GM1.to_string()]).await);
    assert!(eventually(|| broker.subscribers(GM2, "host") == 0).await);
    assert!(eventually(|| broker.subscribers(GM1, "host") >= 2).await);

    broker.set_reachable(GM2, true);
    assert!(eventually(|| pool.state.active_servers().len() == 2).await);
    assert!(eventually(|| broker.subscribers(GM2, "host") >= 2).await);

    pool.control.send(Control::Shutdown).await.unwrap();
    assert_ok!(pool.handle.await.unwrap());
}

#[tokio::test]
async fn test_queue_change_requests_restart() {
    let broker = MemoryBroker::new();
    broker.add_server(GM1);
    let pool = start(&broker, config(&[GM1])).await;
    assert!(eventually(|| pool.state.worker_count() == 2).await);

    let mut next = config(&[GM1]);
    next.hostgroups = vec!["linux".into()];
    pool.control
        .send(Control::Reload(Box::new(next)))
        .await
        .unwrap();

    let exit = assert_ok!(pool.handle.await.unwrap());
    match exit {
        PoolExit::Restart {
            config,
            initial_start,
        } => {
            assert_eq!(config.hostgroups, vec!["linux"]);
            assert_eq!(initial_start, 2);
        }
        other => panic!("expected restart, got {:?}", other),
    }
    assert!(eventually(|| broker.subscribers(GM1, "host") == 0).await);
    assert_eq!(broker.subscribers(GM1, "service"), 0);
}

#[tokio::test]
async fn test_pool_refuses_encryption_without_key() {
    let broker = MemoryBroker::new();
    broker.add_server(GM1);
    let mut config = config(&[GM1]);
    config.encryption = true;

    let result =
        WorkerPool::start(config, Arc::new(broker), Arc::new(FixedProbe::idle())).await;
    assert_err!(result);
}

#[test_log::test(tokio::test)]
async fn test_reloaded_key_reaches_workers_and_result_senders() {
    let broker = MemoryBroker::new();
    broker.add_server(GM1);
    broker.add_server(DUP);
    let keyed = |key: &str| {
        config(&[GM1])
            .with_dupserver(vec![DUP.to_string()])
            .with_key(key)
    };
    let pool = start(&broker, keyed("old")).await;
    assert!(eventually(|| pool.state.worker_count() == 2).await);

    pool.control
        .send(Control::Reload(Box::new(keyed("rotated"))))
        .await
        .unwrap();
    // a soft reload keeps the pool running; give it a moment to apply
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pool.handle.is_finished());

    let rotated = PayloadCodec::encrypted(&EncryptionKey::from_secret("rotated"));
    let request = Request::new(JobType::Service, "/bin/sh -c \"echo rotated\"")
        .with_host("web1")
        .with_service("http")
        .with_result_queue(RESULTS);
    broker
        .submit(GM1, "service", rotated.encode(request.to_text().as_bytes()))
        .unwrap();

    for address in [GM1, DUP] {
        assert!(broker.wait_for_queued(address, RESULTS, 1, WAIT).await, "{}", address);
        let payload = broker.queued(address, RESULTS).remove(0);
        let text = rotated.decode(&payload).unwrap();
        let fields = parse_fields(&String::from_utf8_lossy(&text));
        assert_eq!(fields["host_name"], "web1", "{}", address);
        assert_eq!(fields["output"], "rotated", "{}", address);
    }
    assert!(broker.failed(GM1).is_empty());

    pool.control.send(Control::Shutdown).await.unwrap();
    assert_ok!(pool.handle.await.unwrap());
}
