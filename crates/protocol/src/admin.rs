//! Admin status line protocol
//!
//! The broker's admin port answers `status\nversion\n` with one row per
//! queue (`name total running available_workers`), a terminating `.` line
//! and finally `OK <version>`.

use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Default broker port
pub const DEFAULT_PORT: u16 = 4730;

/// Command sent to the admin port
pub const STATUS_COMMAND: &str = "status\nversion\n";

/// One row of the admin status table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub total: i64,
    pub running: i64,
    pub waiting: i64,
    pub available_workers: i64,
}

/// Parsed admin status response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub queues: Vec<QueueStatus>,
    /// Broker version prefixed with `v`, when reported
    pub version: Option<String>,
}

/// Append the default port to an address that has none
///
/// An empty host part becomes `0.0.0.0`.
pub fn with_default_port(address: &str) -> String {
    let address = address.trim();
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (host, port.to_string()),
        None => (address, DEFAULT_PORT.to_string()),
    };
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    format!("{}:{}", host, port)
}

/// True once the response holds the version line that ends it
pub fn is_complete(payload: &str) -> bool {
    payload
        .lines()
        .any(|line| line.starts_with("OK ") || line.starts_with("ERR "))
}

/// Parse a status/version response
pub fn parse_status(payload: &str) -> Result<ServerStatus> {
    let mut status = ServerStatus::default();

    for row in payload.lines() {
        let columns: Vec<&str> = row.split_whitespace().collect();

        if columns.len() == 2 && columns[0] == "OK" {
            status.version = Some(format!("v{}", columns[1]));
            continue;
        }
        if columns.len() < 4 {
            continue;
        }

        let number = |i: usize| -> Result<i64> {
            columns[i].parse().map_err(|_| {
                ProtocolError::admin(format!("the received data is not in the right format: {}", row))
            })
        };
        let total = number(1)?;
        let running = number(2)?;
        let available_workers = number(3)?;

        if columns[0] == "dummy" && total == 0 {
            continue;
        }

        status.queues.push(QueueStatus {
            name: columns[0].to_string(),
            total,
            running,
            waiting: total - running,
            available_workers,
        });
    }

    status.queues.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(status)
}

/// Render the status as a fixed-width text table
pub fn render_table(address: &str, status: &ServerStatus) -> String {
    let width = status
        .queues
        .iter()
        .map(|q| q.name.len())
        .max()
        .unwrap_or(0)
        .max("Queue Name".len());

    let mut out = format!(
        "{} {}\n",
        address,
        status.version.as_deref().unwrap_or("")
    );
    out.push_str(&format!(
        "{:<width$} | {:>16} | {:>12} | {:>12}\n",
        "Queue Name",
        "Worker Available",
        "Jobs Waiting",
        "Jobs Running",
        width = width
    ));
    out.push_str(&format!("{}\n", "-".repeat(width + 49)));
    if status.queues.is_empty() {
        out.push_str("no queues found\n");
    }
    for q in &status.queues {
        out.push_str(&format!(
            "{:<width$} | {:>16} | {:>12} | {:>12}\n",
            q.name,
            q.available_workers,
            q.waiting,
            q.running,
            width = width
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = "service\t5\t2\t3\nhost\t0\t0\t3\ndummy\t0\t0\t1\nworker_lab01\t0\t0\t1\n.\nOK 1.1.21\n";

    #[test]
    fn test_parse_status() {
        let status = parse_status(RESPONSE).unwrap();

        assert_eq!(status.version.as_deref(), Some("v1.1.21"));
        let names: Vec<&str> = status.queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["host", "service", "worker_lab01"]);

        let service = &status.queues[1];
        assert_eq!(service.total, 5);
        assert_eq!(service.running, 2);
        assert_eq!(service.waiting, 3);
        assert_eq!(service.available_workers, 3);
    }

    #[test]
    fn test_dummy_queue_kept_when_busy() {
        let status = parse_status("dummy 2 1 0\n").unwrap();
        assert_eq!(status.queues.len(), 1);
    }

    #[test]
    fn test_parse_status_rejects_garbage_numbers() {
        assert!(parse_status("service x 1 2\n").is_err());
    }

    #[test]
    fn test_is_complete() {
        assert!(!is_complete("service 1 0 1\n.\n"));
        assert!(is_complete(RESPONSE));
    }

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("gearmand"), "gearmand:4730");
        assert_eq!(with_default_port("gearmand:4731"), "gearmand:4731");
        assert_eq!(with_default_port(":4730"), "0.0.0.0:4730");
        assert_eq!(with_default_port(""), "0.0.0.0:4730");
    }

    #[test]
    fn test_render_table_lists_queues() {
        let status = parse_status(RESPONSE).unwrap();
        let table = render_table("localhost:4730", &status);
        assert!(table.starts_with("localhost:4730 v1.1.21\n"));
        assert!(table.contains("service"));
        assert!(!table.contains("dummy"));
    }
}
