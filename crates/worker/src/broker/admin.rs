//! Admin port status query

use std::time::Duration;

use gearcheck_protocol::admin::{is_complete, parse_status, STATUS_COMMAND};
use gearcheck_protocol::ServerStatus;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{BrokerError, Result};

/// Ask a broker for its queue table
pub async fn query_status(address: &str, timeout: Duration) -> Result<ServerStatus> {
    let payload = tokio::time::timeout(timeout, fetch(address))
        .await
        .map_err(|_| BrokerError::Timeout(timeout))??;
    Ok(parse_status(&payload)?)
}

async fn fetch(address: &str) -> Result<String> {
    let mut stream = TcpStream::connect(address)
        .await
        .map_err(|e| BrokerError::connect(address, e))?;
    stream.write_all(STATUS_COMMAND.as_bytes()).await?;

    let mut payload = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        payload.extend_from_slice(&buf[..n]);
        if is_complete(&String::from_utf8_lossy(&payload)) {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&payload).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_query_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], STATUS_COMMAND.as_bytes());
            stream
                .write_all(b"host\t2\t1\t4\nservice\t0\t0\t4\n.\n")
                .await
                .unwrap();
            stream.write_all(b"OK 1.1.21\n").await.unwrap();
            // keep the connection open; the reader must stop on the version line
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let status = query_status(&address, Duration::from_secs(2)).await.unwrap();
        assert_eq!(status.version.as_deref(), Some("v1.1.21"));
        assert_eq!(status.queues.len(), 2);
        assert_eq!(status.queues[0].name, "host");
        assert_eq!(status.queues[0].waiting, 1);
    }

    #[tokio::test]
    async fn test_query_status_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = query_status(&address, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Connect { .. }));
    }
}
