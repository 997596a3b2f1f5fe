//! Client for the daemon IPC interface
//!
//! One TCP connection per request; the daemon may restart between calls.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::TcpStream;

use sg_core::ipc::{read_message, write_message, DaemonRequest, DaemonResponse, DaemonStatus};
use sg_core::HostId;

/// Talks to a running gateway daemon
#[derive(Debug, Clone)]
pub struct DaemonClient {
    address: String,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn request(&self, request: DaemonRequest) -> Result<DaemonResponse> {
        let exchange = async {
            let stream = TcpStream::connect(&self.address).await.with_context(|| {
                format!("Failed to connect to daemon at {}. Is it running?", self.address)
            })?;
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);

            write_message(&mut writer, &request).await?;
            let response = read_message::<_, DaemonResponse>(&mut reader)
                .await?
                .context("Daemon closed the connection without answering")?;
            Ok::<_, anyhow::Error>(response)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .with_context(|| format!("Daemon at {} did not answer in time", self.address))?
    }

    async fn expect_ok(&self, request: DaemonRequest) -> Result<()> {
        match self.request(request).await? {
            DaemonResponse::Ok => Ok(()),
            DaemonResponse::Error { message } => anyhow::bail!("Daemon error: {}", message),
            other => anyhow::bail!("Unexpected daemon response: {:?}", other),
        }
    }

    /// Announce this host's broker server
    pub async fn active(&self, host_id: &HostId) -> Result<()> {
        self.expect_ok(DaemonRequest::Active {
            host_id: host_id.clone(),
        })
        .await
    }

    /// Withdraw this host's broker server
    pub async fn inactive(&self, host_id: &HostId) -> Result<()> {
        self.expect_ok(DaemonRequest::Inactive {
            host_id: host_id.clone(),
        })
        .await
    }

    /// Whether a daemon answers at the address
    pub async fn ping(&self) -> bool {
        matches!(
            self.request(DaemonRequest::Ping).await,
            Ok(DaemonResponse::Pong)
        )
    }

    pub async fn daemon_version(&self) -> Result<String> {
        match self.request(DaemonRequest::GetDaemonVersion).await? {
            DaemonResponse::Version { version } => Ok(version),
            other => anyhow::bail!("Unexpected daemon response: {:?}", other),
        }
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        match self.request(DaemonRequest::GetStatus).await? {
            DaemonResponse::Status(status) => Ok(status),
            other => anyhow::bail!("Unexpected daemon response: {:?}", other),
        }
    }

    /// Ask the daemon to exit
    pub async fn shutdown(&self) -> Result<()> {
        self.expect_ok(DaemonRequest::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ping_without_daemon_is_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(!DaemonClient::new(address).ping().await);
    }

    #[tokio::test]
    async fn test_error_response_is_surfaced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            assert!(line.contains("\"type\":\"active\""));
            writer
                .write_all(b"{\"type\":\"error\",\"message\":\"nope\"}\n")
                .await
                .unwrap();
        });

        let err = DaemonClient::new(address)
            .active(&HostId::new("127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
