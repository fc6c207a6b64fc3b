//! Firecracker hybrid vsock transport.
//!
//! Firecracker exposes a guest's vsock device on the host as a Unix socket.
//! A host-initiated connection writes `CONNECT <port>\n` and the VMM answers
//! `OK <host_port>\n` once a guest listener on `<port>` accepted it.
//! Everything after that line is the raw byte stream.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::vm::{GuestStream, GuestTransport};

/// Longest handshake reply accepted from the VMM.
const MAX_HANDSHAKE_LEN: usize = 64;

/// Transport over a Firecracker hybrid vsock socket.
#[derive(Debug, Clone)]
pub struct HybridVsock {
    uds_path: PathBuf,
    handshake_timeout: Duration,
}

impl HybridVsock {
    /// Create a transport for the vsock socket at `uds_path`.
    pub fn new(uds_path: impl AsRef<Path>, handshake_timeout: Duration) -> Self {
        Self {
            uds_path: uds_path.as_ref().to_path_buf(),
            handshake_timeout,
        }
    }

    async fn handshake(&self, port: u32) -> Result<UnixStream> {
        let mut stream = UnixStream::connect(&self.uds_path).await?;
        stream
            .write_all(format!("CONNECT {}\n", port).as_bytes())
            .await?;

        // Read byte-wise so no guest data past the reply line is consumed.
        let mut reply = Vec::with_capacity(16);
        loop {
            let b = stream.read_u8().await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::protocol(format!("no guest listener on vsock port {}", port))
                } else {
                    Error::Io(e)
                }
            })?;
            if b == b'\n' {
                break;
            }
            reply.push(b);
            if reply.len() > MAX_HANDSHAKE_LEN {
                return Err(Error::protocol("vsock handshake reply too long"));
            }
        }

        let reply = String::from_utf8_lossy(&reply);
        if !reply.starts_with("OK ") {
            return Err(Error::protocol(format!(
                "vsock CONNECT {} rejected: {}",
                port,
                reply.trim()
            )));
        }
        Ok(stream)
    }
}

#[async_trait]
impl GuestTransport for HybridVsock {
    async fn connect(&self, port: u32) -> Result<GuestStream> {
        let stream = tokio::time::timeout(self.handshake_timeout, self.handshake(port))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "vsock CONNECT {} via {} after {:?}",
                    port,
                    self.uds_path.display(),
                    self.handshake_timeout
                ))
            })??;
        tracing::debug!(uds = %self.uds_path.display(), port, "vsock connected");
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    /// Fake VMM muxer: accepts CONNECT for `open_port` only and returns the
    /// first line written afterwards.
    fn spawn_fake_muxer(path: &Path, open_port: u32) -> tokio::task::JoinHandle<Option<String>> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.ok()?;
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                reader.read_line(&mut line).await.ok()?;
                if line.trim() != format!("CONNECT {}", open_port) {
                    // Refuse by closing the connection
                    continue;
                }
                reader.get_mut().write_all(b"OK 1073741824\n").await.ok()?;
                let mut payload = String::new();
                reader.read_line(&mut payload).await.ok()?;
                return Some(payload);
            }
        })
    }

    #[tokio::test]
    async fn test_connect_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let uds = dir.path().join("v.sock");
        let muxer = spawn_fake_muxer(&uds, 11000);

        let transport = HybridVsock::new(&uds, Duration::from_secs(2));
        let mut stream = transport.connect(11000).await.unwrap();
        stream.write_all(b"{\"type\":\"resume\"}\n").await.unwrap();

        assert_eq!(
            muxer.await.unwrap().as_deref(),
            Some("{\"type\":\"resume\"}\n")
        );
    }

    #[tokio::test]
    async fn test_closed_port_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let uds = dir.path().join("v.sock");
        let _muxer = spawn_fake_muxer(&uds, 11000);

        let transport = HybridVsock::new(&uds, Duration::from_secs(2));
        let err = transport.connect(12345).await.err().unwrap();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn test_missing_socket_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = HybridVsock::new(dir.path().join("absent.sock"), Duration::from_secs(1));
        assert!(matches!(transport.connect(11000).await, Err(Error::Io(_))));
    }
}
