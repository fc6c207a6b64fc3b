//! Firecracker management API client.
//!
//! Speaks HTTP/1.1 over the VM's API Unix socket to pause and resume vCPUs
//! and to drive the balloon device.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::vm::{BalloonDevice, VcpuControl};

/// Default timeout for Firecracker API requests.
///
/// API calls are local socket RPCs; one that takes this long means the
/// VMM is stuck.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Firecracker API client for one VM.
pub struct FirecrackerApi {
    socket_path: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
    request_timeout: Duration,
    /// Cleared once the VM reports balloon statistics as disabled.
    stats_enabled: AtomicBool,
}

#[derive(Serialize)]
struct VmStatePatch {
    state: &'static str,
}

#[derive(Serialize)]
struct BalloonPatch {
    amount_mib: u32,
}

#[derive(Debug, Deserialize)]
struct BalloonConfig {
    amount_mib: u32,
}

#[derive(Deserialize)]
struct BalloonStats {
    actual_mib: u32,
}

impl FirecrackerApi {
    /// Create a client for the API socket at `socket_path`.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stats_enabled: AtomicBool::new(true),
        }
    }

    /// Return a client with a different request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Send a request and return the response body.
    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let req = Request::builder()
            .method(method.clone())
            .uri(hyper::Uri::from(UnixUri::new(&self.socket_path, path)))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Full::new(body.map(Bytes::from).unwrap_or_default()))
            .map_err(|e| Error::Http(e.to_string()))?;

        let resp = tokio::time::timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "firecracker API {} {} after {:?}",
                    method, path, self.request_timeout
                ))
            })?
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::Api {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }

    async fn patch<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        self.send(Method::PATCH, path, Some(serde_json::to_vec(body)?))
            .await
            .map(|_| ())
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let bytes = self.send(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl VcpuControl for FirecrackerApi {
    async fn pause(&self) -> Result<()> {
        self.patch("/vm", &VmStatePatch { state: "Paused" }).await
    }

    async fn resume(&self) -> Result<()> {
        self.patch("/vm", &VmStatePatch { state: "Resumed" }).await
    }
}

#[async_trait]
impl BalloonDevice for FirecrackerApi {
    async fn target_mib(&self) -> Result<u32> {
        let config: BalloonConfig = self.get("/balloon").await?;
        Ok(config.amount_mib)
    }

    async fn set_target_mib(&self, mib: u32) -> Result<()> {
        self.patch("/balloon", &BalloonPatch { amount_mib: mib }).await
    }

    async fn actual_mib(&self) -> Result<u32> {
        if self.stats_enabled.load(Ordering::Relaxed) {
            match self.get::<BalloonStats>("/balloon/statistics").await {
                Ok(stats) => return Ok(stats.actual_mib),
                // Statistics are disabled when the device was created with
                // stats_polling_interval_s = 0.
                Err(Error::Api { status: 400, .. }) => {
                    tracing::debug!(
                        socket = %self.socket_path.display(),
                        "balloon statistics disabled, using configured amount"
                    );
                    self.stats_enabled.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        self.target_mib().await
    }
}
