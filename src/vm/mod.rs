//! VM collaborator interfaces.
//!
//! The runtime controller never talks to a hypervisor directly. It drives
//! four narrow interfaces, one per concern, so that each VM's devices are
//! owned by that VM alone and can be replaced in tests:
//!
//! - [`VcpuControl`]: halt and resume guest execution
//! - [`BalloonDevice`]: balloon target and achieved size
//! - [`PageReclaimer`]: host-side reclaim of memory the balloon freed
//! - [`GuestTransport`]: vsock-style byte streams into the guest

pub mod backend;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Opaque, immutable VM identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(String);

impl VmId {
    /// Create a VM identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VmId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::borrow::Borrow<str> for VmId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Guest vCPU execution control.
#[async_trait]
pub trait VcpuControl: Send + Sync {
    /// Halt all guest vCPUs.
    async fn pause(&self) -> Result<()>;

    /// Resume all guest vCPUs.
    async fn resume(&self) -> Result<()>;
}

/// Balloon device management surface.
#[async_trait]
pub trait BalloonDevice: Send + Sync {
    /// Currently requested balloon size in MiB.
    async fn target_mib(&self) -> Result<u32>;

    /// Request a new balloon size in MiB.
    async fn set_target_mib(&self, mib: u32) -> Result<()>;

    /// Balloon size the guest driver has actually reached, in MiB.
    async fn actual_mib(&self) -> Result<u32>;
}

/// What the host should reclaim after a balloon inflation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimHint {
    /// Memory released by this inflation, in MiB.
    pub freed_mib: u32,
    /// Balloon size after the inflation, in MiB.
    pub balloon_mib: u32,
}

/// Host-side page reclaim.
#[async_trait]
pub trait PageReclaimer: Send + Sync {
    /// Mark guest pages released to the balloon as reclaimable.
    ///
    /// Returns the number of bytes the host accepted the hint for.
    async fn reclaim(&self, hint: ReclaimHint) -> Result<u64>;
}

/// Byte stream into a guest listener.
pub trait GuestIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> GuestIo for T {}

/// Boxed guest stream.
pub type GuestStream = Box<dyn GuestIo>;

/// VM-scoped host-to-guest transport.
#[async_trait]
pub trait GuestTransport: Send + Sync {
    /// Open a stream to the guest listener on `port`.
    ///
    /// Fails if no guest listener is bound to the port yet.
    async fn connect(&self, port: u32) -> Result<GuestStream>;
}

/// The collaborators owned by one VM.
#[derive(Clone)]
pub struct VmBackends {
    /// vCPU control.
    pub vcpu: Arc<dyn VcpuControl>,
    /// Balloon device.
    pub balloon: Arc<dyn BalloonDevice>,
    /// Host page reclaim.
    pub reclaimer: Arc<dyn PageReclaimer>,
    /// Guest transport.
    pub transport: Arc<dyn GuestTransport>,
}

impl std::fmt::Debug for VmBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmBackends").finish_non_exhaustive()
    }
}
