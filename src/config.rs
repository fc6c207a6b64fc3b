//! agentvm configuration.
//!
//! Configuration is read from a TOML file (by default
//! `~/.config/agentvm/config.toml`). Every field has a default, so a missing
//! file is equivalent to an empty one.
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:8080"
//!
//! [runtime]
//! balloon_convergence_timeout = "10s"
//! quiescence_timeout = "5s"
//!
//! [[vms]]
//! name = "vm1"
//! api_socket = "/run/fc/vm1/api.sock"
//! vsock_uds = "/run/fc/vm1/v.sock"
//! mem_size_mib = 256
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config file storage.
const APP_NAME: &str = "agentvm";

/// Config file name inside the application config directory.
const CONFIG_FILENAME: &str = "config.toml";

/// Top-level agentvm configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentvmConfig {
    /// Management API server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Runtime controller timeouts and policies.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// VMs registered with the supervisor at startup.
    #[serde(default)]
    pub vms: Vec<VmSpec>,
}

/// Management API server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Upper bound on any single API request.
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Timeouts and policies for the runtime controller.
///
/// Every blocking step of a transition or delivery is bounded by one of
/// these values, so an unresponsive guest cannot wedge the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// How long to wait for the guest balloon driver to reach a new target.
    #[serde(with = "duration_str")]
    pub balloon_convergence_timeout: Duration,

    /// Interval between balloon convergence polls.
    #[serde(with = "duration_str")]
    pub balloon_poll_interval: Duration,

    /// How long to wait for a guest quiescence acknowledgement.
    #[serde(with = "duration_str")]
    pub quiescence_timeout: Duration,

    /// Total time the relay keeps retrying an unreachable guest listener.
    #[serde(with = "duration_str")]
    pub delivery_retry_budget: Duration,

    /// Pause between delivery attempts.
    #[serde(with = "duration_str")]
    pub delivery_retry_interval: Duration,

    /// Upper bound on a single connect-and-write attempt.
    #[serde(with = "duration_str")]
    pub delivery_attempt_timeout: Duration,

    /// Age after which an unclaimed pending expectation is dropped.
    /// Zero disables the sweep.
    #[serde(with = "duration_str")]
    pub pending_ttl: Duration,

    /// Interval of the background maintenance loop.
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            balloon_convergence_timeout: Duration::from_secs(10),
            balloon_poll_interval: Duration::from_millis(50),
            quiescence_timeout: Duration::from_secs(5),
            delivery_retry_budget: Duration::from_secs(5),
            delivery_retry_interval: Duration::from_millis(100),
            delivery_attempt_timeout: Duration::from_secs(2),
            pending_ttl: Duration::ZERO,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Static description of a Firecracker VM managed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmSpec {
    /// VM name, used as its `vm_id`.
    pub name: String,

    /// Firecracker management API socket.
    pub api_socket: PathBuf,

    /// Firecracker hybrid vsock Unix socket (`uds_path` of the vsock device).
    pub vsock_uds: PathBuf,

    /// PID of the Firecracker process, required for host page reclaim.
    #[serde(default)]
    pub pid: Option<i32>,

    /// Guest memory size in MiB.
    pub mem_size_mib: u32,

    /// Balloon size restored after a wait. Read from the device when unset.
    #[serde(default)]
    pub balloon_baseline_mib: Option<u32>,

    /// Guest port answering quiescence requests.
    #[serde(default = "default_quiescence_port")]
    pub quiescence_port: u32,
}

fn default_quiescence_port() -> u32 {
    agentvm_protocol::ports::QUIESCENCE
}

impl AgentvmConfig {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Load configuration.
    ///
    /// With an explicit `path` the file must exist. Without one, the default
    /// location is used and a missing file yields the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::ConfigLoad(format!("{}: {}", path.display(), e)));
            }
        };

        let config = Self::from_toml(&text)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), vms = config.vms.len(), "loaded config");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for vm in &self.vms {
            if !seen.insert(vm.name.as_str()) {
                return Err(Error::config(format!("duplicate VM name '{}'", vm.name)));
            }
            vm.validate()?;
        }

        if self.runtime.balloon_poll_interval.is_zero() {
            return Err(Error::config("runtime.balloon_poll_interval must be non-zero"));
        }
        if self.runtime.delivery_retry_interval.is_zero() {
            return Err(Error::config("runtime.delivery_retry_interval must be non-zero"));
        }
        if self.runtime.sweep_interval.is_zero() {
            return Err(Error::config("runtime.sweep_interval must be non-zero"));
        }
        Ok(())
    }
}

impl VmSpec {
    /// Check field constraints for a single VM.
    pub fn validate(&self) -> Result<()> {
        if self.mem_size_mib == 0 {
            return Err(Error::config(format!(
                "VM '{}': mem_size_mib must be non-zero",
                self.name
            )));
        }
        if let Some(baseline) = self.balloon_baseline_mib {
            if baseline >= self.mem_size_mib {
                return Err(Error::config(format!(
                    "VM '{}': balloon_baseline_mib ({}) must be below mem_size_mib ({})",
                    self.name, baseline, self.mem_size_mib
                )));
            }
        }
        Ok(())
    }
}

/// Serde adapter for humantime duration strings ("250ms", "5s", "1m").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
