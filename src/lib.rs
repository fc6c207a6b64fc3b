//! agentvm - agent runtime controller for Firecracker microVMs.
//!
//! An agent running inside a microVM spends most of its wall-clock time
//! waiting on an external LLM. agentvm parks the VM for the duration of
//! that wait (optional guest quiescence, balloon inflation with host page
//! reclaim, vCPU pause) and delivers the LLM response back into the guest
//! over vsock, optionally resuming the VM afterwards.
//!
//! # Architecture
//!
//! - [`vm`]: collaborator interfaces and their Firecracker backends
//! - [`runtime`]: per-VM state machine, pending request registry, response
//!   relay and the supervisor that owns them
//! - [`api`]: HTTP management API
//! - [`config`]: TOML configuration

#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod error;
pub mod process;
pub mod runtime;
pub mod util;
pub mod vm;

pub use config::{AgentvmConfig, RuntimeConfig, VmSpec};
pub use error::{Error, Result};
pub use runtime::{RuntimeError, RuntimeSupervisor};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
