//! HTTP request handlers.

pub mod health;
pub mod runtime;
pub mod vms;
