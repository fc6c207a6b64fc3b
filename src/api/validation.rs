//! Shared API validation utilities.

use crate::api::error::ApiError;
use crate::api::types::{RegisterVmRequest, SetRuntimeStateRequest, SubmitResponseRequest};
use crate::process;
use crate::runtime::{ExpectedResponse, SetStateOptions};

/// Maximum VM name length.
pub const MAX_VM_NAME_LEN: usize = 64;

/// Maximum request id length.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Validate a VM name.
///
/// Rules:
/// - Length: 1..=max_len characters
/// - Allowed characters: alphanumeric, hyphen (-), underscore (_)
/// - Must start with a letter or digit
/// - Cannot end with a hyphen
/// - No consecutive hyphens
/// - No path separators (/, \)
pub fn validate_vm_name(name: &str, max_len: usize) -> Result<(), ApiError> {
    let first_char = name
        .chars()
        .next()
        .ok_or_else(|| ApiError::BadRequest("VM name cannot be empty".into()))?;

    if name.len() > max_len {
        return Err(ApiError::BadRequest(format!(
            "VM name too long: {} characters (max {})",
            name.len(),
            max_len
        )));
    }

    if !first_char.is_ascii_alphanumeric() {
        return Err(ApiError::BadRequest(
            "VM name must start with a letter or digit".into(),
        ));
    }

    if name.ends_with('-') {
        return Err(ApiError::BadRequest(
            "VM name cannot end with a hyphen".into(),
        ));
    }

    let mut prev_was_hyphen = false;
    for c in name.chars() {
        if c == '-' {
            if prev_was_hyphen {
                return Err(ApiError::BadRequest(
                    "VM name cannot contain consecutive hyphens".into(),
                ));
            }
            prev_was_hyphen = true;
        } else {
            prev_was_hyphen = false;
        }

        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            if c == '/' || c == '\\' {
                return Err(ApiError::BadRequest(
                    "VM name cannot contain path separators".into(),
                ));
            }
            return Err(ApiError::BadRequest(format!(
                "VM name contains invalid character: '{}'",
                c
            )));
        }
    }

    Ok(())
}

/// Validate a caller-chosen request id.
///
/// Ids are opaque but must be non-empty, printable and bounded.
pub fn validate_request_id(request_id: &str) -> Result<(), ApiError> {
    if request_id.is_empty() {
        return Err(ApiError::BadRequest("request_id cannot be empty".into()));
    }
    if request_id.len() > MAX_REQUEST_ID_LEN {
        return Err(ApiError::BadRequest(format!(
            "request_id too long: {} bytes (max {})",
            request_id.len(),
            MAX_REQUEST_ID_LEN
        )));
    }
    if request_id.chars().any(char::is_control) {
        return Err(ApiError::BadRequest(
            "request_id cannot contain control characters".into(),
        ));
    }
    Ok(())
}

/// Validate a guest vsock port.
pub fn validate_port(port: u32, field: &str) -> Result<(), ApiError> {
    if port == 0 {
        return Err(ApiError::BadRequest(format!("{} cannot be 0", field)));
    }
    Ok(())
}

/// Validate a registration request.
pub fn validate_register(req: &RegisterVmRequest) -> Result<(), ApiError> {
    validate_vm_name(&req.name, MAX_VM_NAME_LEN)?;
    if req.api_socket.is_empty() || req.vsock_uds.is_empty() {
        return Err(ApiError::BadRequest(
            "api_socket and vsock_uds are required".into(),
        ));
    }
    if req.mem_size_mib == 0 {
        return Err(ApiError::BadRequest("mem_size_mib must be positive".into()));
    }
    if let Some(baseline) = req.balloon_baseline_mib {
        if baseline >= req.mem_size_mib {
            return Err(ApiError::BadRequest(format!(
                "balloon_baseline_mib {} must be less than mem_size_mib {}",
                baseline, req.mem_size_mib
            )));
        }
    }
    if let Some(port) = req.quiescence_port {
        validate_port(port, "quiescence_port")?;
    }
    if let Some(pid) = req.pid {
        if pid <= 0 || !process::is_alive(pid) {
            return Err(ApiError::BadRequest(format!(
                "VMM process {} is not running",
                pid
            )));
        }
    }
    Ok(())
}

/// Turn a state change request into runtime options.
///
/// Expectation fields are only meaningful for a wait; on a `Running`
/// target they are passed through so the state machine rejects them.
pub fn state_options(
    req: &SetRuntimeStateRequest,
    default_port: u32,
) -> Result<SetStateOptions, ApiError> {
    if req.expect_request_id.is_none()
        && (req.expect_vsock_port.is_some() || req.resume_on_delivery.is_some())
    {
        return Err(ApiError::BadRequest(
            "expect_vsock_port and resume_on_delivery require expect_request_id".into(),
        ));
    }

    let expect = match &req.expect_request_id {
        Some(request_id) => {
            validate_request_id(request_id)?;
            let vsock_port = req.expect_vsock_port.unwrap_or(default_port);
            validate_port(vsock_port, "expect_vsock_port")?;
            Some(ExpectedResponse {
                request_id: request_id.clone(),
                vsock_port,
                resume_on_delivery: req.resume_on_delivery.unwrap_or(false),
            })
        }
        None => None,
    };

    Ok(SetStateOptions {
        pause_on_wait: req.pause_on_wait,
        target_balloon_mib: req.target_balloon_mib,
        acknowledge_on_stop: req.acknowledge_on_stop,
        expect,
    })
}

/// Validate a response submission.
pub fn validate_submission(req: &SubmitResponseRequest) -> Result<(), ApiError> {
    validate_request_id(&req.request_id)?;
    validate_port(req.vsock_port, "vsock_port")
}
