//! Protocol types for agentvm host-guest communication.
//!
//! Messages travel over a vsock byte stream as newline-delimited JSON:
//! one object per line, tagged by `type`. JSON string escaping guarantees
//! that an encoded message never contains a raw newline, so a guest can
//! split the stream on `\n` and route each frame by its `request_id`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum size of a single encoded frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Well-known guest vsock ports.
pub mod ports {
    /// Default port the guest listens on for LLM responses.
    pub const LLM_RESPONSE: u32 = 11000;

    /// Port the guest agent listens on for quiescence requests.
    pub const QUIESCENCE: u32 = 10999;
}

/// Messages sent from the host to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Response to a pending LLM request.
    LlmResponse {
        /// Identifier of the request this response answers.
        request_id: String,
        /// Opaque response payload.
        response: String,
    },

    /// Ask the guest to stop active work before the host parks it.
    Quiesce,

    /// Tell the guest that a quiesced wait has ended.
    Resume,
}

/// Messages sent from the guest to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    /// The guest has stopped active work.
    Quiesced,

    /// The guest refused or failed to quiesce.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame was not valid JSON for the expected message type.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),

    /// The frame was empty.
    #[error("empty frame")]
    Empty,
}

/// Encode a message as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, DecodeError> {
    let mut buf = serde_json::to_vec(msg)?;
    if buf.len() + 1 > MAX_FRAME_SIZE {
        return Err(DecodeError::TooLarge(buf.len() + 1));
    }
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one line (with or without its trailing newline).
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a [u8]) -> Result<T, DecodeError> {
    if line.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::TooLarge(line.len()));
    }
    let line = line
        .strip_suffix(b"\n")
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(line)?)
}

/// Build the frame that delivers `response` for `request_id`.
pub fn llm_response_frame(request_id: &str, response: &str) -> Result<Vec<u8>, DecodeError> {
    encode_line(&HostMessage::LlmResponse {
        request_id: request_id.to_string(),
        response: response.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_response_frame_is_single_tagged_line() {
        let frame = llm_response_frame("req-1", "{\"content\":\"hello\"}\nsecond line").unwrap();
        let text = String::from_utf8(frame.clone()).unwrap();

        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1, "payload newline must be escaped");
        assert!(text.contains("\"type\":\"llm_response\""));
        assert!(text.contains("req-1"));
        assert!(text.contains("hello"));

        let decoded: HostMessage = decode_line(&frame).unwrap();
        assert_eq!(
            decoded,
            HostMessage::LlmResponse {
                request_id: "req-1".into(),
                response: "{\"content\":\"hello\"}\nsecond line".into(),
            }
        );
    }

    #[test]
    fn test_unit_messages_wire_format() {
        assert_eq!(encode_line(&HostMessage::Quiesce).unwrap(), b"{\"type\":\"quiesce\"}\n");
        assert_eq!(encode_line(&HostMessage::Resume).unwrap(), b"{\"type\":\"resume\"}\n");

        let ack: GuestMessage = decode_line(b"{\"type\":\"quiesced\"}\r\n").unwrap();
        assert_eq!(ack, GuestMessage::Quiesced);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(matches!(
            decode_line::<GuestMessage>(b"\n"),
            Err(DecodeError::Empty)
        ));
        assert!(matches!(
            decode_line::<GuestMessage>(b"not json\n"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_line::<GuestMessage>(b"{\"type\":\"bogus\"}\n"),
            Err(DecodeError::Json(_))
        ));
    }
}
