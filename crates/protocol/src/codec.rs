//! Frame encode/decode.
//!
//! Decoding is two-phase: probe the `type` discriminator first, then parse
//! the concrete frame shape. An unrecognized discriminator is a distinct
//! error from malformed JSON so the connection layer can choose to ignore
//! the frame instead of treating it as corruption.

use serde_json::Value;
use thiserror::Error;

use crate::{EventBody, Frame, RequestBody, ResponseBody};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no `type` discriminator")]
    MissingType,

    #[error("unknown frame type `{frame_type}`")]
    UnknownFrameType { frame_type: String },
}

/// Serialize a frame to its JSON wire form.
pub fn encode_frame(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Parse one wire frame.
///
/// Integer and floating-point payload values survive the round trip
/// distinctly (`serde_json::Number` keeps them apart), which the protocol
/// relies on: epoch timestamps are doubles, sequence numbers are integers.
pub fn decode_frame(raw: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(DecodeError::MissingType)?;

    match frame_type.as_str() {
        "req" => Ok(Frame::Request(serde_json::from_value::<RequestBody>(
            value,
        )?)),
        "res" => Ok(Frame::Response(serde_json::from_value::<ResponseBody>(
            value,
        )?)),
        "event" => Ok(Frame::Event(serde_json::from_value::<EventBody>(value)?)),
        _ => Err(DecodeError::UnknownFrameType { frame_type }),
    }
}
