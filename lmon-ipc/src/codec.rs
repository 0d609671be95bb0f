//! Wire codec: envelope header text frame and bincode-encoded typed bodies.
//!
//! The header frame is a flat JSON-like object of opaque string keys and
//! values (no nesting, no escapes; senders must keep `"` out of values).
//! The parser is deliberately lenient: anything without outer braces yields
//! an empty map rather than failing the whole message. The body frame is a
//! length-prefixed binary record; every body embeds a copy of the envelope
//! header so receivers can cross-check routing in-band.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use lmon_utils::BgrFrame;
use serde::{Deserialize, Serialize};

use crate::message::{ControlCode, IpcMessage, MessageType};
use crate::{BusError, MESSAGE_TYPE_KEY, SYSTEM_ID_KEY, TIMESTAMP_KEY};
use crate::{TOPIC_CONTROL, TOPIC_MESSAGE, TOPIC_RESULTS};

/// Header copy embedded in every body record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    pub message_type: i32,
    pub timestamp_ms: i64,
    pub system_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireImageBody {
    header: WireHeader,
    bytes: Vec<u8>,
    rows: i32,
    cols: i32,
    pixel_type: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireControlBody {
    header: WireHeader,
    control_code: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireResultBody {
    header: WireHeader,
    values: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSimpleBody {
    header: WireHeader,
}

/// Milliseconds since the Unix epoch.
pub fn now_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Topic a message type is published under.
pub fn topic_for(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Results => TOPIC_RESULTS,
        MessageType::Control => TOPIC_CONTROL,
        _ => TOPIC_MESSAGE,
    }
}

/// Encode a header map as a flat `{"key":"value",...}` object.
pub fn encode_header_map(map: &BTreeMap<String, String>) -> String {
    let mut out = String::from("{");
    let mut first = true;
    for (key, value) in map {
        if !first {
            out.push(',');
        }
        out.push('"');
        out.push_str(key);
        out.push_str("\":\"");
        out.push_str(value);
        out.push('"');
        first = false;
    }
    out.push('}');
    out
}

/// Parse a flat header object leniently.
///
/// Missing outer braces produce an empty map; a structural error mid-way
/// keeps whatever parsed cleanly before it. The message is never failed
/// over its header frame.
pub fn parse_header_map(text: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();

    let trimmed = text.trim();
    if trimmed.len() < 2 || !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        if !trimmed.is_empty() {
            warn!("header frame is not a braced object; ignoring");
        }
        return properties;
    }

    let content = &trimmed[1..trimmed.len() - 1];
    let bytes = content.as_bytes();
    let mut pos = 0usize;

    while pos < bytes.len() {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        if bytes[pos] != b'"' {
            warn!("expected '\"' at header key start; stopping parse");
            break;
        }
        pos += 1;

        let Some(key_end) = content[pos..].find('"').map(|i| pos + i) else {
            warn!("unterminated header key; stopping parse");
            break;
        };
        let key = &content[pos..key_end];
        pos = key_end + 1;

        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b':') {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] != b'"' {
            warn!("expected '\"' at header value start; stopping parse");
            break;
        }
        pos += 1;

        let Some(value_end) = content[pos..].find('"').map(|i| pos + i) else {
            warn!("unterminated header value; stopping parse");
            break;
        };
        let value = &content[pos..value_end];
        pos = value_end + 1;

        properties.insert(key.to_string(), value.to_string());

        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b',') {
            pos += 1;
        }
    }

    properties
}

/// Serialize a message into its (topic, header map, body payload) frames.
pub fn serialize_message(
    message: &IpcMessage,
    system_id: &str,
) -> Result<(String, BTreeMap<String, String>, Vec<u8>), BusError> {
    let message_type = message.message_type();
    let timestamp_ms = now_timestamp_ms();

    let mut headers = BTreeMap::new();
    headers.insert(SYSTEM_ID_KEY.to_string(), system_id.to_string());
    headers.insert(
        MESSAGE_TYPE_KEY.to_string(),
        message_type.as_wire().to_string(),
    );
    headers.insert(TIMESTAMP_KEY.to_string(), timestamp_ms.to_string());

    let header = WireHeader {
        message_type: message_type.as_wire(),
        timestamp_ms,
        system_id: system_id.to_string(),
    };

    let payload = match message {
        IpcMessage::CameraImage(frame) | IpcMessage::CameraPreImage(frame) => {
            let body = WireImageBody {
                header,
                bytes: packed_frame_bytes(frame),
                rows: frame.rows() as i32,
                cols: frame.cols() as i32,
                pixel_type: frame.pixel_type(),
            };
            bincode::serialize(&body)
        }
        IpcMessage::Control(code) => bincode::serialize(&WireControlBody {
            header,
            control_code: code.as_wire(),
        }),
        IpcMessage::Results(values) => bincode::serialize(&WireResultBody {
            header,
            values: values.clone(),
        }),
        IpcMessage::Shutdown | IpcMessage::RequestForCameraImage | IpcMessage::Unknown => {
            bincode::serialize(&WireSimpleBody { header })
        }
    }
    .map_err(|e| BusError::Transport(format!("body serialization failed: {e}")))?;

    Ok((topic_for(message_type).to_string(), headers, payload))
}

/// Rebuild a typed message from a body payload. The caller owns the result.
pub fn decode_message(message_type: MessageType, payload: &[u8]) -> Result<IpcMessage, BusError> {
    match message_type {
        MessageType::CameraImage | MessageType::CameraPreImage => {
            let body: WireImageBody = deserialize_body(payload)?;
            check_embedded_header(&body.header, message_type);
            let rows = usize::try_from(body.rows)
                .map_err(|_| BusError::InvalidMessage("negative image rows".into()))?;
            let cols = usize::try_from(body.cols)
                .map_err(|_| BusError::InvalidMessage("negative image cols".into()))?;
            let frame = BgrFrame::from_parts(rows, cols, cols * 3, body.pixel_type, body.bytes)
                .ok_or_else(|| {
                    BusError::InvalidMessage(format!(
                        "image body geometry does not match payload ({rows}x{cols})"
                    ))
                })?;
            Ok(match message_type {
                MessageType::CameraImage => IpcMessage::CameraImage(frame),
                _ => IpcMessage::CameraPreImage(frame),
            })
        }
        MessageType::Control => {
            let body: WireControlBody = deserialize_body(payload)?;
            check_embedded_header(&body.header, message_type);
            Ok(IpcMessage::Control(ControlCode::from_wire(
                body.control_code,
            )))
        }
        MessageType::Results => {
            let body: WireResultBody = deserialize_body(payload)?;
            check_embedded_header(&body.header, message_type);
            Ok(IpcMessage::Results(body.values))
        }
        MessageType::Shutdown => {
            let body: WireSimpleBody = deserialize_body(payload)?;
            check_embedded_header(&body.header, message_type);
            Ok(IpcMessage::Shutdown)
        }
        MessageType::RequestForCameraImage => {
            let body: WireSimpleBody = deserialize_body(payload)?;
            check_embedded_header(&body.header, message_type);
            Ok(IpcMessage::RequestForCameraImage)
        }
        MessageType::Unknown => Err(BusError::InvalidMessage(
            "cannot decode message of unknown type".into(),
        )),
    }
}

fn deserialize_body<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, BusError> {
    bincode::deserialize(payload)
        .map_err(|e| BusError::InvalidMessage(format!("body deserialization failed: {e}")))
}

fn check_embedded_header(header: &WireHeader, envelope_type: MessageType) {
    if header.message_type != envelope_type.as_wire() {
        warn!(
            "body header declares type {} but envelope routed it as {}",
            header.message_type,
            envelope_type.as_wire()
        );
    }
}

/// Copy out the frame's pixel bytes without stride padding.
fn packed_frame_bytes(frame: &BgrFrame) -> Vec<u8> {
    let row_len = frame.cols() * 3;
    if frame.stride() == row_len {
        return frame.bytes().to_vec();
    }
    let mut packed = Vec::with_capacity(row_len * frame.rows());
    for r in 0..frame.rows() {
        packed.extend_from_slice(frame.row(r));
    }
    packed
}
