//! Frame codec
//!
//! Turns wire bytes into [`Envelope`]s and back. Two byte encodings carry the
//! same frame array:
//! - `Json`: OCPP-J text frames
//! - `Cbor`: the identical array encoded as CBOR, for binary WebSocket frames
//!
//! Links between networking nodes may use overlay framing, which appends two
//! elements after the standard frame: the destination NodeId and the network
//! path. Positions 0-4 never move.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::messages::*;
use crate::types::{NetworkPath, NetworkingMode, NodeId};

/// Byte encoding of frames on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireFormat {
    #[default]
    Json,
    Cbor,
}

/// Routing information carried by overlay frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHeader {
    pub destination: NodeId,
    pub network_path: NetworkPath,
}

/// A decoded message plus its optional routing header
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: OcppMessage,
    pub routing: Option<RoutingHeader>,
}

impl Envelope {
    pub fn plain(message: impl Into<OcppMessage>) -> Self {
        Self {
            message: message.into(),
            routing: None,
        }
    }

    pub fn routed(message: impl Into<OcppMessage>, destination: NodeId, network_path: NetworkPath) -> Self {
        Self {
            message: message.into(),
            routing: Some(RoutingHeader {
                destination,
                network_path,
            }),
        }
    }
}

/// Why a frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("frame is not parseable: {0}")]
    Unparseable(String),

    #[error("frame is not an array")]
    NotAnArray,

    #[error("frame is empty")]
    Empty,

    #[error("message type tag missing or not an integer")]
    InvalidTypeTag,

    #[error("unsupported message type {0}")]
    UnsupportedMessageType(i64),

    #[error("message id missing, empty or not a string")]
    InvalidMessageId,

    #[error("message id longer than {MAX_MESSAGE_ID_LEN} characters")]
    MessageIdTooLong,

    #[error("expected {expected} elements, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("action missing, empty or not a string")]
    InvalidAction,

    #[error("error code must be a string")]
    InvalidErrorCode,

    #[error("error description must be a string")]
    InvalidErrorDescription,

    #[error("invalid routing header: {0}")]
    InvalidRoutingHeader(String),
}

/// Decode failure, with whatever correlation data could be recovered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{failure}")]
pub struct DecodeError {
    pub message_id: Option<String>,
    pub message_type: Option<MessageType>,
    pub failure: DecodeFailure,
}

impl DecodeError {
    fn new(message_id: Option<&str>, message_type: Option<MessageType>, failure: DecodeFailure) -> Self {
        Self {
            message_id: message_id.map(str::to_string),
            message_type,
            failure,
        }
    }

    /// RPC error code that reports this failure to the sender
    pub fn error_code(&self) -> ErrorCode {
        match self.failure {
            DecodeFailure::InvalidTypeTag | DecodeFailure::UnsupportedMessageType(_) => {
                ErrorCode::MessageTypeNotSupported
            }
            DecodeFailure::MessageIdTooLong | DecodeFailure::InvalidRoutingHeader(_) => {
                ErrorCode::ProtocolError
            }
            _ => ErrorCode::FormatViolation,
        }
    }

    /// CallError to send back, when the sender can correlate it.
    ///
    /// Responses are never answered, even malformed ones.
    pub fn reply(&self) -> Option<CallError> {
        let message_id = self.message_id.as_ref()?;
        if self.message_type.map(|t| t.is_response()).unwrap_or(false) {
            return None;
        }
        Some(CallError::new(
            message_id.clone(),
            self.error_code(),
            self.failure.to_string(),
        ))
    }
}

/// Encoding failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR encode error: {0}")]
    Cbor(String),
}

/// Parse wire bytes into a frame array
fn parse_frame(bytes: &[u8], format: WireFormat) -> Result<Vec<Value>, DecodeError> {
    let value: Value = match format {
        WireFormat::Json => serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::new(None, None, DecodeFailure::Unparseable(e.to_string())))?,
        WireFormat::Cbor => ciborium::de::from_reader(bytes)
            .map_err(|e| DecodeError::new(None, None, DecodeFailure::Unparseable(e.to_string())))?,
    };

    match value {
        Value::Array(items) => Ok(items),
        _ => Err(DecodeError::new(None, None, DecodeFailure::NotAnArray)),
    }
}

/// Decode one frame received on a link with the given framing
pub fn decode(bytes: &[u8], format: WireFormat, mode: NetworkingMode) -> Result<Envelope, DecodeError> {
    let items = parse_frame(bytes, format)?;
    decode_frame(&items, mode)
}

/// Decode an already parsed frame array
pub fn decode_frame(items: &[Value], mode: NetworkingMode) -> Result<Envelope, DecodeError> {
    if items.is_empty() {
        return Err(DecodeError::new(None, None, DecodeFailure::Empty));
    }

    // Recover the id first so every later failure can still be answered
    let message_id = items
        .get(1)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty());

    let tag = items[0]
        .as_i64()
        .ok_or_else(|| DecodeError::new(message_id, None, DecodeFailure::InvalidTypeTag))?;
    let message_type = MessageType::from_tag(tag).ok_or_else(|| {
        DecodeError::new(message_id, None, DecodeFailure::UnsupportedMessageType(tag))
    })?;

    let fail = |failure| DecodeError::new(message_id, Some(message_type), failure);

    let message_id = message_id.ok_or_else(|| fail(DecodeFailure::InvalidMessageId))?;
    if message_id.chars().count() > MAX_MESSAGE_ID_LEN {
        return Err(fail(DecodeFailure::MessageIdTooLong));
    }

    let standard_len = message_type.frame_len();
    let has_routing = match mode {
        NetworkingMode::Standard => false,
        NetworkingMode::OverlayNetwork => items.len() == standard_len + 2,
    };
    let expected = if has_routing { standard_len + 2 } else { standard_len };
    if items.len() != expected {
        return Err(fail(DecodeFailure::WrongLength {
            expected,
            actual: items.len(),
        }));
    }

    let message = match message_type {
        MessageType::Call => {
            // CALL: [2, messageId, action, payload]
            let action = items[2]
                .as_str()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| fail(DecodeFailure::InvalidAction))?;

            OcppMessage::Call(Call {
                message_id: message_id.to_string(),
                action: action.to_string(),
                payload: items[3].clone(),
            })
        }
        MessageType::CallResult => {
            // CALLRESULT: [3, messageId, payload]
            OcppMessage::CallResult(CallResult {
                message_id: message_id.to_string(),
                payload: items[2].clone(),
            })
        }
        MessageType::CallError => {
            // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
            let error_code = items[2]
                .as_str()
                .ok_or_else(|| fail(DecodeFailure::InvalidErrorCode))?;
            let error_description = items[3]
                .as_str()
                .ok_or_else(|| fail(DecodeFailure::InvalidErrorDescription))?;

            OcppMessage::CallError(CallError {
                message_id: message_id.to_string(),
                error_code: error_code.parse().unwrap_or(ErrorCode::GenericError),
                error_description: error_description.to_string(),
                error_details: items[4].clone(),
            })
        }
    };

    let routing = if has_routing {
        Some(decode_routing(&items[standard_len], &items[standard_len + 1]).map_err(fail)?)
    } else {
        None
    };

    Ok(Envelope { message, routing })
}

fn decode_routing(destination: &Value, path: &Value) -> Result<RoutingHeader, DecodeFailure> {
    let destination = destination
        .as_str()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| DecodeFailure::InvalidRoutingHeader("destination must be a non-empty string".into()))?;

    let hops: Vec<NodeId> = Vec::<String>::deserialize(path)
        .map_err(|e| DecodeFailure::InvalidRoutingHeader(format!("network path: {}", e)))?
        .into_iter()
        .map(NodeId::from)
        .collect();

    let network_path = NetworkPath::from_hops(hops)
        .map_err(|e| DecodeFailure::InvalidRoutingHeader(e.to_string()))?;

    Ok(RoutingHeader {
        destination: NodeId::from(destination),
        network_path,
    })
}

/// Frame array for an envelope, routing header appended when present
pub fn to_frame(envelope: &Envelope) -> Vec<Value> {
    let mut frame = envelope.message.to_frame();
    if let Some(routing) = &envelope.routing {
        frame.push(Value::String(routing.destination.to_string()));
        frame.push(Value::Array(
            routing
                .network_path
                .hops()
                .iter()
                .map(|hop| Value::String(hop.to_string()))
                .collect(),
        ));
    }
    frame
}

/// Encode an envelope to wire bytes
pub fn encode(envelope: &Envelope, format: WireFormat) -> Result<Vec<u8>, CodecError> {
    let frame = Value::Array(to_frame(envelope));
    match format {
        WireFormat::Json => Ok(serde_json::to_vec(&frame)?),
        WireFormat::Cbor => {
            let mut bytes = Vec::new();
            ciborium::ser::into_writer(&frame, &mut bytes)
                .map_err(|e| CodecError::Cbor(e.to_string()))?;
            Ok(bytes)
        }
    }
}
