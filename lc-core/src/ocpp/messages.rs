//! OCPP-J RPC message types
//!
//! OCPP frames every exchange as a JSON array:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! The action is carried as a plain string. Whether an action exists in the
//! catalog is a routing concern, not a framing one.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum MessageId length in characters
pub const MAX_MESSAGE_ID_LEN: usize = 36;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Number of array elements in a standard frame of this type
    pub fn frame_len(&self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }

    pub fn is_response(&self) -> bool {
        !matches!(self, MessageType::Call)
    }
}

/// RPC error codes.
///
/// The OCPP 2.0.1 RPC framework codes, the codes this node synthesizes when
/// an exchange fails in transit, and `Other` for anything else a peer sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,

    // Synthesized by the router
    Timeout,
    ConnectionLost,
    UnknownDestination,
    TransmissionFailed,
    MessageLoop,

    Other(String),
}

const ERROR_CODES: &[(ErrorCode, &str)] = &[
    (ErrorCode::FormatViolation, "FormatViolation"),
    (ErrorCode::GenericError, "GenericError"),
    (ErrorCode::InternalError, "InternalError"),
    (ErrorCode::MessageTypeNotSupported, "MessageTypeNotSupported"),
    (ErrorCode::NotImplemented, "NotImplemented"),
    (ErrorCode::NotSupported, "NotSupported"),
    (ErrorCode::OccurrenceConstraintViolation, "OccurrenceConstraintViolation"),
    (ErrorCode::PropertyConstraintViolation, "PropertyConstraintViolation"),
    (ErrorCode::ProtocolError, "ProtocolError"),
    (ErrorCode::RpcFrameworkError, "RpcFrameworkError"),
    (ErrorCode::SecurityError, "SecurityError"),
    (ErrorCode::TypeConstraintViolation, "TypeConstraintViolation"),
    (ErrorCode::Timeout, "Timeout"),
    (ErrorCode::ConnectionLost, "ConnectionLost"),
    (ErrorCode::UnknownDestination, "UnknownDestination"),
    (ErrorCode::TransmissionFailed, "TransmissionFailed"),
    (ErrorCode::MessageLoop, "MessageLoop"),
];

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        if let ErrorCode::Other(code) = self {
            return code;
        }
        ERROR_CODES
            .iter()
            .find(|(code, _)| code == self)
            .map(|(_, text)| *text)
            .unwrap_or("GenericError")
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ERROR_CODES
            .iter()
            .find(|(_, text)| *text == s)
            .map(|(code, _)| code.clone())
            .unwrap_or_else(|| ErrorCode::Other(s.to_string())))
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), action, payload)
    }

    pub fn with_id(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Wire array: [2, messageId, action, payload]
    pub fn to_frame(&self) -> Vec<Value> {
        vec![
            json!(MessageType::Call.tag()),
            Value::String(self.message_id.clone()),
            Value::String(self.action.clone()),
            self.payload.clone(),
        ]
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Wire array: [3, messageId, payload]
    pub fn to_frame(&self) -> Vec<Value> {
        vec![
            json!(MessageType::CallResult.tag()),
            Value::String(self.message_id.clone()),
            self.payload.clone(),
        ]
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    /// Wire array: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_frame(&self) -> Vec<Value> {
        vec![
            json!(MessageType::CallError.tag()),
            Value::String(self.message_id.clone()),
            Value::String(self.error_code.to_string()),
            Value::String(self.error_description.clone()),
            self.error_details.clone(),
        ]
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Same message under a different ID
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        let message_id = message_id.into();
        match &mut self {
            OcppMessage::Call(c) => c.message_id = message_id,
            OcppMessage::CallResult(r) => r.message_id = message_id,
            OcppMessage::CallError(e) => e.message_id = message_id,
        }
        self
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    /// Action name, for calls
    pub fn action(&self) -> Option<&str> {
        match self {
            OcppMessage::Call(c) => Some(&c.action),
            _ => None,
        }
    }

    /// Standard wire array for this message
    pub fn to_frame(&self) -> Vec<Value> {
        match self {
            OcppMessage::Call(c) => c.to_frame(),
            OcppMessage::CallResult(r) => r.to_frame(),
            OcppMessage::CallError(e) => e.to_frame(),
        }
    }
}

impl From<Call> for OcppMessage {
    fn from(call: Call) -> Self {
        OcppMessage::Call(call)
    }
}

impl From<CallResult> for OcppMessage {
    fn from(result: CallResult) -> Self {
        OcppMessage::CallResult(result)
    }
}

impl From<CallError> for OcppMessage {
    fn from(error: CallError) -> Self {
        OcppMessage::CallError(error)
    }
}

/// Messages serialize as their wire array so event consumers see the frame as sent
impl Serialize for OcppMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_frame().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_frame() {
        let call = Call::new("Heartbeat", json!({}));
        let text = serde_json::to_string(&OcppMessage::from(call.clone())).unwrap();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
        assert_eq!(call.message_id.len(), MAX_MESSAGE_ID_LEN);
    }

    #[test]
    fn test_error_code_lookup_is_bidirectional() {
        for (code, text) in ERROR_CODES {
            assert_eq!(code.as_str(), *text);
            assert_eq!(text.parse::<ErrorCode>().unwrap(), *code);
        }
    }

    #[test]
    fn test_unknown_error_code_preserved() {
        let code: ErrorCode = "VendorSpecificFailure".parse().unwrap();
        assert_eq!(code, ErrorCode::Other("VendorSpecificFailure".to_string()));
        assert_eq!(code.to_string(), "VendorSpecificFailure");
    }

    #[test]
    fn test_call_error_frame() {
        let error = CallError::new("msg-123", ErrorCode::Timeout, "no answer from CSMS1")
            .with_details(json!({"nodeId": "CSMS1"}));
        let frame = OcppMessage::from(error).to_frame();

        assert_eq!(frame.len(), MessageType::CallError.frame_len());
        assert_eq!(frame[0], json!(4));
        assert_eq!(frame[2], json!("Timeout"));
        assert_eq!(frame[4], json!({"nodeId": "CSMS1"}));
    }

    #[test]
    fn test_with_message_id() {
        let msg = OcppMessage::from(CallResult::new("a", json!({"status": "Accepted"})));
        let renamed = msg.with_message_id("b");
        assert_eq!(renamed.message_id(), "b");
        assert_eq!(renamed.message_type(), MessageType::CallResult);
        assert_eq!(renamed.action(), None);
    }
}
