//! Routing and call errors

use serde_json::Value;
use thiserror::Error;

use crate::ocpp::{CodecError, ErrorCode};
use crate::pending::{LossReason, PendingError};
use crate::types::{ConnectionId, NodeId, TravelDirection};

/// A frame could not be handed to a connection's transport
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("outbound queue of {0} is full")]
    QueueFull(ConnectionId),

    #[error("encode error: {0}")]
    Encode(#[from] CodecError),
}

/// Why the router could not send a Call
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no route to {0}")]
    UnknownDestination(NodeId),

    #[error("no upstream configured")]
    NoUpstream,

    #[error("routing to {0} would loop")]
    MessageLoop(NodeId),

    #[error("{action} may not travel {travel:?}")]
    DirectionNotPermitted {
        action: String,
        travel: TravelDirection,
    },

    #[error(transparent)]
    Pending(#[from] PendingError),
}

impl RoutingError {
    /// Code used when this error is reported back as a CALLERROR
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RoutingError::UnknownDestination(_) | RoutingError::NoUpstream => ErrorCode::UnknownDestination,
            RoutingError::MessageLoop(_) => ErrorCode::MessageLoop,
            RoutingError::DirectionNotPermitted { .. } => ErrorCode::ProtocolError,
            RoutingError::Pending(_) => ErrorCode::GenericError,
        }
    }
}

/// Why a locally originated call produced no CALLRESULT
#[derive(Debug, Error)]
pub enum CallFailure {
    #[error("no response from {0} in time")]
    Timeout(NodeId),

    #[error("connection to {node} lost: {reason}")]
    ConnectionLost { node: NodeId, reason: LossReason },

    #[error("transmission failed: {0}")]
    TransmissionFailed(String),

    /// The destination answered with a CALLERROR
    #[error("{code}: {description}")]
    Rejected {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("resolution channel dropped")]
    Abandoned,
}

impl CallFailure {
    /// Whether resending could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallFailure::Timeout(_) | CallFailure::TransmissionFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_failures() {
        assert!(CallFailure::Timeout(NodeId::from("CSMS1")).is_retryable());
        assert!(CallFailure::TransmissionFailed("queue full".into()).is_retryable());
        assert!(!CallFailure::Routing(RoutingError::UnknownDestination(NodeId::from("CP7"))).is_retryable());
        assert!(!CallFailure::Rejected {
            code: ErrorCode::NotSupported,
            description: "no".into(),
            details: Value::Null,
        }
        .is_retryable());
    }

    #[test]
    fn test_routing_error_codes() {
        assert_eq!(
            RoutingError::UnknownDestination(NodeId::from("CP7")).error_code(),
            ErrorCode::UnknownDestination
        );
        let err = RoutingError::DirectionNotPermitted {
            action: "Reset".into(),
            travel: TravelDirection::ToCsms,
        };
        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
        assert_eq!(err.to_string(), "Reset may not travel ToCsms");
    }
}
