//! OCPP protocol layer
//!
//! - `messages`: CALL, CALLRESULT, CALLERROR and error codes
//! - `codec`: JSON / CBOR framing, overlay routing header, decode errors
//! - `catalog`: action directions and local handlers

pub mod messages;
pub mod codec;
pub mod catalog;

pub use messages::*;
pub use codec::{decode, encode, CodecError, DecodeError, DecodeFailure, Envelope, RoutingHeader, WireFormat};
pub use catalog::{ActionCatalog, ActionDirection, ActionHandler, CallContext, HandlerError};
