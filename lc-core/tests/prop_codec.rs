//! Property tests for the frame codec
//!
//! - Round trip: decode(encode(m)) == m for both wire formats
//! - Overlay framing leaves positions 0-4 untouched

use lc_core::ocpp::*;
use lc_core::{NetworkPath, NetworkingMode, NodeId};
use proptest::prelude::*;
use serde_json::Value;

// ============================================================================
// Strategies
// ============================================================================

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _:-]{0,16}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-zA-Z]{1,8}", inner, 0..4)
                .prop_map(|fields| Value::Object(fields.into_iter().collect())),
        ]
    })
}

fn message_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9-]{1,36}"
}

fn error_code() -> impl Strategy<Value = ErrorCode> {
    "[A-Z][a-zA-Z]{2,24}".prop_map(|code| code.parse().unwrap())
}

fn message() -> impl Strategy<Value = OcppMessage> {
    prop_oneof![
        (message_id(), "[A-Z][a-zA-Z0-9]{0,31}", json_value())
            .prop_map(|(id, action, payload)| Call::with_id(id, action, payload).into()),
        (message_id(), json_value()).prop_map(|(id, payload)| CallResult::new(id, payload).into()),
        (message_id(), error_code(), "[ -~]{0,40}", json_value()).prop_map(|(id, code, description, details)| {
            CallError::new(id, code, description).with_details(details).into()
        }),
    ]
}

fn format() -> impl Strategy<Value = WireFormat> {
    prop_oneof![Just(WireFormat::Json), Just(WireFormat::Cbor)]
}

fn network_path() -> impl Strategy<Value = NetworkPath> {
    prop::collection::btree_set("[A-Z]{2}[0-9]{1,3}", 0..5)
        .prop_map(|hops| NetworkPath::from_hops(hops.into_iter().map(NodeId::from)).unwrap())
}

// ============================================================================
// Round trip
// ============================================================================

proptest! {
    #[test]
    fn standard_frames_round_trip(message in message(), format in format()) {
        let envelope = Envelope::plain(message);
        let bytes = encode(&envelope, format).unwrap();

        prop_assert_eq!(decode(&bytes, format, NetworkingMode::Standard).unwrap(), envelope.clone());
        // Overlay links also accept plain frames
        prop_assert_eq!(decode(&bytes, format, NetworkingMode::OverlayNetwork).unwrap(), envelope);
    }

    #[test]
    fn overlay_frames_round_trip(
        message in message(),
        format in format(),
        destination in "[A-Z]{2}[0-9]{1,3}",
        path in network_path()
    ) {
        let envelope = Envelope::routed(message, NodeId::from(destination), path);
        let bytes = encode(&envelope, format).unwrap();

        prop_assert_eq!(decode(&bytes, format, NetworkingMode::OverlayNetwork).unwrap(), envelope);
    }

    #[test]
    fn encodings_decode_to_same_message(message in message()) {
        let envelope = Envelope::plain(message);
        let json = encode(&envelope, WireFormat::Json).unwrap();
        let cbor = encode(&envelope, WireFormat::Cbor).unwrap();

        prop_assert_eq!(
            decode(&json, WireFormat::Json, NetworkingMode::Standard).unwrap(),
            decode(&cbor, WireFormat::Cbor, NetworkingMode::Standard).unwrap()
        );
    }

    #[test]
    fn overlay_header_keeps_standard_positions(message in message(), path in network_path()) {
        let plain = codec::to_frame(&Envelope::plain(message.clone()));
        let routed = codec::to_frame(&Envelope::routed(message, NodeId::from("CSMS1"), path));

        prop_assert_eq!(routed.len(), plain.len() + 2);
        prop_assert_eq!(&routed[..plain.len()], &plain[..]);
    }
}
