use super::*;
use proptest::prelude::*;

/// Message shape used by producers that publish without an envelope.
#[derive(Clone, PartialEq, prost::Message)]
struct LegacyEvent {
    #[prost(int64, tag = "1")]
    id: i64,
    #[prost(string, tag = "2")]
    name: String,
}

fn b3() -> TraceInfo {
    TraceInfo::B3(B3Context {
        trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
        span_id: "00f067aa0ba902b7".to_string(),
        parent_span_id: "a3ce929d0e0e4736".to_string(),
        sampled: true,
        debug: false,
    })
}

#[test]
fn test_roundtrip_with_b3_trace() {
    let envelope = Envelope::new(&b"payload"[..], Identity::new("manabie", "user-1"))
        .with_trace(Some(b3()));

    let decoded = Envelope::decode(&envelope.encode()).unwrap();

    assert_eq!(decoded, envelope);
}

#[test]
fn test_roundtrip_with_propagation_string() {
    let trace = TraceInfo::Propagation(
        "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
    );
    let envelope = Envelope::new(&b"x"[..], Identity::default()).with_trace(Some(trace.clone()));

    let decoded = Envelope::decode(&envelope.encode()).unwrap();

    assert_eq!(decoded.trace, Some(trace));
}

#[test]
fn test_roundtrip_without_trace() {
    let envelope = Envelope::new(&b"hello"[..], Identity::new("org-7", "u-9"));

    let decoded = Envelope::decode(&envelope.encode()).unwrap();

    assert_eq!(decoded.trace, None);
    assert_eq!(decoded.identity.resource_path, "org-7");
    assert_eq!(decoded.identity.user_id, "u-9");
    assert_eq!(&decoded.payload[..], b"hello");
}

#[test]
fn test_empty_trace_message_decodes_as_absent() {
    let raw = wire::DataInMessage {
        payload: bytes::Bytes::from_static(b"p"),
        resource_path: String::new(),
        user_id: String::new(),
        trace_info: Some(wire::TraceInfo { context: None }),
    }
    .encode_to_vec();

    let decoded = Envelope::decode(&raw).unwrap();

    assert_eq!(decoded.trace, None);
}

#[test]
fn test_decode_garbage_is_malformed() {
    let result = Envelope::decode(&[0xff, 0xff, 0xff]);
    assert!(matches!(result, Err(EnvelopeError::Malformed(_))));
}

#[test]
fn test_decode_ignore_metadata_unwraps_envelope() {
    let inner = LegacyEvent {
        id: 42,
        name: "lesson".to_string(),
    };
    let bytes = Envelope::new(inner.encode_to_vec(), Identity::new("rp", "u")).encode();

    let decoded: LegacyEvent = decode_ignore_metadata(&bytes).unwrap();

    assert_eq!(decoded, inner);
}

#[test]
fn test_decode_ignore_metadata_accepts_bare_payload() {
    let bare = LegacyEvent {
        id: 7,
        name: "bare".to_string(),
    };

    let decoded: LegacyEvent = decode_ignore_metadata(&bare.encode_to_vec()).unwrap();

    assert_eq!(decoded, bare);
}

#[test]
fn test_decode_ignore_metadata_empty_payload_keeps_identity_out() {
    let bytes = Envelope::new(
        LegacyEvent::default().encode_to_vec(),
        Identity::new("org-rp", "u-1"),
    )
    .encode();

    let decoded: LegacyEvent = decode_ignore_metadata(&bytes).unwrap();

    assert_eq!(decoded, LegacyEvent::default());
}

#[test]
fn test_decode_ignore_metadata_rejects_garbage() {
    let result: Result<LegacyEvent, _> = decode_ignore_metadata(&[0xff, 0xff, 0xff]);
    assert!(result.is_err());
}

fn trace_strategy() -> impl Strategy<Value = Option<TraceInfo>> {
    prop_oneof![
        Just(None),
        "[0-9a-f]{0,55}".prop_map(|s| Some(TraceInfo::Propagation(s))),
        (
            "[0-9a-f]{32}",
            "[0-9a-f]{16}",
            "[0-9a-f]{0,16}",
            any::<bool>(),
            any::<bool>()
        )
            .prop_map(|(trace_id, span_id, parent_span_id, sampled, debug)| {
                Some(TraceInfo::B3(B3Context {
                    trace_id,
                    span_id,
                    parent_span_id,
                    sampled,
                    debug,
                }))
            }),
    ]
}

proptest! {
    #[test]
    fn prop_envelope_roundtrip(
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        resource_path in "[a-z0-9-]{0,24}",
        user_id in "[a-zA-Z0-9]{0,24}",
        trace in trace_strategy(),
    ) {
        let envelope = Envelope::new(payload, Identity::new(resource_path, user_id))
            .with_trace(trace);

        let decoded = Envelope::decode(&envelope.encode()).unwrap();

        prop_assert_eq!(decoded, envelope);
    }
}
