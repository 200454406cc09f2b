use super::*;
use crate::{decode_frame, encode_frame};

// =============================================================================
// hex
// =============================================================================

#[test]
fn bytes_to_hex_pads_each_byte() {
    assert_eq!(bytes_to_hex(&[0x00, 0x0f, 0xff]), "000fff");
}

#[test]
fn hex_to_bytes_accepts_mixed_case() {
    assert_eq!(hex_to_bytes("0aFf"), Some(vec![0x0a, 0xff]));
}

#[test]
fn hex_to_bytes_rejects_odd_length_and_bad_digits() {
    assert_eq!(hex_to_bytes("abc"), None);
    assert_eq!(hex_to_bytes("zz"), None);
}

// =============================================================================
// ChannelMessage wire shape
// =============================================================================

#[test]
fn am_change_serializes_tagged_hex() {
    let msg = ChannelMessage::AmChange(vec![1, 2, 254]);
    let json = serde_json::to_value(&msg).expect("serialize");
    assert_eq!(json, serde_json::json!({"kind": "am-change", "payload": "0102fe"}));
}

#[test]
fn presence_record_defaults_missing_fields() {
    let rec: PresenceRecord = serde_json::from_value(serde_json::json!({"user_id": "u1"})).expect("parse");
    assert_eq!(rec, PresenceRecord::viewing("u1"));
}

#[test]
fn unknown_kind_is_rejected() {
    let raw = serde_json::json!({"kind": "teleport", "payload": {}});
    assert!(serde_json::from_value::<ChannelMessage>(raw).is_err());
}

#[test]
fn kind_reports_custom_event_name() {
    let msg = ChannelMessage::Custom { event: "ping".into(), payload: serde_json::Value::Null };
    assert_eq!(msg.kind(), MessageKind::Custom("ping".into()));
    assert_eq!(ChannelMessage::AmChange(Vec::new()).kind(), MessageKind::AmChange);
}

// =============================================================================
// Frame transport
// =============================================================================

#[test]
fn am_change_survives_protobuf_transport() {
    let msg = ChannelMessage::AmChange((0..=255).collect());
    let frame = msg.to_frame("canvas:c1");
    let decoded = decode_frame(&encode_frame(&frame)).expect("decode");

    assert_eq!(decoded.topic.as_deref(), Some("canvas:c1"));
    assert_eq!(ChannelMessage::from_frame(&decoded).expect("message"), msg);
}

#[test]
fn presence_sync_survives_protobuf_transport() {
    let mut map = PresenceMap::new();
    map.insert(
        "u1".into(),
        vec![PresenceRecord::viewing("u1").with_cursor(1.5, -2.0).with_status(PresenceStatus::Editing)],
    );
    let msg = ChannelMessage::PresenceSync(map);

    let decoded = decode_frame(&encode_frame(&msg.to_frame("canvas:c1"))).expect("decode");
    assert_eq!(ChannelMessage::from_frame(&decoded).expect("message"), msg);
}

#[test]
fn from_frame_reports_payload_error() {
    let frame = crate::Frame::request(crate::SYSCALL_MESSAGE, serde_json::json!({"kind": "am-change", "payload": "x"}));
    let err = ChannelMessage::from_frame(&frame).expect_err("bad hex");
    assert!(matches!(err, CodecError::Payload { .. }));
}
