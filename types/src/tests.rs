#![allow(clippy::expect_used, clippy::unwrap_used)]

use serde_json::json;

use crate::DelegateToHost;
use crate::HostToDelegate;
use crate::ReliableFrame;

#[test]
fn hello_round_trips_through_the_mcpl_type_tag() {
    let value = json!({
        "type": "mcpl/hello",
        "protocolVersion": "1.0",
        "capabilities": ["push_events"],
        "delegateId": "alpha",
        "delegateName": "Alpha",
    });
    let msg: DelegateToHost = serde_json::from_value(value).expect("valid hello");
    match msg {
        DelegateToHost::Hello {
            delegate_id,
            session_id,
            ..
        } => {
            assert_eq!(delegate_id, "alpha");
            assert_eq!(session_id, None);
        }
        other => panic!("expected Hello, got {other:?}"),
    }
}

#[test]
fn ack_serializes_with_the_mcpl_tag() {
    let msg = HostToDelegate::Ack {
        session_id: "sess-1".to_string(),
        negotiated_capabilities: vec![],
        feature_sets: Default::default(),
        resumed_from_seq: Some(4),
    };
    let value = serde_json::to_value(&msg).expect("serializable");
    assert_eq!(value["type"], "mcpl/ack");
    assert_eq!(value["resumedFromSeq"], 4);
}

#[test]
fn bare_ack_has_no_payload() {
    let frame = ReliableFrame::bare_ack(7);
    assert!(frame.is_bare_ack());
    let value = serde_json::to_value(&frame).expect("serializable");
    assert!(value.get("payload").is_none());
}
