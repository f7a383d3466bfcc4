#![allow(clippy::expect_used, clippy::unwrap_used)]

use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;

use super::*;

fn new_pair() -> (ReliableChannel, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ReliableChannel::new(tx), rx)
}

fn frame_seq(value: &Value) -> u64 {
    value["seq"].as_u64().expect("frame has seq")
}

#[tokio::test]
async fn delivers_in_order_frames_to_the_consumer() {
    let (channel, _rx) = new_pair();

    let first = channel
        .handle_incoming(json!({"seq": 1, "ack": 0, "payload": {"n": 1}}))
        .await;
    assert_eq!(first, vec![json!({"n": 1})]);

    let second = channel
        .handle_incoming(json!({"seq": 2, "ack": 0, "payload": {"n": 2}}))
        .await;
    assert_eq!(second, vec![json!({"n": 2})]);
}

#[tokio::test]
async fn duplicate_frames_are_dropped() {
    let (channel, _rx) = new_pair();
    channel
        .handle_incoming(json!({"seq": 1, "ack": 0, "payload": {"n": 1}}))
        .await;

    let replay = channel
        .handle_incoming(json!({"seq": 1, "ack": 0, "payload": {"n": 1}}))
        .await;
    assert!(replay.is_empty());
}

#[tokio::test]
async fn out_of_order_frames_are_parked_and_drained_in_order() {
    let (channel, _rx) = new_pair();

    let out_of_order = channel
        .handle_incoming(json!({"seq": 3, "ack": 0, "payload": {"n": 3}}))
        .await;
    assert!(out_of_order.is_empty());

    let still_waiting = channel
        .handle_incoming(json!({"seq": 2, "ack": 0, "payload": {"n": 2}}))
        .await;
    assert!(still_waiting.is_empty());

    let drained = channel
        .handle_incoming(json!({"seq": 1, "ack": 0, "payload": {"n": 1}}))
        .await;
    assert_eq!(drained, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
}

#[tokio::test]
async fn legacy_messages_without_seq_pass_through_unframed() {
    let (channel, _rx) = new_pair();
    let legacy = json!({"type": "ping", "timestamp": 123});
    let out = channel.handle_incoming(legacy.clone()).await;
    assert_eq!(out, vec![legacy]);
}

#[tokio::test]
async fn resend_buffered_after_replays_only_unacked_frames_in_order() {
    let (channel, mut rx) = new_pair();

    channel.send(json!({"m": "a"})).await.expect("send a");
    channel.send(json!({"m": "b"})).await.expect("send b");
    channel.send(json!({"m": "c"})).await.expect("send c");
    // Drain the live sends (seq 1..3).
    for _ in 0..3 {
        rx.recv().await.expect("live send observed");
    }

    // Peer acked up through seq 2; simulate a reconnect by snapshotting and
    // restoring state, then replay anything after seq 2.
    let snapshot = channel.get_state().await;
    let mut restored_snapshot = snapshot.clone();
    restored_snapshot.last_acked_seq = 2;
    restored_snapshot
        .outbound_buffer
        .retain(|(seq, _)| *seq > 2);

    let (fresh, mut fresh_rx) = new_pair();
    fresh.restore_state(restored_snapshot).await;
    fresh
        .resend_buffered_after(2)
        .await
        .expect("resend succeeds");

    let replayed = fresh_rx.recv().await.expect("exactly one replay");
    assert_eq!(frame_seq(&replayed), 3);
    assert!(fresh_rx.try_recv().is_err(), "only seq 3 should replay");
}

#[tokio::test]
async fn send_refuses_once_backpressure_limit_is_reached() {
    let (channel, mut rx) = new_pair();
    for _ in 0..MAX_UNACKED {
        channel.send(json!({})).await.expect("under the limit");
    }
    // Drain so the channel under test is not blocked on an unbounded sender.
    while rx.try_recv().is_ok() {}

    let result = channel.send(json!({})).await;
    assert!(matches!(result, Err(ChannelError::Backpressure { .. })));
}

#[tokio::test]
async fn acking_frees_the_outbound_buffer() {
    let (channel, mut rx) = new_pair();
    for _ in 0..MAX_UNACKED {
        channel.send(json!({})).await.expect("under the limit");
    }
    while rx.try_recv().is_ok() {}

    channel
        .handle_incoming(json!({"seq": 0, "ack": MAX_UNACKED}))
        .await;

    channel
        .send(json!({}))
        .await
        .expect("backpressure lifted after ack");
}
