//! End-to-end exchanges through a networking node, driven at the frame level

use std::sync::Arc;
use std::time::Duration;

use lc_core::ocpp::{ErrorCode, WireFormat};
use lc_core::{
    Connection, Disposition, LifecycleEvent, LinkSettings, ManualClock, NetworkingMode, NetworkingNode, NodeConfig,
    NodeId, OutboundFrame, Phase,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

struct Peer {
    conn: Arc<Connection>,
    rx: mpsc::Receiver<OutboundFrame>,
}

impl Peer {
    fn attach(node: &NetworkingNode, id: &str, settings: LinkSettings) -> Self {
        let (conn, rx) = node.attach(NodeId::from(id), settings);
        Self { conn, rx }
    }

    fn send(&self, node: &NetworkingNode, frame: Value) -> Disposition {
        node.receive(&self.conn, &serde_json::to_vec(&frame).unwrap())
    }

    async fn next(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(60), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound queue closed");
        match frame.format {
            WireFormat::Json => serde_json::from_slice(&frame.bytes).unwrap(),
            WireFormat::Cbor => ciborium::de::from_reader(frame.bytes.as_slice()).unwrap(),
        }
    }

    fn nothing_queued(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}

fn start(config: NodeConfig) -> NetworkingNode {
    NetworkingNode::new(config)
}

fn lc1() -> NodeConfig {
    NodeConfig::new("LC1").with_upstream("CSMS1")
}

async fn wait_for(events: &mut broadcast::Receiver<LifecycleEvent>, phase: Phase) -> LifecycleEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if event.phase == phase {
            return event;
        }
    }
}

#[tokio::test]
async fn boot_notification_round_trip() {
    let clock = Arc::new(ManualClock::new());
    let node = NetworkingNode::builder(lc1()).clock(clock.clone()).build();
    let mut events = node.subscribe();
    let mut cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream());
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    let boot = json!([2, "123", "BootNotification", {"reason": "PowerUp", "chargingStation": {"model": "EK3", "vendorName": "EK"}}]);
    let disposition = cp1.send(&node, boot.clone());
    assert!(matches!(disposition, Disposition::Forwarded { .. }));
    assert_eq!(csms.next().await, boot);

    clock.advance(Duration::from_millis(40));
    assert_eq!(
        csms.send(&node, json!([3, "123", {"status": "Accepted"}])),
        Disposition::Completed
    );

    assert_eq!(cp1.next().await, json!([3, "123", {"status": "Accepted"}]));

    let forwarded = wait_for(&mut events, Phase::ResponseForwarded).await;
    assert_eq!(forwarded.runtime, Some(Duration::from_millis(40)));
    assert_eq!(forwarded.action.as_deref(), Some("BootNotification"));
    assert_eq!(forwarded.connection.unwrap().remote, NodeId::from("CP1"));
    assert_eq!(node.stats().pending, 0);
}

#[tokio::test]
async fn malformed_call_answered_with_its_id() {
    let node = start(lc1());
    let mut events = node.subscribe();
    let mut cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream());

    let disposition = cp1.send(&node, json!([2, "abc"]));
    assert_eq!(disposition, Disposition::Rejected(ErrorCode::FormatViolation));

    let reply = cp1.next().await;
    assert_eq!(reply[0], json!(4));
    assert_eq!(reply[1], json!("abc"));
    assert_eq!(reply[2], json!("FormatViolation"));

    let event = wait_for(&mut events, Phase::DecodeFailed).await;
    assert!(event.detail.unwrap().contains("expected 4 elements"));
}

#[tokio::test]
async fn garbage_without_id_only_logged() {
    let node = start(lc1());
    let mut cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream());

    assert_eq!(node.receive(&cp1.conn, b"not json"), Disposition::Dropped);
    assert_eq!(cp1.send(&node, json!({"id": 1})), Disposition::Dropped);
    assert!(cp1.nothing_queued());
}

#[tokio::test]
async fn duplicate_message_id_rejected_first_unaffected() {
    let node = start(lc1());
    let mut cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream());
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    let first = json!([2, "55", "MeterValues", {"evseId": 1}]);
    let second = json!([2, "55", "MeterValues", {"evseId": 2}]);

    assert!(matches!(cp1.send(&node, first.clone()), Disposition::Forwarded { .. }));
    assert_eq!(cp1.send(&node, second), Disposition::DuplicateRejected);

    assert_eq!(csms.next().await, first);
    assert!(csms.nothing_queued());
    assert!(cp1.nothing_queued());

    csms.send(&node, json!([3, "55", {}]));
    assert_eq!(cp1.next().await, json!([3, "55", {}]));
    assert!(cp1.nothing_queued());
}

#[tokio::test]
async fn same_id_from_two_charge_points() {
    let node = start(lc1());
    let mut cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream());
    let mut cp2 = Peer::attach(&node, "CP2", LinkSettings::downstream());
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    cp1.send(&node, json!([2, "123", "StatusNotification", {"from": "CP1"}]));
    cp2.send(&node, json!([2, "123", "StatusNotification", {"from": "CP2"}]));

    let a = csms.next().await;
    let b = csms.next().await;
    assert_eq!(a[1], json!("123"));
    assert_ne!(b[1], json!("123"));
    assert_eq!(b[3]["from"], json!("CP2"));

    // Answer out of order
    csms.send(&node, json!([3, b[1], {"for": "CP2"}]));
    csms.send(&node, json!([3, "123", {"for": "CP1"}]));

    assert_eq!(cp1.next().await, json!([3, "123", {"for": "CP1"}]));
    assert_eq!(cp2.next().await, json!([3, "123", {"for": "CP2"}]));
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out() {
    let config = lc1().with_request_timeout(Duration::from_secs(30));
    let node = start(config);
    let mut cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream());
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    let started = tokio::time::Instant::now();
    cp1.send(&node, json!([2, "t1", "Heartbeat", {}]));
    csms.next().await;

    let reply = cp1.next().await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(reply[1], json!("t1"));
    assert_eq!(reply[2], json!("Timeout"));
    assert_eq!(node.stats().pending, 0);

    // The late answer matches nothing
    assert_eq!(csms.send(&node, json!([3, "t1", {}])), Disposition::Ignored);
    assert!(cp1.nothing_queued());
}

#[tokio::test]
async fn upstream_loss_answers_requester() {
    let node = start(lc1());
    let mut cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream());
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    cp1.send(&node, json!([2, "u1", "Authorize", {}]));
    csms.next().await;

    assert_eq!(node.detach(&csms.conn), 1);
    assert_eq!(node.stats().pending, 0);

    let reply = cp1.next().await;
    assert_eq!(reply[1], json!("u1"));
    assert_eq!(reply[2], json!("ConnectionLost"));
}

#[tokio::test]
async fn requester_loss_drops_answer() {
    let node = start(lc1());
    let mut events = node.subscribe();
    let cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream());
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    cp1.send(&node, json!([2, "r1", "Authorize", {}]));
    csms.next().await;

    assert_eq!(node.detach(&cp1.conn), 1);
    let lost = wait_for(&mut events, Phase::ConnectionLost).await;
    assert_eq!(lost.detail.as_deref(), Some("requester disconnected"));

    assert_eq!(csms.send(&node, json!([3, "r1", {}])), Disposition::Ignored);
}

#[tokio::test]
async fn reconnect_evicts_previous_socket() {
    let node = Arc::new(start(lc1()));
    let mut old = Peer::attach(&node, "CP1", LinkSettings::downstream());

    let call = {
        let node = node.clone();
        tokio::spawn(async move { node.call(&NodeId::from("CP1"), "GetVariables", json!({})).await })
    };
    old.next().await;

    let mut new = Peer::attach(&node, "CP1", LinkSettings::downstream());
    assert!(!old.conn.is_open());

    let failure = call.await.unwrap().unwrap_err();
    assert!(failure.to_string().contains("replaced by a newer connection"));

    // Stale detach leaves the new binding in place
    node.detach(&old.conn);
    let registered = node.registry().lookup(&NodeId::from("CP1")).unwrap();
    assert_eq!(registered.id(), new.conn.id());

    let call = {
        let node = node.clone();
        tokio::spawn(async move { node.call(&NodeId::from("CP1"), "GetVariables", json!({})).await })
    };
    let request = new.next().await;
    new.send(&node, json!([3, request[1], {"getVariableResult": []}]));
    assert!(call.await.unwrap().is_ok());
}

#[tokio::test]
async fn overlay_path_extended_and_reversed() {
    let node = start(lc1());
    let overlay_down = LinkSettings::downstream().with_mode(NetworkingMode::OverlayNetwork);
    let overlay_up = LinkSettings::upstream().with_mode(NetworkingMode::OverlayNetwork);
    let mut nn1 = Peer::attach(&node, "NN1", overlay_down);
    let mut csms = Peer::attach(&node, "CSMS1", overlay_up);

    nn1.send(&node, json!([2, "o1", "BootNotification", {}, "CSMS1", ["CP9"]]));
    assert_eq!(
        csms.next().await,
        json!([2, "o1", "BootNotification", {}, "CSMS1", ["CP9", "NN1"]])
    );

    csms.send(&node, json!([3, "o1", {"status": "Accepted"}]));
    assert_eq!(nn1.next().await, json!([3, "o1", {"status": "Accepted"}, "CP9", ["CP9"]]));

    // CP9 was learned behind NN1
    let route = node.registry().route(&NodeId::from("CP9")).unwrap();
    assert_eq!(route.via, NodeId::from("NN1"));

    csms.send(&node, json!([2, "c1", "Reset", {"type": "OnIdle"}, "CP9", []]));
    assert_eq!(nn1.next().await, json!([2, "c1", "Reset", {"type": "OnIdle"}, "CP9", ["CSMS1"]]));
}

#[tokio::test]
async fn overlay_loops_rejected() {
    let node = start(lc1());
    let overlay = LinkSettings::downstream().with_mode(NetworkingMode::OverlayNetwork);
    let mut nn1 = Peer::attach(&node, "NN1", overlay);
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    let disposition = nn1.send(&node, json!([2, "l1", "Heartbeat", {}, "CSMS1", ["CP9", "NN1"]]));
    assert_eq!(disposition, Disposition::Rejected(ErrorCode::MessageLoop));
    assert_eq!(nn1.next().await[2], json!("MessageLoop"));

    let disposition = nn1.send(&node, json!([2, "l2", "Heartbeat", {}, "CSMS1", ["LC1"]]));
    assert_eq!(disposition, Disposition::Rejected(ErrorCode::MessageLoop));
    assert_eq!(nn1.next().await[2], json!("MessageLoop"));

    assert!(csms.nothing_queued());
    assert_eq!(node.stats().pending, 0);
}

#[tokio::test]
async fn cbor_link_bridged_to_json() {
    let node = start(lc1());
    let mut cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream().with_format(WireFormat::Cbor));
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&json!([2, "b1", "Heartbeat", {}]), &mut bytes).unwrap();
    node.receive(&cp1.conn, &bytes);

    assert_eq!(csms.next().await, json!([2, "b1", "Heartbeat", {}]));
    csms.send(&node, json!([3, "b1", {"currentTime": "2026-01-01T00:00:00Z"}]));

    let frame = tokio::time::timeout(Duration::from_secs(5), cp1.rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.format, WireFormat::Cbor);
    let reply: Value = ciborium::de::from_reader(frame.bytes.as_slice()).unwrap();
    assert_eq!(reply, json!([3, "b1", {"currentTime": "2026-01-01T00:00:00Z"}]));
}

#[tokio::test]
async fn frame_on_evicted_connection_dropped() {
    let node = start(lc1());
    let old = Peer::attach(&node, "CP1", LinkSettings::downstream());
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());
    let _new = Peer::attach(&node, "CP1", LinkSettings::downstream());

    // A frame the evicted session read before noticing the close
    assert_eq!(old.send(&node, json!([2, "x1", "Heartbeat", {}])), Disposition::Dropped);

    assert!(csms.nothing_queued());
    assert_eq!(node.stats().pending, 0);
    assert_eq!(node.detach(&old.conn), 0);
}

#[tokio::test]
async fn frame_after_detach_dropped() {
    let node = start(lc1());
    let mut events = node.subscribe();
    let cp1 = Peer::attach(&node, "CP1", LinkSettings::downstream());
    let mut csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    node.detach(&cp1.conn);
    assert_eq!(cp1.send(&node, json!([2, "y1", "Heartbeat", {}])), Disposition::Dropped);

    let event = wait_for(&mut events, Phase::ConnectionLost).await;
    assert_eq!(event.sender, Some(NodeId::from("CP1")));
    assert!(csms.nothing_queued());
    assert_eq!(node.stats().pending, 0);
}

#[tokio::test]
async fn unmatched_response_reported_with_message() {
    let node = start(lc1());
    let mut events = node.subscribe();
    let csms = Peer::attach(&node, "CSMS1", LinkSettings::upstream());

    assert_eq!(csms.send(&node, json!([3, "nobody", {"status": "Accepted"}])), Disposition::Ignored);

    let event = wait_for(&mut events, Phase::DuplicateIgnored).await;
    let message = event.message.expect("ignored response carried in the event");
    assert_eq!(message.message_id(), "nobody");
}
