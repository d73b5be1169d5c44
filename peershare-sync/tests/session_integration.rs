//! End-to-end host / viewer scenarios over the in-memory transport.
//!
//! Every test runs on a paused clock, so warm-up, timeouts and backoff
//! elapse instantly and deterministically.

use peershare_sync::{
    BroadcastOutcome, Link, LinkEvent, MemoryNetwork, PacketType, PeerId, SessionEvent, SessionStatus,
    ShareSession, SyncConfig, SyncPacket, Transport, TransmissionMode,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;

fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_viewer_warmup(Duration::from_millis(10))
        .with_connect_timeout(Duration::from_millis(500))
        .with_reconnect(3, Duration::from_millis(100))
}

async fn start_host(network: &MemoryNetwork, config: SyncConfig, state: Option<Value>) -> ShareSession {
    let mut host = ShareSession::new(Arc::new(network.transport()), config).with_peer_id("host");
    host.create_share(state.as_ref()).await.unwrap();
    host
}

async fn start_viewer(network: &MemoryNetwork, id: &str, host: &str) -> ShareSession {
    let mut viewer = ShareSession::new(Arc::new(network.transport()), test_config()).with_peer_id(id);
    viewer.join_share(PeerId::from(host)).await.unwrap();
    viewer
}

async fn wait_for_status(session: &ShareSession, status: SessionStatus) {
    for _ in 0..2000 {
        if session.status().await == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("status never became {status:?}, still {:?}", session.status().await);
}

async fn wait_for_state(session: &ShareSession, expected: &Value) {
    for _ in 0..2000 {
        if session.viewer_state().await.as_ref() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("viewer never saw {expected}, has {:?}", session.viewer_state().await);
}

/// States delivered so far, in order.
fn drain_states(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<(Value, PacketType)> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateReceived { state, packet_type, .. } = event {
            states.push((state, packet_type));
        }
    }
    states
}

fn frame(kind: PacketType, content: Value, last_update: u64) -> String {
    let mut packet = SyncPacket::new(kind, content);
    packet.last_update = last_update;
    packet.encode().unwrap()
}

/// Next data frame the scripted host receives from the viewer.
async fn next_request(link: &mut Link) -> SyncPacket {
    loop {
        match link.events.recv().await {
            Some(LinkEvent::Data(frame)) => return SyncPacket::decode(&frame).unwrap(),
            Some(LinkEvent::Closed) | None => panic!("viewer link closed"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_share() {
    let network = MemoryNetwork::new();
    let host = start_host(&network, test_config(), Some(json!({"text": "hello"}))).await;

    let mut viewer = ShareSession::new(Arc::new(network.transport()), test_config()).with_peer_id("viewer");
    let mut events = viewer.take_event_rx().unwrap();
    viewer.join_share(PeerId::from("host")).await.unwrap();

    wait_for_state(&viewer, &json!({"text": "hello"})).await;
    let states = drain_states(&mut events);
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].1, PacketType::InitialState);
    assert_eq!(viewer.status().await, SessionStatus::Connected);

    // Two updates inside one throttle window
    let first = host.sync_data(&json!({"text": "hello world"})).await.unwrap();
    assert!(matches!(first, BroadcastOutcome::Sent { delivered: 1, .. }));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = host.sync_data(&json!({"text": "hello world"})).await.unwrap();
    assert_eq!(second, BroadcastOutcome::Throttled);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let states = drain_states(&mut events);
    assert!(states.len() <= 1);
    assert_eq!(viewer.viewer_state().await, Some(json!({"text": "hello world"})));
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_state_reaches_late_viewer() {
    let network = MemoryNetwork::new();
    let host = start_host(&network, test_config(), None).await;

    let outcome = host.sync_data(&json!({"a": 1})).await.unwrap();
    assert_eq!(outcome, BroadcastOutcome::Cached);

    let mut viewer = ShareSession::new(Arc::new(network.transport()), test_config());
    let mut events = viewer.take_event_rx().unwrap();
    viewer.join_share(PeerId::from("host")).await.unwrap();

    wait_for_state(&viewer, &json!({"a": 1})).await;
    let states = drain_states(&mut events);
    assert_eq!(states, vec![(json!({"a": 1}), PacketType::InitialState)]);
}

#[tokio::test(start_paused = true)]
async fn test_fourth_viewer_rejected() {
    let network = MemoryNetwork::new();
    let host = start_host(&network, test_config(), Some(json!({"n": 0}))).await;

    let mut viewers = Vec::new();
    for id in ["v1", "v2", "v3"] {
        let viewer = start_viewer(&network, id, "host").await;
        wait_for_state(&viewer, &json!({"n": 0})).await;
        viewers.push(viewer);
    }

    let fourth = start_viewer(&network, "v4", "host").await;
    wait_for_status(&fourth, SessionStatus::Error).await;
    assert!(fourth.viewer_state().await.is_none());

    let roster: Vec<String> = host.viewers().await.into_iter().map(|v| v.id.to_string()).collect();
    assert_eq!(roster, vec!["v1", "v2", "v3"]);
    for viewer in &viewers {
        assert_eq!(viewer.status().await, SessionStatus::Connected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_host_bounded_retries() {
    let network = MemoryNetwork::new();
    // Registered with signaling, but never answers
    let silent = network.transport();
    silent.open(Some("silent".into())).await.unwrap();

    let viewer = start_viewer(&network, "v1", "silent").await;
    wait_for_status(&viewer, SessionStatus::Error).await;
    assert_eq!(network.dial_attempts(&"silent".into()), 3);

    // Terminal: no further attempts
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(network.dial_attempts(&"silent".into()), 3);
    assert_eq!(viewer.status().await, SessionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_host_bounded_retries() {
    let network = MemoryNetwork::new();
    let viewer = start_viewer(&network, "v1", "nobody").await;

    wait_for_status(&viewer, SessionStatus::Error).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(network.dial_attempts(&"nobody".into()), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_after_error() {
    let network = MemoryNetwork::new();
    let mut viewer = start_viewer(&network, "v1", "host").await;
    wait_for_status(&viewer, SessionStatus::Error).await;

    let _host = start_host(&network, test_config(), Some(json!({"late": true}))).await;
    viewer.join_share(PeerId::from("host")).await.unwrap();
    wait_for_state(&viewer, &json!({"late": true})).await;
    assert_eq!(viewer.status().await, SessionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_failing_viewer_evicted() {
    let network = MemoryNetwork::new();
    let host = start_host(&network, test_config(), Some(json!({"v": 0}))).await;
    let healthy = start_viewer(&network, "healthy", "host").await;
    let broken = start_viewer(&network, "broken", "host").await;
    wait_for_state(&healthy, &json!({"v": 0})).await;
    wait_for_state(&broken, &json!({"v": 0})).await;

    network.fail_sends(&"host".into(), &"broken".into());
    let outcome = host.sync_data(&json!({"v": 1})).await.unwrap();
    assert_eq!(
        outcome,
        BroadcastOutcome::Sent {
            delivered: 1,
            evicted: vec!["broken".into()],
        }
    );

    wait_for_state(&healthy, &json!({"v": 1})).await;
    assert_eq!(host.viewers().await.len(), 1);
    assert_eq!(host.metrics().error_count, 1);
    // The evicted viewer saw its link close after syncing
    wait_for_status(&broken, SessionStatus::Disconnected).await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_packets_discarded() {
    let network = MemoryNetwork::new();
    let fake = network.transport();
    fake.open(Some("fake".into())).await.unwrap();

    let viewer = start_viewer(&network, "v1", "fake").await;
    let mut link = fake.accept().await.unwrap();
    let request = next_request(&mut link).await;
    assert_eq!(request.kind, PacketType::RequestInitialState);

    link.sender
        .send(&frame(PacketType::InitialState, json!({"v": "new"}), 200))
        .unwrap();
    link.sender
        .send(&frame(PacketType::StateUpdate, json!({"v": "old"}), 100))
        .unwrap();
    link.sender
        .send(&frame(PacketType::StateUpdate, json!({"v": "same-stamp"}), 200))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(viewer.viewer_state().await, Some(json!({"v": "same-stamp"})));
}

#[tokio::test(start_paused = true)]
async fn test_delta_without_base_requests_snapshot() {
    let network = MemoryNetwork::new();
    let fake = network.transport();
    fake.open(Some("fake".into())).await.unwrap();

    let viewer = start_viewer(&network, "v1", "fake").await;
    let mut link = fake.accept().await.unwrap();
    // Answer before the warm-up request goes out
    link.sender
        .send(&frame(PacketType::DeltaUpdate, json!([{"t": "u", "p": "a", "v": 1}]), 10))
        .unwrap();

    let request = next_request(&mut link).await;
    assert_eq!(request.kind, PacketType::RequestInitialState);
    assert!(viewer.viewer_state().await.is_none());

    // A root add is a complete state on its own
    link.sender
        .send(&frame(PacketType::DeltaUpdate, json!([{"t": "a", "p": "", "v": {"a": 1}}]), 20))
        .unwrap();
    wait_for_state(&viewer, &json!({"a": 1})).await;
}

#[tokio::test(start_paused = true)]
async fn test_delta_mode_converges() {
    let network = MemoryNetwork::new();
    let config = test_config().with_transmission(TransmissionMode::Delta);
    let host = start_host(&network, config, Some(json!({"items": [1, 2, 3], "title": "a"}))).await;
    let viewer = start_viewer(&network, "v1", "host").await;
    wait_for_state(&viewer, &json!({"items": [1, 2, 3], "title": "a"})).await;

    let updates = [
        json!({"items": [1, 2], "title": "a"}),
        json!({"items": [1, 2], "title": "b", "extra": {"deep": [true]}}),
        json!({"items": [], "extra": {"deep": [false, null]}}),
    ];
    for update in &updates {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = host.sync_data(update).await.unwrap();
        assert!(matches!(outcome, BroadcastOutcome::Sent { delivered: 1, .. }));
        wait_for_state(&viewer, update).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let outcome = host.sync_data(&updates[2]).await.unwrap();
    assert_eq!(outcome, BroadcastOutcome::Unchanged);
}

#[tokio::test(start_paused = true)]
async fn test_compressed_canvas_expanded_for_viewer() {
    let network = MemoryNetwork::new();
    let config = test_config().with_compression(true);
    let canvas = json!({
        "blocks": [{"id": "a", "position": {"x": 10.2, "y": 5}, "scale": 1, "locked": false}],
        "connections": [],
        "viewport": {"x": 0, "y": 0, "zoom": 1},
    });
    let _host = start_host(&network, config, Some(canvas)).await;
    let viewer = start_viewer(&network, "v1", "host").await;

    let expected = json!({
        "blocks": [{"id": "a", "position": {"x": 10, "y": 5}, "scale": 1, "rotation": 0,
                    "locked": false, "hidden": false}],
        "connections": [],
        "viewport": {"x": 0, "y": 0, "zoom": 1},
    });
    wait_for_state(&viewer, &expected).await;
}

#[tokio::test(start_paused = true)]
async fn test_host_stop_disconnects_viewer() {
    let network = MemoryNetwork::new();
    let mut host = start_host(&network, test_config(), Some(json!({}))).await;
    let viewer = start_viewer(&network, "v1", "host").await;
    wait_for_state(&viewer, &json!({})).await;

    host.stop_sharing().await;
    wait_for_status(&viewer, SessionStatus::Disconnected).await;
    assert_eq!(host.status().await, SessionStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_viewer_leaving_updates_roster() {
    let network = MemoryNetwork::new();
    let mut host = start_host(&network, test_config(), Some(json!({}))).await;
    let mut host_events = host.take_event_rx().unwrap();
    let mut viewer = start_viewer(&network, "v1", "host").await;
    wait_for_state(&viewer, &json!({})).await;
    assert_eq!(host.viewers().await.len(), 1);

    viewer.stop_sharing().await;
    let mut rosters = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), host_events.recv())
            .await
            .expect("roster never emptied")
            .expect("host event channel closed");
        if let SessionEvent::ViewersChanged(list) = event {
            rosters.push(list.len());
            if list.is_empty() {
                break;
            }
        }
    }
    assert!(host.viewers().await.is_empty());
    assert_eq!(rosters.first(), Some(&1));
    assert_eq!(rosters.last(), Some(&0));
}

#[tokio::test(start_paused = true)]
async fn test_actions_and_cursors() {
    let network = MemoryNetwork::new();
    let mut host = start_host(&network, test_config(), Some(json!({}))).await;
    let mut host_events = host.take_event_rx().unwrap();
    let mut viewer = ShareSession::new(Arc::new(network.transport()), test_config()).with_peer_id("v1");
    let mut viewer_events = viewer.take_event_rx().unwrap();
    viewer.join_share(PeerId::from("host")).await.unwrap();
    wait_for_state(&viewer, &json!({})).await;

    viewer.send_action(json!({"kind": "wave"})).await.unwrap();
    assert!(host.send_cursor(json!({"x": 1, "y": 2})).await.unwrap());
    // Second cursor inside the cursor interval is dropped
    assert!(!host.send_cursor(json!({"x": 3, "y": 4})).await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let action = loop {
        match host_events.recv().await {
            Some(SessionEvent::Action { peer_id, action }) => break (peer_id, action),
            Some(_) => continue,
            None => panic!("host events closed"),
        }
    };
    assert_eq!(action, (PeerId::from("v1"), json!({"kind": "wave"})));

    let cursor = loop {
        match viewer_events.recv().await {
            Some(SessionEvent::CursorMoved { peer_id, position }) => break (peer_id, position),
            Some(_) => continue,
            None => panic!("viewer events closed"),
        }
    };
    assert_eq!(cursor, (PeerId::from("host"), json!({"x": 1, "y": 2})));
}

#[tokio::test(start_paused = true)]
async fn test_viewer_cannot_sync() {
    let network = MemoryNetwork::new();
    let _host = start_host(&network, test_config(), Some(json!({}))).await;
    let viewer = start_viewer(&network, "v1", "host").await;
    wait_for_state(&viewer, &json!({})).await;

    let err = viewer.sync_data(&json!({"x": 1})).await.unwrap_err();
    assert!(matches!(err, peershare_sync::SyncError::WrongRole { .. }));
}
