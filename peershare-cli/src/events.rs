//! Session events rendered as JSON lines on stdout.

use peershare_sync::SessionEvent;
use serde_json::{json, Value};

pub fn to_json(event: &SessionEvent) -> Value {
    match event {
        SessionEvent::StatusChanged(status) => json!({"event": "status", "status": status}),
        SessionEvent::StateReceived {
            state,
            packet_type,
            last_update,
        } => json!({
            "event": "state",
            "type": packet_type.as_str(),
            "lastUpdate": last_update,
            "state": state,
        }),
        SessionEvent::ViewersChanged(viewers) => json!({"event": "viewers", "viewers": viewers}),
        SessionEvent::CursorMoved { peer_id, position } => {
            json!({"event": "cursor", "peer": peer_id.as_str(), "position": position})
        }
        SessionEvent::Action { peer_id, action } => {
            json!({"event": "action", "peer": peer_id.as_str(), "action": action})
        }
    }
}

/// Print one event, prefixed with `label` when several sessions share stdout.
pub fn print(label: Option<&str>, event: &SessionEvent) {
    let mut line = to_json(event);
    if let (Some(label), Value::Object(map)) = (label, &mut line) {
        map.insert("session".into(), Value::from(label));
    }
    println!("{line}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use peershare_sync::{PacketType, PeerId, SessionStatus, ViewerInfo};

    #[test]
    fn test_state_event_shape() {
        let event = SessionEvent::StateReceived {
            state: json!({"text": "hi"}),
            packet_type: PacketType::InitialState,
            last_update: 42,
        };
        assert_eq!(
            to_json(&event),
            json!({"event": "state", "type": "initial-state", "lastUpdate": 42, "state": {"text": "hi"}})
        );
    }

    #[test]
    fn test_status_and_roster_events() {
        assert_eq!(
            to_json(&SessionEvent::StatusChanged(SessionStatus::Connecting)),
            json!({"event": "status", "status": "connecting"})
        );
        let roster = SessionEvent::ViewersChanged(vec![ViewerInfo {
            id: PeerId::from("v1"),
            join_time: 7,
        }]);
        assert_eq!(
            to_json(&roster),
            json!({"event": "viewers", "viewers": [{"id": "v1", "joinTime": 7}]})
        );
    }
}
