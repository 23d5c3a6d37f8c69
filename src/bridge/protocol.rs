//! Messages exchanged between front-ends and the bridge worker
//!
//! Both directions are closed tagged enums serialized as
//! `{"type": "SCREAMING_SNAKE_CASE", ...fields}`.

use serde::{Deserialize, Serialize};

/// Front-end → worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// The sender detected the wake word
    WakewordDetected,
    /// The sender fell back to manual microphone input
    FallbackModeActivated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Heartbeat; answered with [`WorkerMessage::Pong`]
    KeepAlive,
    /// Activate a waiting worker version
    SkipWaiting,
    /// Push payload to surface as a notification
    Push {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
}

/// Worker → front-end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Some front-end heard the wake word (milliseconds since epoch)
    WakewordDetected { timestamp: i64 },
    /// Some front-end is in manual fallback mode
    FallbackModeActive { timestamp: i64, reason: String },
    Pong,
    /// A new worker version took over; front-ends should reload
    SwUpdated { version: String, changes: String },
    /// A notification was clicked; the receiver should come to the foreground
    Focus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_tags_match_wire_names() {
        let cases = [
            (ClientMessage::WakewordDetected, r#"{"type":"WAKEWORD_DETECTED"}"#),
            (ClientMessage::KeepAlive, r#"{"type":"KEEP_ALIVE"}"#),
            (ClientMessage::SkipWaiting, r#"{"type":"SKIP_WAITING"}"#),
        ];
        for (message, wire) in cases {
            assert_eq!(serde_json::to_string(&message).unwrap(), wire);
        }
    }

    #[test]
    fn fallback_reason_is_optional() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"FALLBACK_MODE_ACTIVATED"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::FallbackModeActivated { reason: None });
    }

    #[test]
    fn worker_messages_serialize_with_fields() {
        let json = serde_json::to_value(WorkerMessage::SwUpdated {
            version: "v6".to_string(),
            changes: "nouvelle version".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "SW_UPDATED");
        assert_eq!(json["version"], "v6");

        let pong = serde_json::to_string(&WorkerMessage::Pong).unwrap();
        assert_eq!(pong, r#"{"type":"PONG"}"#);

        let active = serde_json::to_value(WorkerMessage::FallbackModeActive {
            timestamp: 1,
            reason: "permission".to_string(),
        })
        .unwrap();
        assert_eq!(active["type"], "FALLBACK_MODE_ACTIVE");
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"SELF_DESTRUCT"}"#).is_err());
    }
}
