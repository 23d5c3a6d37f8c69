//! Observable voice interaction state
//!
//! The controller owns one [`InteractionState`] and publishes it whole through
//! a `watch` channel; [`VoiceEvent`]s describe individual transitions on a
//! `broadcast` channel.

use serde::Serialize;

use super::audio_session::PermissionState;

/// Whether the hands-free pipeline can run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Available,
    /// Manual push-to-talk only
    Unavailable { reason: String },
}

impl Availability {
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Voice UI state exposed to the rest of the app
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InteractionState {
    pub is_initialized: bool,
    /// Wake word detector is listening
    pub is_listening: bool,
    /// Held for two seconds after a wake
    pub is_wake_detected: bool,
    pub is_capturing: bool,
    pub is_speaking: bool,
    /// Most recent error; later errors overwrite it
    pub last_error: Option<String>,
    pub availability: Availability,
    pub permission: PermissionState,
    /// Latest display-only transcript
    pub interim: Option<String>,
}

impl Default for InteractionState {
    fn default() -> Self {
        Self {
            is_initialized: false,
            is_listening: false,
            is_wake_detected: false,
            is_capturing: false,
            is_speaking: false,
            last_error: None,
            availability: Availability::Available,
            permission: PermissionState::Unknown,
            interim: None,
        }
    }
}

/// Individual state transitions and pipeline outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    Initialized { value: bool },
    Listening { value: bool },
    WakeDetected { value: bool },
    Capturing { value: bool },
    Speaking { value: bool },
    Error { message: String },
    PermissionChanged { permission: PermissionState },
    Interim { text: String },
    /// Transcript handed to the assistant
    Committed { text: String },
    /// Assistant reply
    Reply { text: String },
}

/// Events describing the flag changes from `old` to `new`
#[must_use]
pub fn diff(old: &InteractionState, new: &InteractionState) -> Vec<VoiceEvent> {
    let mut events = Vec::new();

    if old.is_initialized != new.is_initialized {
        events.push(VoiceEvent::Initialized {
            value: new.is_initialized,
        });
    }
    if old.is_listening != new.is_listening {
        events.push(VoiceEvent::Listening {
            value: new.is_listening,
        });
    }
    if old.is_wake_detected != new.is_wake_detected {
        events.push(VoiceEvent::WakeDetected {
            value: new.is_wake_detected,
        });
    }
    if old.is_capturing != new.is_capturing {
        events.push(VoiceEvent::Capturing {
            value: new.is_capturing,
        });
    }
    if old.is_speaking != new.is_speaking {
        events.push(VoiceEvent::Speaking {
            value: new.is_speaking,
        });
    }
    if old.permission != new.permission {
        events.push(VoiceEvent::PermissionChanged {
            permission: new.permission,
        });
    }
    if old.last_error != new.last_error
        && let Some(message) = &new.last_error
    {
        events.push(VoiceEvent::Error {
            message: message.clone(),
        });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_reports_only_changes() {
        let old = InteractionState::default();
        let mut new = old.clone();
        new.is_listening = true;
        new.permission = PermissionState::Granted;

        assert_eq!(
            diff(&old, &new),
            vec![
                VoiceEvent::Listening { value: true },
                VoiceEvent::PermissionChanged {
                    permission: PermissionState::Granted
                },
            ]
        );
        assert!(diff(&new, &new).is_empty());
    }

    #[test]
    fn cleared_error_is_not_an_event() {
        let mut old = InteractionState::default();
        old.last_error = Some("boom".to_string());
        let new = InteractionState::default();
        assert!(diff(&old, &new).is_empty());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(VoiceEvent::Committed {
            text: "Crée un rendez-vous".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "committed");

        let unavailable = serde_json::to_value(Availability::Unavailable {
            reason: "missing microphone".to_string(),
        })
        .unwrap();
        assert_eq!(unavailable["status"], "unavailable");
    }
}
