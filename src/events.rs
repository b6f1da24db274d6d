use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Dialing,
    Connected,
    Ended,
    Blocked,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    TornDown,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: CallStatus,
    pub elapsed_seconds: u64,
    pub minimized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Default for StatusEvent {
    fn default() -> Self {
        Self {
            status: CallStatus::Dialing,
            elapsed_seconds: 0,
            minimized: false,
            reason: None,
        }
    }
}

/// User intent for the local media toggles. Intent is distinct from device
/// acquisition success: `camera_enabled` may lead or trail the live track.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MediaStateEvent {
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub screen_sharing: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    PermissionDenied,
    DeviceUnavailable,
    CameraUnavailable,
    ScreenShareUnavailable,
}

/// Non-blocking user-facing notice. The only blocking presentation is the
/// `Blocked` status itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoticeEvent {
    pub kind: NoticeKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ActivityEvent {
    pub local_speaking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_remote: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp_ms: u64,
}

/// Final report handed back to the collaborator that initiated the call.
/// Emitted exactly once per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallSummary {
    pub duration_seconds: u64,
    pub kind: CallKind,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Status(StatusEvent),
    Media(MediaStateEvent),
    Notice(NoticeEvent),
    Activity(ActivityEvent),
    Message(MessageEvent),
    Summary(CallSummary),
}

/// Fan-out of session events. Dropped receivers and lagging subscribers are
/// not errors; the shared-state snapshots remain the source of truth.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_status(&self, payload: &StatusEvent) {
        self.emit(CallEvent::Status(payload.clone()));
    }

    pub fn emit_media(&self, payload: &MediaStateEvent) {
        self.emit(CallEvent::Media(*payload));
    }

    pub fn emit_notice(&self, payload: &NoticeEvent) {
        self.emit(CallEvent::Notice(payload.clone()));
    }

    pub fn emit_activity(&self, payload: &ActivityEvent) {
        self.emit(CallEvent::Activity(payload.clone()));
    }

    pub fn emit_message(&self, payload: &MessageEvent) {
        self.emit(CallEvent::Message(payload.clone()));
    }

    pub fn emit_summary(&self, payload: &CallSummary) {
        self.emit(CallEvent::Summary(payload.clone()));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_lowercase_status() {
        let event = StatusEvent {
            status: CallStatus::Connected,
            elapsed_seconds: 12,
            minimized: false,
            reason: None,
        };
        let json = serde_json::to_string(&event).expect("serializes status event");
        assert!(json.contains("\"connected\""));
        assert!(!json.contains("reason"));
    }

    #[test]
    fn emit_without_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        bus.emit_media(&MediaStateEvent::default());
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit_summary(&CallSummary {
            duration_seconds: 3,
            kind: CallKind::Audio,
            reason: EndReason::LocalHangUp,
        });

        let event = rx.recv().await.expect("receives event");
        match event {
            CallEvent::Summary(summary) => assert_eq!(summary.duration_seconds, 3),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
