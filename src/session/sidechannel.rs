//! In-call text side-channel. Messages live only as long as the session; the
//! transcript is dropped with the controller, never persisted.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::events::MessageEvent;

use super::LocalIdentity;

pub struct SideChannel {
    local: LocalIdentity,
    messages: Vec<MessageEvent>,
}

impl SideChannel {
    pub fn new(local: LocalIdentity) -> Self {
        Self {
            local,
            messages: Vec::new(),
        }
    }

    /// Appends a message authored by the local user. Whitespace-only input is
    /// discarded and nothing is emitted.
    pub fn push_local(&mut self, text: &str) -> Option<MessageEvent> {
        self.push(self.local.id.clone(), self.local.name.clone(), text)
    }

    /// Appends a message attributed to a remote participant, as a transport
    /// integration (or a demo driver) would deliver it.
    pub fn push_remote(
        &mut self,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        text: &str,
    ) -> Option<MessageEvent> {
        self.push(sender_id.into(), sender_name.into(), text)
    }

    fn push(&mut self, sender_id: String, sender_name: String, text: &str) -> Option<MessageEvent> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        let message = MessageEvent {
            id: Uuid::new_v4().to_string(),
            sender_id,
            sender_name,
            text: trimmed.to_string(),
            timestamp_ms: epoch_millis(),
        };
        self.messages.push(message.clone());
        Some(message)
    }

    pub fn messages(&self) -> &[MessageEvent] {
        &self.messages
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
