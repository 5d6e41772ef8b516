//! Flow events: broadcast of every user-visible side effect.
//!
//! Notices, navigations, location rewrites, confirmation prompts and
//! countdown ticks are published here; a browser shell (or a test)
//! subscribes and renders them.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::workflow::state::StepId;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Events published by the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// Non-blocking notification for the user.
    Notice { level: NoticeLevel, message: String },
    /// Move the browser to `url`.
    Navigate { step: StepId, url: String },
    /// Rewrite the visible location without navigating.
    LocationReplaced { url: String },
    /// Leaving `from` needs the user's confirmation.
    ConfirmationRequested { from: StepId, to: StepId },
    /// A navigation to `to` will follow after `delay_ms`.
    Redirecting { to: StepId, delay_ms: u64 },
    /// Expiry countdown progress in `[0, 1]`.
    Countdown { progress: f32, remaining_ms: u64 },
}

/// Fan-out of flow events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: FlowEvent) {
        debug!(?event, "Flow event");
        // Ok if nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(FlowEvent::Notice {
            level,
            message: message.into(),
        });
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

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.notice(NoticeLevel::Success, "Step completed");
        match rx.recv().await.unwrap() {
            FlowEvent::Notice { level, message } => {
                assert_eq!(level, NoticeLevel::Success);
                assert_eq!(message, "Step completed");
            }
            other => panic!("Expected Notice, got {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(FlowEvent::LocationReplaced {
            url: "/flow/signin".into(),
        });
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = FlowEvent::Navigate {
            step: StepId::from("bank"),
            url: "/flow/bank?session_id=s1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "navigate");
        assert_eq!(json["step"], "bank");
    }
}
