//! Lifecycle events broadcast by the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unified wrapper for everything published on the lifecycle bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Service the event is about.
    pub service: String,
    pub kind: LifecycleKind,
}

impl LifecycleEvent {
    pub fn new(service: impl Into<String>, kind: LifecycleKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            service: service.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleKind {
    Starting { attempt: u32 },
    Running { pid: Option<u32> },
    AttemptFailed { attempt: u32, reason: String },
    Failed { reason: String },
    Registered { id: String },
    Deregistered { id: String },
    Stopping,
    Stopped,
    /// A running process exited on its own.
    Crashed { exit_code: Option<i32> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_with_event_tag() {
        let event = LifecycleEvent::new("tts", LifecycleKind::Crashed { exit_code: Some(137) });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"crashed\""));
        let back: LifecycleEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
