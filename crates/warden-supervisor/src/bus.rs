//! Lifecycle event bus.
//!
//! A single [`tokio::sync::broadcast`] channel carrying [`LifecycleEvent`]s.
//! Every subscriber receives every event; a slow subscriber loses the oldest
//! events instead of holding up the supervisor.

use tokio::sync::broadcast;
use tracing::warn;
use warden_types::{LifecycleEvent, LifecycleKind};

/// Events buffered per subscriber before the oldest are dropped.
const DEFAULT_CAPACITY: usize = 256;

/// Shared handle; clones publish into the same channel.
#[derive(Clone, Debug)]
pub struct LifecycleBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `event`, returning how many subscribers received it.
    ///
    /// Having no subscribers is normal; the event is dropped and `0` returned.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn emit(&self, service: &str, kind: LifecycleKind) -> usize {
        self.publish(LifecycleEvent::new(service, kind))
    }

    pub fn subscribe(&self) -> LifecycleReceiver {
        LifecycleReceiver {
            receiver: self.sender.subscribe(),
            service: None,
        }
    }

    /// Subscribe to the events of one service only.
    pub fn subscribe_service(&self, service: impl Into<String>) -> LifecycleReceiver {
        LifecycleReceiver {
            receiver: self.sender.subscribe(),
            service: Some(service.into()),
        }
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct LifecycleReceiver {
    receiver: broadcast::Receiver<LifecycleEvent>,
    service: Option<String>,
}

impl LifecycleReceiver {
    /// Wait for the next matching event.
    ///
    /// Returns `None` once every bus handle has been dropped.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.service.as_deref().is_none_or(|s| s == event.service) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "Lifecycle subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.service.as_deref().is_none_or(|s| s == event.service) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "Lifecycle subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_every_event() {
        let bus = LifecycleBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.emit("tts", LifecycleKind::Starting { attempt: 1 }), 2);

        assert_eq!(a.recv().await.expect("event").service, "tts");
        assert_eq!(b.recv().await.expect("event").kind, LifecycleKind::Starting { attempt: 1 });
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let bus = LifecycleBus::default();
        assert_eq!(bus.emit("tts", LifecycleKind::Stopped), 0);
    }

    #[tokio::test]
    async fn service_subscriber_filters_other_services() {
        let bus = LifecycleBus::default();
        let mut only_asr = bus.subscribe_service("asr");

        bus.emit("tts", LifecycleKind::Stopping);
        bus.emit("asr", LifecycleKind::Running { pid: Some(42) });

        let event = only_asr.recv().await.expect("event");
        assert_eq!(event.service, "asr");
        assert!(only_asr.try_recv().is_none());
    }

    #[tokio::test]
    async fn lagged_subscriber_keeps_receiving() {
        let bus = LifecycleBus::new(2);
        let mut rx = bus.subscribe();
        for attempt in 1..=5 {
            bus.emit("llm", LifecycleKind::Starting { attempt });
        }
        // The two newest survive.
        assert_eq!(rx.recv().await.expect("event").kind, LifecycleKind::Starting { attempt: 4 });
        assert_eq!(rx.recv().await.expect("event").kind, LifecycleKind::Starting { attempt: 5 });
    }

    #[tokio::test]
    async fn receiver_ends_when_bus_dropped() {
        let bus = LifecycleBus::default();
        let mut rx = bus.subscribe();
        drop(bus);
        assert!(rx.recv().await.is_none());
    }
}
