use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::process::{ChildExit, Slot};

/// Lifecycle events published by the supervisor engine.
#[derive(Debug, Clone)]
pub enum Event {
    Started {
        id: String,
        pid: u32,
    },
    Exited {
        id: String,
        exit: ChildExit,
        expected: bool,
    },
    Restarted {
        id: String,
        restarts: u32,
    },
    Failed {
        id: String,
        reason: String,
    },
    ReloadSucceeded {
        id: String,
        active_slot: Slot,
    },
    ReloadFailed {
        id: String,
        reason: String,
    },
}

impl Event {
    pub fn id(&self) -> &str {
        match self {
            Event::Started { id, .. }
            | Event::Exited { id, .. }
            | Event::Restarted { id, .. }
            | Event::Failed { id, .. }
            | Event::ReloadSucceeded { id, .. }
            | Event::ReloadFailed { id, .. } => id,
        }
    }
}

/// Broadcast channel behind `subscribe_events()`. Publishing never
/// blocks; slow subscribers lag and drop, they do not back-pressure
/// the reducer.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

/// Outbound alert collaborator. Implementations must return without
/// blocking; queue or drop internally.
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Default sink: failures land in the daemon log.
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::Failed { id, reason } => warn!(id = %id, reason = %reason, "process failed"),
            Event::ReloadFailed { id, reason } => warn!(id = %id, reason = %reason, "reload failed"),
            other => info!(id = other.id(), "event: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::process::ChildExit;

    use super::{Event, EventBus};

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(Event::Started {
            id: "web".to_string(),
            pid: 42,
        });

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.expect("subscriber should receive event");
            assert!(matches!(event, Event::Started { ref id, pid: 42 } if id == "web"));
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(4);
        bus.publish(Event::Exited {
            id: "web".to_string(),
            exit: ChildExit::Code(0),
            expected: true,
        });
    }

    #[test]
    fn event_id_projection_covers_all_variants() {
        let events = [
            Event::Started {
                id: "a".into(),
                pid: 1,
            },
            Event::Exited {
                id: "a".into(),
                exit: ChildExit::Code(1),
                expected: false,
            },
            Event::Restarted {
                id: "a".into(),
                restarts: 1,
            },
            Event::Failed {
                id: "a".into(),
                reason: "boom".into(),
            },
            Event::ReloadSucceeded {
                id: "a".into(),
                active_slot: crate::process::Slot::Green,
            },
            Event::ReloadFailed {
                id: "a".into(),
                reason: "unhealthy".into(),
            },
        ];
        for event in &events {
            assert_eq!(event.id(), "a");
        }
    }
}
