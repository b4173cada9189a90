//! Change notification delivery.

use tokio::sync::broadcast;
use tracing::debug;

use waypoint_core::events::HistoryEvent;

/// Receives change events from the history engine.
///
/// Delivery is fire-and-forget: implementations must not block and the
/// engine ignores whether anyone is listening.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: HistoryEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: HistoryEvent) {}
}

/// Fans events out to any number of subscribers over a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<HistoryEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<HistoryEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, event: HistoryEvent) {
        debug!(event = event.event_name(), "History notification");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
