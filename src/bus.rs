//! In-process notification bus: a typed broadcast fan-out mirroring the
//! discriminated-union `WsMessage` pattern used for the websocket push
//! channel elsewhere in this stack, minus the serde/JSON layer since
//! everything here stays in-process.

use tokio::sync::broadcast;

use crate::device_registry::DeviceSnapshot;
use crate::store::{BatchRow, EventRow};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Notification {
    DeviceRegistered(DeviceSnapshot),
    DeviceConnected(DeviceSnapshot),
    DeviceOnline(DeviceSnapshot),
    DeviceIdle(DeviceSnapshot),
    DeviceStale(DeviceSnapshot),
    DeviceDisconnected(DeviceSnapshot),
    DeviceUpdated(DeviceSnapshot),

    BatchStarted(BatchRow),
    BatchEnded(BatchRow),
    BatchSynced(BatchRow),

    EventCaptured(EventRow),
    EventSynced { event_id: String, cloud_event_id: String },
    EventFailed { event_id: String, error: String },
}

/// Cloneable handle; every component that needs to publish or subscribe
/// holds one. Dropping all receivers does not close the bus — `Sender::send`
/// returning an error (no subscribers) is expected and ignored.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Notification>,
}

impl Default for Bus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        // Err means no receivers are currently subscribed; that's routine,
        // not a failure of the publishing operation.
        let _ = self.tx.send(notification);
    }
}
