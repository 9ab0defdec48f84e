use crate::core::events::TelemetryEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Fan-out of coordinator messages to every connected observer. Each observer gets its own
/// bounded queue; one that falls behind loses the oldest messages instead of stalling `publish`.
#[derive(Clone)]
pub struct TelemetryBroadcaster {
    tx: broadcast::Sender<TelemetryEvent>,
}

pub type Observer = broadcast::Receiver<TelemetryEvent>;

impl TelemetryBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Observers connected after a publish never see it. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Observer {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish(&self, event: TelemetryEvent) {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(n) => trace!(kind, observers = n, "telemetry published"),
            Err(_) => trace!(kind, "telemetry dropped, no observers"),
        }
    }
}
