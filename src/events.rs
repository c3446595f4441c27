//! Engine event bus.
//!
//! Collaborators (alerting, export, UI) observe the pipeline by subscribing
//! here; the core never knows their concrete types. Built on a broadcast
//! channel so any number of subscribers can register independently. A
//! subscriber that falls behind loses the oldest events, which is acceptable
//! for advisory notifications.

use tokio::sync::broadcast;

use crate::models::{DataSourceState, UsageSnapshot};
use crate::sources::SourceKind;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A snapshot was produced and, when it carried a percentage, persisted.
    SnapshotProduced(UsageSnapshot),
    SourceStateChanged {
        source: SourceKind,
        state: DataSourceState,
    },
    /// Emitted once per remote outage, on the first cycle that falls back.
    FallbackEngaged { reason: String },
    /// The failure ceiling was reached; polling is halted until reset.
    CircuitOpened { total_failures: u32 },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Send to whoever is listening. No subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
