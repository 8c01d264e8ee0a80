//! Bridge lifecycle events.
//!
//! The orchestrator broadcasts a [`BridgeEvent`] for every state change it
//! makes so embedders and tests can follow along without polling.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use spinbridge_types::{Characteristic, Metric};

use crate::adapter::RecoveryOutcome;
use crate::known::MacAddress;
use crate::session::SessionState;
use crate::traits::RadioState;

/// Events emitted by the bridge.
///
/// All events are serializable for logging and IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum BridgeEvent {
    /// The host radio reported a new power state.
    RadioState { state: RadioState },
    /// Scanning was started or stopped.
    Scanning { active: bool },
    /// A device session moved to a new state.
    SessionState {
        device: String,
        address: MacAddress,
        state: SessionState,
    },
    /// A characteristic could not be subscribed and was skipped.
    SubscriptionSkipped {
        device: String,
        characteristic: Characteristic,
        error: String,
    },
    /// A decoded value was written to the snapshot.
    Measurement {
        device: String,
        metric: Metric,
        value: u16,
    },
    /// A notification was dropped because it failed to decode.
    DecodeFailed {
        device: String,
        characteristic: Characteristic,
        error: String,
    },
    /// Posting the snapshot to the sink failed.
    PublishFailed { error: String },
    /// An adapter recovery attempt finished.
    Recovery { outcome: RecoveryOutcome },
}

/// Sender for bridge events.
pub type EventSender = broadcast::Sender<BridgeEvent>;

/// Receiver for bridge events.
pub type EventReceiver = broadcast::Receiver<BridgeEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: BridgeEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}
