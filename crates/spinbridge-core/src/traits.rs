//! Trait abstractions over the BLE platform stack.
//!
//! The bridge talks to the radio only through [`BleCentral`] and
//! [`GattLink`], so the same orchestrator runs against btleplug in
//! production and against [`crate::mock`] in tests. Everything the platform
//! reports asynchronously arrives as a [`PlatformEvent`] on one channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use spinbridge_types::Characteristic;

use crate::error::Result;
use crate::known::MacAddress;

/// Power state reported by the host radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioState {
    /// Radio is powered and usable.
    PoweredOn,
    /// Radio is powered off.
    PoweredOff,
    /// Any other state; treated as transiently unusable.
    Unknown,
}

/// Something the platform stack reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// The radio changed power state.
    RadioState(RadioState),
    /// An advertisement was seen.
    Discovered {
        address: MacAddress,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// A peripheral dropped its connection.
    Disconnected { address: MacAddress },
    /// A subscribed characteristic delivered a value.
    Notification {
        address: MacAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Sender half of the platform event channel.
pub type PlatformEventSender = mpsc::UnboundedSender<PlatformEvent>;

/// Receiver half of the platform event channel.
pub type PlatformEventReceiver = mpsc::UnboundedReceiver<PlatformEvent>;

/// A host radio acting as BLE central.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start forwarding radio, discovery and disconnect events to `events`.
    ///
    /// The current radio state should be reported first.
    async fn listen(&self, events: PlatformEventSender) -> Result<()>;

    /// Start scanning for advertisements.
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a peripheral.
    ///
    /// Notifications from characteristics later subscribed through the
    /// returned link are delivered to `events`.
    async fn connect(
        &self,
        address: &MacAddress,
        events: PlatformEventSender,
    ) -> Result<Box<dyn GattLink>>;
}

/// A live GATT connection to one peripheral.
///
/// The link is owned by exactly one device session and dropped on every
/// disconnect; a new link is created for each connection attempt.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Enumerate services and return the UUIDs of every characteristic found.
    async fn discover_services(&mut self) -> Result<Vec<Uuid>>;

    /// Enable notifications for a characteristic.
    async fn subscribe(&mut self, characteristic: Characteristic) -> Result<()>;

    /// Tear the connection down.
    async fn disconnect(&mut self) -> Result<()>;
}
