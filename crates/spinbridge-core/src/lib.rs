//! BLE session management and telemetry publishing for fitness sensors.
//!
//! This crate keeps a fixed set of known sensors connected over Bluetooth
//! Low Energy, folds their notifications into one live snapshot and posts
//! that snapshot to an HTTP metrics sink once per second.
//!
//! # Features
//!
//! - **Adapter health**: resolve the preferred radio by vendor, start the
//!   host Bluetooth service, bring the radio up, recover after power loss
//! - **Device sessions**: per-device state machine with stale-completion
//!   protection and a fixed reconnect delay
//! - **Decoding**: heart rate, cycling power and CSC cadence (via
//!   [`spinbridge_types`])
//! - **Publishing**: fire-and-forget JSON POSTs that never stall BLE handling
//! - **Mocks**: a scripted platform, host and sink for hardware-free tests
//!
//! # Platform
//!
//! Adapter management drives the BlueZ command line tools (`hciconfig`,
//! `systemctl`) and therefore targets Linux. The BLE layer itself goes
//! through btleplug behind the [`BleCentral`] trait.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use spinbridge_core::{
//!     AdapterHealthManager, AdapterSettings, Bridge, BridgeConfig, BtleplugCentral, HttpSink,
//!     SystemHost,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = Arc::new(SystemHost::new(Duration::from_secs(10)));
//!     let mut health = AdapterHealthManager::new(host, AdapterSettings::default());
//!     let index = health.initialize().await?;
//!
//!     let central = Arc::new(BtleplugCentral::bind(index).await?);
//!     let sink = Arc::new(HttpSink::new(
//!         "http://localhost:3000/api/metrics",
//!         Duration::from_secs(2),
//!     )?);
//!
//!     let bridge = Bridge::new(BridgeConfig::default(), central, sink, Arc::new(health))?;
//!     bridge.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod bridge;
pub mod cadence;
pub mod error;
pub mod events;
pub mod known;
pub mod mock;
pub mod platform;
pub mod session;
pub mod sink;
pub mod snapshot;
pub mod traits;

pub use adapter::{
    AdapterHealthManager, AdapterRecovery, AdapterSettings, CommandOutput, HostControl,
    RadioInfo, RecoveryOutcome, SystemHost, parse_radio_list,
};
pub use bridge::{Bridge, BridgeConfig};
pub use cadence::CadenceTracker;
pub use error::{AdapterUnavailableReason, Error, Result};
pub use events::{BridgeEvent, EventDispatcher, EventReceiver, EventSender};
pub use known::{KnownDevice, MacAddress, default_devices};
pub use platform::{BtleLink, BtleplugCentral};
pub use session::{DeviceSession, Generation, SessionState};
pub use sink::{HttpSink, PublishError, TelemetrySink};
pub use snapshot::TelemetrySnapshot;
pub use traits::{
    BleCentral, GattLink, PlatformEvent, PlatformEventReceiver, PlatformEventSender, RadioState,
};

// Re-export the platform-agnostic types.
pub use spinbridge_types::{
    Characteristic, CrankSample, CscMeasurement, Measurement, Metric, ParseError,
    TelemetryPayload, WheelSample,
};
