//! Per-device connection state machine.
//!
//! ```text
//!            advertisement          connect ok            all subscribed
//!   Idle ──────────────────▶ Connecting ───────▶ DiscoveringServices ──────▶ Subscribed
//!    ▲                           │                       │                       │
//!    │ reconnect timer           │ error                 │ error                 │ disconnect
//!    │                           ▼                       ▼                       ▼
//!    └──────────────────────────────────── Disconnected ◀─────────────────────────┘
//! ```
//!
//! Each connection attempt is tagged with a generation number. Leaving a
//! connection (disconnect, failure, radio loss) bumps the generation so that
//! late completions from an abandoned attempt are recognized and discarded.

use std::fmt;

use serde::{Deserialize, Serialize};

use spinbridge_types::{Characteristic, CrankSample};

use crate::cadence::CadenceTracker;
use crate::known::KnownDevice;
use crate::traits::GattLink;

/// Connection state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No connection attempted since the last reset.
    Idle,
    /// A connect call is outstanding.
    Connecting,
    /// Connected; enumerating services and subscribing.
    DiscoveringServices,
    /// Notifications are live.
    Subscribed,
    /// Connection dropped; waiting for the reconnect timer.
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::DiscoveringServices => "discovering services",
            SessionState::Subscribed => "subscribed",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Identifies one connection attempt of a session.
pub type Generation = u64;

/// Connection lifecycle for one [`KnownDevice`].
pub struct DeviceSession {
    device: KnownDevice,
    state: SessionState,
    generation: Generation,
    link: Option<Box<dyn GattLink>>,
    subscribed: Vec<Characteristic>,
    cadence: CadenceTracker,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.device.name)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("has_link", &self.link.is_some())
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

impl DeviceSession {
    /// A new idle session.
    pub fn new(device: KnownDevice) -> Self {
        Self {
            device,
            state: SessionState::Idle,
            generation: 0,
            link: None,
            subscribed: Vec::new(),
            cadence: CadenceTracker::new(),
        }
    }

    pub fn device(&self) -> &KnownDevice {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Characteristics with live notifications.
    pub fn subscribed(&self) -> &[Characteristic] {
        &self.subscribed
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == SessionState::Subscribed
    }

    /// Whether this session holds a connection or an attempt in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connecting | SessionState::DiscoveringServices | SessionState::Subscribed
        )
    }

    /// Idle → Connecting. Returns the generation of the new attempt.
    pub fn begin_connect(&mut self) -> Option<Generation> {
        if self.state != SessionState::Idle {
            return None;
        }
        self.generation += 1;
        self.state = SessionState::Connecting;
        self.cadence.reset();
        Some(self.generation)
    }

    /// Connecting → DiscoveringServices, if `generation` is current.
    pub fn connected(&mut self, generation: Generation) -> bool {
        if self.generation != generation || self.state != SessionState::Connecting {
            return false;
        }
        self.state = SessionState::DiscoveringServices;
        true
    }

    /// DiscoveringServices → Subscribed, taking ownership of the link.
    ///
    /// A stale or unexpected completion hands the link back so the caller
    /// can close it.
    pub fn establish(
        &mut self,
        generation: Generation,
        link: Box<dyn GattLink>,
        subscribed: Vec<Characteristic>,
    ) -> Result<(), Box<dyn GattLink>> {
        if self.generation != generation || self.state != SessionState::DiscoveringServices {
            return Err(link);
        }
        self.state = SessionState::Subscribed;
        self.link = Some(link);
        self.subscribed = subscribed;
        Ok(())
    }

    /// A connection attempt failed. Moves Connecting or DiscoveringServices
    /// to Disconnected if `generation` is current.
    pub fn attempt_failed(&mut self, generation: Generation) -> bool {
        if self.generation != generation
            || !matches!(
                self.state,
                SessionState::Connecting | SessionState::DiscoveringServices
            )
        {
            return false;
        }
        self.enter_disconnected();
        true
    }

    /// Any active state → Disconnected.
    ///
    /// Returns the link that was held, if any. Returns `None` and leaves the
    /// session untouched when it was not active.
    pub fn disconnect(&mut self) -> Option<Option<Box<dyn GattLink>>> {
        if !self.is_active() {
            return None;
        }
        Some(self.enter_disconnected())
    }

    /// Disconnected → Idle when the reconnect timer for `generation` fires.
    pub fn reconnect_due(&mut self, generation: Generation) -> bool {
        if self.generation != generation || self.state != SessionState::Disconnected {
            return false;
        }
        self.state = SessionState::Idle;
        true
    }

    /// Feed a crank sample to this connection's cadence tracker.
    pub fn observe_crank(&mut self, sample: CrankSample) -> Option<u16> {
        self.cadence.update(sample)
    }

    /// Take the link out for shutdown.
    pub fn take_link(&mut self) -> Option<Box<dyn GattLink>> {
        self.link.take()
    }

    fn enter_disconnected(&mut self) -> Option<Box<dyn GattLink>> {
        self.generation += 1;
        self.state = SessionState::Disconnected;
        self.subscribed.clear();
        self.cadence.reset();
        self.link.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::known::default_devices;
    use crate::mock::MockLink;

    fn session() -> DeviceSession {
        DeviceSession::new(default_devices().remove(0))
    }

    fn crank(revolutions: u16, event_time: u16) -> CrankSample {
        CrankSample {
            revolutions,
            event_time,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Idle);

        let generation = s.begin_connect().unwrap();
        assert_eq!(s.state(), SessionState::Connecting);
        assert!(s.begin_connect().is_none());

        assert!(s.connected(generation));
        assert_eq!(s.state(), SessionState::DiscoveringServices);

        let link = Box::new(MockLink::new());
        assert!(
            s.establish(generation, link, vec![Characteristic::CyclingPower])
                .is_ok()
        );
        assert!(s.is_subscribed());
        assert_eq!(s.subscribed(), &[Characteristic::CyclingPower]);
    }

    #[test]
    fn test_disconnect_then_reconnect_timer() {
        let mut s = session();
        let generation = s.begin_connect().unwrap();
        s.connected(generation);
        assert!(
            s.establish(generation, Box::new(MockLink::new()), vec![])
                .is_ok()
        );

        let link = s.disconnect().unwrap();
        assert!(link.is_some());
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(s.subscribed().is_empty());

        // Timer armed with the pre-disconnect generation is stale.
        assert!(!s.reconnect_due(generation));
        assert!(s.reconnect_due(s.generation()));
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_disconnect_ignored_when_inactive() {
        let mut s = session();
        assert!(s.disconnect().is_none());
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_attempt_failure() {
        let mut s = session();
        let generation = s.begin_connect().unwrap();
        assert!(s.attempt_failed(generation));
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(!s.attempt_failed(generation));
    }

    #[test]
    fn test_stale_establish_returns_link() {
        let mut s = session();
        let generation = s.begin_connect().unwrap();
        s.connected(generation);
        // Peer dropped while services were being discovered.
        s.disconnect();

        let result = s.establish(generation, Box::new(MockLink::new()), vec![]);
        assert!(result.is_err());
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_cadence_reset_across_reconnect() {
        let mut s = session();
        let generation = s.begin_connect().unwrap();
        s.connected(generation);
        assert!(
            s.establish(generation, Box::new(MockLink::new()), vec![])
                .is_ok()
        );

        assert_eq!(s.observe_crank(crank(50, 0)), None);
        assert_eq!(s.observe_crank(crank(51, 1024)), Some(60));

        s.disconnect();
        s.reconnect_due(s.generation());
        let generation = s.begin_connect().unwrap();
        s.connected(generation);
        assert!(
            s.establish(generation, Box::new(MockLink::new()), vec![])
                .is_ok()
        );

        // Counters are continuous but the first sample is baseline only.
        assert_eq!(s.observe_crank(crank(52, 2048)), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            SessionState::DiscoveringServices.to_string(),
            "discovering services"
        );
    }
}
