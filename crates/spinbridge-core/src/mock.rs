//! Mock platform, host and sink implementations for testing.
//!
//! These let the whole bridge run without Bluetooth hardware, root access
//! or a metrics server:
//!
//! - [`MockCentral`] scripts connection outcomes and injects platform events
//! - [`MockLink`] scripts service discovery and subscribe results
//! - [`MockHost`] answers host commands from a table and records invocations
//! - [`MockRecovery`] returns scripted adapter recovery outcomes
//! - [`RecordingSink`] captures published payloads and can inject failures

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use spinbridge_types::{Characteristic, TelemetryPayload};

use crate::adapter::{AdapterRecovery, CommandOutput, HostControl, RecoveryOutcome};
use crate::error::{AdapterUnavailableReason, Error, Result};
use crate::known::MacAddress;
use crate::sink::{PublishError, TelemetrySink};
use crate::traits::{BleCentral, GattLink, PlatformEvent, PlatformEventSender, RadioState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted result of a [`MockCentral::connect`] call.
pub enum MockConnect {
    /// Connect succeeds with this link.
    Link(MockLink),
    /// Connect fails with this reason.
    Fail(String),
    /// Connect never completes.
    Hang,
}

/// Scan request recorded by [`MockCentral`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCall {
    Start,
    Stop,
}

/// A mock BLE central.
///
/// Connects succeed with a default [`MockLink`] unless a script was queued
/// for the address with [`push_connect`](Self::push_connect).
pub struct MockCentral {
    initial_state: RadioState,
    events: Mutex<Option<PlatformEventSender>>,
    scan_calls: Mutex<Vec<ScanCall>>,
    connect_calls: Mutex<Vec<MacAddress>>,
    scripts: Mutex<HashMap<MacAddress, VecDeque<MockConnect>>>,
    records: Mutex<Vec<(MacAddress, LinkRecord)>>,
    connect_latency: Duration,
    scan_failures: AtomicU32,
}

impl std::fmt::Debug for MockCentral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCentral")
            .field("initial_state", &self.initial_state)
            .field("scan_calls", &*lock(&self.scan_calls))
            .field("connect_calls", &*lock(&self.connect_calls))
            .finish()
    }
}

impl Default for MockCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCentral {
    /// A central whose radio reports powered on when listening starts.
    pub fn new() -> Self {
        Self::with_radio_state(RadioState::PoweredOn)
    }

    /// A central reporting `state` when listening starts.
    pub fn with_radio_state(state: RadioState) -> Self {
        Self {
            initial_state: state,
            events: Mutex::new(None),
            scan_calls: Mutex::new(Vec::new()),
            connect_calls: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
            connect_latency: Duration::ZERO,
            scan_failures: AtomicU32::new(0),
        }
    }

    /// Delay every connect call by `latency`.
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Make the next `count` scan starts fail. Failed starts are not recorded.
    pub fn fail_scan_starts(&self, count: u32) {
        self.scan_failures.store(count, Ordering::SeqCst);
    }

    /// Queue the outcome of the next connect to `address`.
    pub fn push_connect(&self, address: &MacAddress, outcome: MockConnect) {
        lock(&self.scripts)
            .entry(address.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Inject a platform event. Returns false if nobody is listening.
    pub fn emit(&self, event: PlatformEvent) -> bool {
        match &*lock(&self.events) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Inject an advertisement from `address`.
    pub fn advertise(&self, address: &MacAddress) -> bool {
        self.emit(PlatformEvent::Discovered {
            address: address.clone(),
            name: None,
            rssi: Some(-60),
        })
    }

    /// Inject a notification.
    pub fn notify(
        &self,
        address: &MacAddress,
        characteristic: Characteristic,
        value: impl Into<Vec<u8>>,
    ) -> bool {
        self.emit(PlatformEvent::Notification {
            address: address.clone(),
            characteristic: characteristic.uuid(),
            value: value.into(),
        })
    }

    /// Inject a peer disconnect.
    pub fn drop_connection(&self, address: &MacAddress) -> bool {
        self.emit(PlatformEvent::Disconnected {
            address: address.clone(),
        })
    }

    /// Inject a radio power change.
    pub fn set_radio(&self, state: RadioState) -> bool {
        self.emit(PlatformEvent::RadioState(state))
    }

    /// Scan start/stop requests in order.
    pub fn scan_calls(&self) -> Vec<ScanCall> {
        lock(&self.scan_calls).clone()
    }

    /// Whether the last scan request was a start.
    pub fn is_scanning(&self) -> bool {
        lock(&self.scan_calls).last() == Some(&ScanCall::Start)
    }

    /// Addresses passed to connect, in order.
    pub fn connect_calls(&self) -> Vec<MacAddress> {
        lock(&self.connect_calls).clone()
    }

    /// Records for every link handed out for `address`, oldest first.
    pub fn links(&self, address: &MacAddress) -> Vec<LinkRecord> {
        lock(&self.records)
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    async fn listen(&self, events: PlatformEventSender) -> Result<()> {
        let _ = events.send(PlatformEvent::RadioState(self.initial_state));
        *lock(&self.events) = Some(events);
        Ok(())
    }

    async fn start_scan(&self) -> Result<()> {
        let fail = self
            .scan_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::AdapterUnavailable(
                AdapterUnavailableReason::AdapterDown { index: 0 },
            ));
        }
        lock(&self.scan_calls).push(ScanCall::Start);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        lock(&self.scan_calls).push(ScanCall::Stop);
        Ok(())
    }

    async fn connect(
        &self,
        address: &MacAddress,
        _events: PlatformEventSender,
    ) -> Result<Box<dyn GattLink>> {
        lock(&self.connect_calls).push(address.clone());
        let script = lock(&self.scripts)
            .get_mut(address)
            .and_then(|queue| queue.pop_front());

        if !self.connect_latency.is_zero() {
            tokio::time::sleep(self.connect_latency).await;
        }

        match script.unwrap_or_else(|| MockConnect::Link(MockLink::new())) {
            MockConnect::Link(mut link) => {
                link.address = Some(address.clone());
                lock(&self.records).push((address.clone(), link.record()));
                Ok(Box::new(link))
            }
            MockConnect::Fail(reason) => Err(Error::connection_failed(address.as_str(), reason)),
            MockConnect::Hang => futures::future::pending().await,
        }
    }
}

#[derive(Debug, Default)]
struct LinkLog {
    subscribed: Vec<Characteristic>,
    disconnected: bool,
}

/// Read-only view of what happened to a [`MockLink`].
#[derive(Debug, Clone, Default)]
pub struct LinkRecord(Arc<Mutex<LinkLog>>);

impl LinkRecord {
    /// Characteristics successfully subscribed.
    pub fn subscribed(&self) -> Vec<Characteristic> {
        lock(&self.0).subscribed.clone()
    }

    /// Whether disconnect was called.
    pub fn was_disconnected(&self) -> bool {
        lock(&self.0).disconnected
    }
}

/// A mock GATT link.
///
/// Exposes every supported characteristic unless told otherwise.
pub struct MockLink {
    available: Vec<Uuid>,
    failing_subscribes: HashSet<Characteristic>,
    discovery_error: Option<String>,
    discovery_hangs: bool,
    log: LinkRecord,
    address: Option<MacAddress>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            available: Characteristic::ALL.iter().map(|c| c.uuid()).collect(),
            failing_subscribes: HashSet::new(),
            discovery_error: None,
            discovery_hangs: false,
            log: LinkRecord::default(),
            address: None,
        }
    }

    /// Do not expose `characteristic`.
    pub fn without(mut self, characteristic: Characteristic) -> Self {
        self.available.retain(|u| *u != characteristic.uuid());
        self
    }

    /// Make subscribing to `characteristic` fail.
    pub fn fail_subscribe(mut self, characteristic: Characteristic) -> Self {
        self.failing_subscribes.insert(characteristic);
        self
    }

    /// Make service discovery fail.
    pub fn fail_discovery(mut self, reason: impl Into<String>) -> Self {
        self.discovery_error = Some(reason.into());
        self
    }

    /// Make service discovery never complete.
    pub fn hang_discovery(mut self) -> Self {
        self.discovery_hangs = true;
        self
    }

    /// A record sharing this link's log.
    pub fn record(&self) -> LinkRecord {
        self.log.clone()
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn discover_services(&mut self) -> Result<Vec<Uuid>> {
        if self.discovery_hangs {
            futures::future::pending::<()>().await;
        }
        if let Some(reason) = &self.discovery_error {
            return Err(Error::connection_failed(
                self.address.as_ref().map(|a| a.as_str()).unwrap_or("mock"),
                reason.clone(),
            ));
        }
        Ok(self.available.clone())
    }

    async fn subscribe(&mut self, characteristic: Characteristic) -> Result<()> {
        if self.failing_subscribes.contains(&characteristic) {
            return Err(Error::connection_failed(
                self.address.as_ref().map(|a| a.as_str()).unwrap_or("mock"),
                format!("subscribe to {} rejected", characteristic),
            ));
        }
        lock(&self.log.0).subscribed.push(characteristic);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        lock(&self.log.0).disconnected = true;
        Ok(())
    }
}

/// A mock host answering commands from a table.
///
/// Commands are keyed by `program args...` joined with spaces. A scripted
/// sequence is consumed in order and its last entry repeats.
#[derive(Debug, Default)]
pub struct MockHost {
    responses: Mutex<HashMap<String, VecDeque<Option<CommandOutput>>>>,
    calls: Mutex<Vec<String>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `command` with `output`.
    pub fn respond(&self, command: &str, output: CommandOutput) {
        lock(&self.responses).insert(command.to_string(), VecDeque::from([Some(output)]));
    }

    /// Answer `command` with each output in turn, repeating the last.
    pub fn respond_sequence(
        &self,
        command: &str,
        outputs: impl IntoIterator<Item = CommandOutput>,
    ) {
        lock(&self.responses).insert(
            command.to_string(),
            outputs.into_iter().map(Some).collect(),
        );
    }

    /// Make `command` fail to run.
    pub fn fail(&self, command: &str) {
        lock(&self.responses).insert(command.to_string(), VecDeque::from([None]));
    }

    /// Every command run so far.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl HostControl for MockHost {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        lock(&self.calls).push(command.clone());

        let mut responses = lock(&self.responses);
        let response = match responses.get_mut(&command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().flatten(),
            Some(queue) => queue.front().cloned().flatten(),
            None => None,
        };
        response.ok_or_else(|| Error::host_command(program, "No such file or directory"))
    }
}

/// Adapter recovery returning scripted outcomes; the last one repeats.
#[derive(Debug)]
pub struct MockRecovery {
    outcomes: Mutex<VecDeque<RecoveryOutcome>>,
    calls: AtomicU32,
}

impl MockRecovery {
    pub fn new(outcome: RecoveryOutcome) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::from([outcome])),
            calls: AtomicU32::new(0),
        }
    }

    /// Queue `outcome` ahead of the repeating last one.
    pub fn push(&self, outcome: RecoveryOutcome) {
        let mut outcomes = lock(&self.outcomes);
        let len = outcomes.len();
        outcomes.insert(len.saturating_sub(1), outcome);
    }

    /// Number of recovery attempts so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockRecovery {
    fn default() -> Self {
        Self::new(RecoveryOutcome::Recovered { index: 0 })
    }
}

#[async_trait]
impl AdapterRecovery for MockRecovery {
    async fn recover(&self) -> RecoveryOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = lock(&self.outcomes);
        if outcomes.len() > 1 {
            outcomes.pop_front().unwrap_or(RecoveryOutcome::Failed {
                reason: "no outcome scripted".into(),
            })
        } else {
            outcomes.front().cloned().unwrap_or(RecoveryOutcome::Failed {
                reason: "no outcome scripted".into(),
            })
        }
    }
}

/// A sink that records every payload it is asked to publish.
#[derive(Debug)]
pub struct RecordingSink {
    payloads: Mutex<Vec<TelemetryPayload>>,
    tx: mpsc::UnboundedSender<TelemetryPayload>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TelemetryPayload>>,
    failures: AtomicU32,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            payloads: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` publishes fail with a 503.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every payload received, including failed ones.
    pub fn payloads(&self) -> Vec<TelemetryPayload> {
        lock(&self.payloads).clone()
    }

    /// Most recent payload.
    pub fn last(&self) -> Option<TelemetryPayload> {
        lock(&self.payloads).last().copied()
    }

    /// Wait for the next publish.
    pub async fn next_payload(&self) -> Option<TelemetryPayload> {
        self.rx.lock().await.recv().await
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn publish(&self, payload: &TelemetryPayload) -> std::result::Result<(), PublishError> {
        lock(&self.payloads).push(*payload);
        let _ = self.tx.send(*payload);

        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(PublishError::Status {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> MacAddress {
        MacAddress::parse("AA:BB:CC:DD:EE:FF").unwrap()
    }

    #[tokio::test]
    async fn test_mock_central_scripts() {
        let central = MockCentral::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        central.listen(tx.clone()).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(PlatformEvent::RadioState(RadioState::PoweredOn))
        );

        central.push_connect(&addr(), MockConnect::Fail("busy".into()));
        assert!(central.connect(&addr(), tx.clone()).await.is_err());
        assert!(central.connect(&addr(), tx).await.is_ok());
        assert_eq!(central.connect_calls().len(), 2);
        assert_eq!(central.links(&addr()).len(), 1);

        assert!(central.advertise(&addr()));
        assert!(matches!(
            rx.recv().await,
            Some(PlatformEvent::Discovered { .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_central_scan_calls() {
        let central = MockCentral::new();
        central.start_scan().await.unwrap();
        assert!(central.is_scanning());
        central.stop_scan().await.unwrap();
        assert!(!central.is_scanning());
        assert_eq!(central.scan_calls(), vec![ScanCall::Start, ScanCall::Stop]);

        central.fail_scan_starts(1);
        assert!(central.start_scan().await.is_err());
        central.start_scan().await.unwrap();
        assert_eq!(central.scan_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_link_failures() {
        let mut link = MockLink::new()
            .without(Characteristic::HeartRate)
            .fail_subscribe(Characteristic::Csc);
        let record = link.record();

        let uuids = link.discover_services().await.unwrap();
        assert!(!uuids.contains(&Characteristic::HeartRate.uuid()));
        assert!(link.subscribe(Characteristic::Csc).await.is_err());
        link.subscribe(Characteristic::CyclingPower).await.unwrap();
        link.disconnect().await.unwrap();

        assert_eq!(record.subscribed(), vec![Characteristic::CyclingPower]);
        assert!(record.was_disconnected());
    }

    #[tokio::test]
    async fn test_mock_host_sequences() {
        let host = MockHost::new();
        host.respond_sequence(
            "systemctl is-active bluetooth",
            [CommandOutput::failed("inactive"), CommandOutput::ok("active")],
        );

        let first = host.run("systemctl", &["is-active", "bluetooth"]).await.unwrap();
        let second = host.run("systemctl", &["is-active", "bluetooth"]).await.unwrap();
        let third = host.run("systemctl", &["is-active", "bluetooth"]).await.unwrap();
        assert!(!first.success);
        assert_eq!(second.stdout, "active");
        assert_eq!(third.stdout, "active");

        assert!(host.run("hciconfig", &["-a"]).await.is_err());
        assert_eq!(host.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_mock_recovery_sequence() {
        let recovery = MockRecovery::new(RecoveryOutcome::Recovered { index: 0 });
        recovery.push(RecoveryOutcome::Failed {
            reason: "down".into(),
        });

        assert!(matches!(
            recovery.recover().await,
            RecoveryOutcome::Failed { .. }
        ));
        assert_eq!(
            recovery.recover().await,
            RecoveryOutcome::Recovered { index: 0 }
        );
        assert_eq!(
            recovery.recover().await,
            RecoveryOutcome::Recovered { index: 0 }
        );
        assert_eq!(recovery.calls(), 3);
    }

    #[tokio::test]
    async fn test_recording_sink_failures() {
        let sink = RecordingSink::new();
        sink.fail_next(1);

        assert!(sink.publish(&TelemetryPayload::default()).await.is_err());
        assert!(sink.publish(&TelemetryPayload::default()).await.is_ok());
        assert_eq!(sink.payloads().len(), 2);
        assert!(sink.next_payload().await.is_some());
    }
}
