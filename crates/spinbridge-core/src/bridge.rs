//! The bridge orchestrator.
//!
//! A single task owns every device session and the telemetry snapshot. It
//! reacts to [`PlatformEvent`]s from the radio, to completions reported by
//! connection attempts and timers, and to the publish and status ticks.
//! Connection attempts, timers, recovery and HTTP posts run as separate
//! tasks that only report back through a channel, so no state is shared and
//! no lock is taken.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use spinbridge_types::{Characteristic, Measurement, Metric};

use crate::adapter::{AdapterRecovery, RecoveryOutcome};
use crate::error::{Error, Result};
use crate::events::{BridgeEvent, EventDispatcher, EventReceiver};
use crate::known::{KnownDevice, MacAddress, default_devices};
use crate::session::{DeviceSession, Generation, SessionState};
use crate::sink::TelemetrySink;
use crate::snapshot::TelemetrySnapshot;
use crate::traits::{
    BleCentral, GattLink, PlatformEvent, PlatformEventReceiver, PlatformEventSender, RadioState,
};

/// Bound on disconnecting a link during shutdown or after a failed attempt.
const LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime settings for the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Sensors to keep connected.
    pub devices: Vec<KnownDevice>,
    /// How often the snapshot is posted to the sink.
    pub publish_interval: Duration,
    /// How often the status line is logged.
    pub status_interval: Duration,
    /// Wait between a disconnect and the next connection attempt.
    pub reconnect_delay: Duration,
    /// Wait between radio power loss and each recovery attempt.
    pub recovery_delay: Duration,
    /// Bound on a single connect call.
    pub connect_timeout: Duration,
    /// Bound on service discovery and each subscribe call.
    pub discovery_timeout: Duration,
    /// Add seconds-since-start to every payload.
    pub include_elapsed: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            publish_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            recovery_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(10),
            include_elapsed: false,
        }
    }
}

impl BridgeConfig {
    /// Check the device table and timings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty device table, a device
    /// without characteristics, a repeated address, a metric fed by two
    /// devices, or a zero interval.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::invalid_config("no devices configured"));
        }

        let mut addresses = HashSet::new();
        let mut owners: HashMap<Metric, &str> = HashMap::new();
        for device in &self.devices {
            if device.characteristics.is_empty() {
                return Err(Error::invalid_config(format!(
                    "device '{}' has no characteristics",
                    device.name
                )));
            }
            if !addresses.insert(&device.address) {
                return Err(Error::invalid_config(format!(
                    "address {} is listed twice",
                    device.address
                )));
            }
            for metric in device.metrics() {
                if let Some(other) = owners.insert(metric, &device.name) {
                    if other != device.name {
                        return Err(Error::invalid_config(format!(
                            "metric '{}' is fed by both '{}' and '{}'",
                            metric, other, device.name
                        )));
                    }
                }
            }
        }

        for (name, value) in [
            ("publish_interval", self.publish_interval),
            ("status_interval", self.status_interval),
            ("reconnect_delay", self.reconnect_delay),
            ("recovery_delay", self.recovery_delay),
            ("connect_timeout", self.connect_timeout),
            ("discovery_timeout", self.discovery_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

/// Where a connection attempt gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptStage {
    Connect,
    Discovery,
    Subscribe,
}

impl std::fmt::Display for AttemptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Discovery => write!(f, "service discovery"),
            Self::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// Completions reported back to the orchestrator task.
enum Internal {
    Connected {
        index: usize,
        generation: Generation,
    },
    Established {
        index: usize,
        generation: Generation,
        link: Box<dyn GattLink>,
        subscribed: Vec<Characteristic>,
        skipped: Vec<(Characteristic, String)>,
    },
    AttemptFailed {
        index: usize,
        generation: Generation,
        stage: AttemptStage,
        error: Error,
    },
    ReconnectDue {
        index: usize,
        generation: Generation,
    },
    RecoveryDone(RecoveryOutcome),
    ScanRetry,
}

/// Connects to the known sensors, keeps the snapshot current and publishes it.
pub struct Bridge {
    state: BridgeState,
    platform_rx: PlatformEventReceiver,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

struct BridgeState {
    config: BridgeConfig,
    central: Arc<dyn BleCentral>,
    sink: Arc<dyn TelemetrySink>,
    recovery: Arc<dyn AdapterRecovery>,
    events: EventDispatcher,
    sessions: Vec<DeviceSession>,
    by_address: HashMap<MacAddress, usize>,
    snapshot: TelemetrySnapshot,
    radio: RadioState,
    scanning: bool,
    recovery_pending: bool,
    scan_retry_pending: bool,
    /// Session index and generation of the outstanding connect call.
    attempt: Option<(usize, Generation)>,
    attempt_tasks: Vec<JoinHandle<()>>,
    started: Instant,
    platform_tx: PlatformEventSender,
    internal_tx: mpsc::UnboundedSender<Internal>,
    tasks: CancellationToken,
}

impl Bridge {
    /// Create a bridge over the given platform, sink and recovery strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(
        config: BridgeConfig,
        central: Arc<dyn BleCentral>,
        sink: Arc<dyn TelemetrySink>,
        recovery: Arc<dyn AdapterRecovery>,
    ) -> Result<Self> {
        config.validate()?;

        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let sessions: Vec<DeviceSession> = config
            .devices
            .iter()
            .cloned()
            .map(DeviceSession::new)
            .collect();
        let by_address = config
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| (d.address.clone(), i))
            .collect();
        let snapshot = TelemetrySnapshot::new(sessions.len());

        Ok(Self {
            state: BridgeState {
                config,
                central,
                sink,
                recovery,
                events: EventDispatcher::default(),
                sessions,
                by_address,
                snapshot,
                radio: RadioState::Unknown,
                scanning: false,
                recovery_pending: false,
                scan_retry_pending: false,
                attempt: None,
                attempt_tasks: Vec::new(),
                started: Instant::now(),
                platform_tx,
                internal_tx,
                tasks: CancellationToken::new(),
            },
            platform_rx,
            internal_rx,
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe_events(&self) -> EventReceiver {
        self.state.events.subscribe()
    }

    /// Run until `shutdown` is cancelled, then stop scanning and disconnect
    /// every session.
    ///
    /// # Errors
    ///
    /// Fails only if the platform cannot start delivering events.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Bridge {
            mut state,
            mut platform_rx,
            mut internal_rx,
        } = self;

        state.started = Instant::now();
        state.central.listen(state.platform_tx.clone()).await?;

        let mut publish = interval_at(
            Instant::now() + state.config.publish_interval,
            state.config.publish_interval,
        );
        publish.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = interval_at(
            Instant::now() + state.config.status_interval,
            state.config.status_interval,
        );
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = platform_rx.recv() => state.handle_platform(event).await,
                Some(message) = internal_rx.recv() => state.handle_internal(message).await,
                _ = publish.tick() => state.publish(),
                _ = status.tick() => state.log_status(),
            }
        }

        state.shutdown(&mut internal_rx).await;
        Ok(())
    }
}

impl BridgeState {
    fn device(&self, index: usize) -> &KnownDevice {
        self.sessions[index].device()
    }

    fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn emit_session(&self, index: usize) {
        let session = &self.sessions[index];
        self.events.send(BridgeEvent::SessionState {
            device: session.device().name.clone(),
            address: session.device().address.clone(),
            state: session.state(),
        });
    }

    async fn handle_platform(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::RadioState(state) => self.on_radio_state(state).await,
            PlatformEvent::Discovered {
                address,
                name,
                rssi,
            } => self.on_discovered(address, name, rssi).await,
            PlatformEvent::Disconnected { address } => self.on_disconnected(&address).await,
            PlatformEvent::Notification {
                address,
                characteristic,
                value,
            } => self.on_notification(&address, &characteristic, &value),
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Connected { index, generation } => {
                self.settle_attempt(index, generation);
                if self.sessions[index].connected(generation) {
                    debug!("Connected to {}, discovering services", self.device(index).name);
                    self.emit_session(index);
                }
                self.refresh_scan().await;
            }
            Internal::Established {
                index,
                generation,
                link,
                subscribed,
                skipped,
            } => {
                self.settle_attempt(index, generation);
                for (characteristic, error) in &skipped {
                    warn!(
                        "{}: skipping {}: {}",
                        self.device(index).name,
                        characteristic,
                        error
                    );
                    self.events.send(BridgeEvent::SubscriptionSkipped {
                        device: self.device(index).name.clone(),
                        characteristic: *characteristic,
                        error: error.clone(),
                    });
                }

                let names: Vec<String> = subscribed.iter().map(|c| c.to_string()).collect();
                match self.sessions[index].establish(generation, link, subscribed) {
                    Ok(()) => {
                        info!(
                            "{} connected, subscribed to {}",
                            self.device(index).name,
                            names.join(", ")
                        );
                        self.snapshot.mark_connected(index);
                        self.emit_session(index);
                        self.refresh_scan().await;
                    }
                    Err(link) => {
                        debug!(
                            "Discarding stale connection to {}",
                            self.device(index).name
                        );
                        self.close_link(link);
                        self.refresh_scan().await;
                    }
                }
            }
            Internal::AttemptFailed {
                index,
                generation,
                stage,
                error,
            } => {
                self.settle_attempt(index, generation);
                if self.sessions[index].attempt_failed(generation) {
                    warn!(
                        "{}: {} failed: {}",
                        self.device(index).name,
                        stage,
                        error
                    );
                    self.enter_disconnected(index, None).await;
                } else {
                    trace!("Ignoring stale {} failure: {}", stage, error);
                    self.refresh_scan().await;
                }
            }
            Internal::ReconnectDue { index, generation } => {
                if self.sessions[index].reconnect_due(generation) {
                    debug!("{} eligible for reconnect", self.device(index).name);
                    self.emit_session(index);
                    self.refresh_scan().await;
                }
            }
            Internal::RecoveryDone(outcome) => {
                self.recovery_pending = false;
                self.events.send(BridgeEvent::Recovery {
                    outcome: outcome.clone(),
                });
                if let RecoveryOutcome::RestartRequired { bound, resolved } = outcome {
                    warn!(
                        "Adapter moved from hci{} to hci{}; restart spinbridge to use it",
                        bound, resolved
                    );
                }
                if self.radio != RadioState::PoweredOn {
                    self.schedule_recovery();
                }
            }
            Internal::ScanRetry => {
                self.scan_retry_pending = false;
                self.refresh_scan().await;
            }
        }
    }

    async fn on_radio_state(&mut self, state: RadioState) {
        let previous = self.radio;
        self.radio = state;
        if previous != state {
            self.events.send(BridgeEvent::RadioState { state });
        }

        match state {
            RadioState::PoweredOn => {
                info!("Bluetooth powered on");
                self.refresh_scan().await;
            }
            RadioState::PoweredOff => {
                warn!("Bluetooth powered off");
                self.refresh_scan().await;
                for index in 0..self.sessions.len() {
                    if let Some(link) = self.sessions[index].disconnect() {
                        self.enter_disconnected(index, link).await;
                    }
                }
                self.snapshot.zero_all();
                self.schedule_recovery();
            }
            RadioState::Unknown => {
                debug!("Bluetooth state unknown, pausing scan");
                self.refresh_scan().await;
            }
        }
    }

    async fn on_discovered(&mut self, address: MacAddress, name: Option<String>, rssi: Option<i16>) {
        let Some(&index) = self.by_address.get(&address) else {
            return;
        };
        if self.radio != RadioState::PoweredOn {
            return;
        }
        if self.sessions[index].state() != SessionState::Idle {
            trace!(
                "Ignoring advertisement from {} in state {}",
                self.device(index).name,
                self.sessions[index].state()
            );
            return;
        }
        if self.connect_in_flight() {
            trace!(
                "Deferring {}: another connection attempt is in flight",
                self.device(index).name
            );
            return;
        }

        let Some(generation) = self.sessions[index].begin_connect() else {
            return;
        };
        info!(
            "Found {} ({}){}, connecting",
            self.device(index).name,
            name.as_deref().unwrap_or("unnamed"),
            rssi.map(|r| format!(" at {} dBm", r)).unwrap_or_default()
        );
        self.attempt = Some((index, generation));
        self.emit_session(index);
        self.refresh_scan().await;

        let attempt = Attempt {
            central: self.central.clone(),
            device: self.device(index).clone(),
            index,
            generation,
            connect_timeout: self.config.connect_timeout,
            discovery_timeout: self.config.discovery_timeout,
            platform_tx: self.platform_tx.clone(),
            internal_tx: self.internal_tx.clone(),
            cancel: self.tasks.clone(),
        };
        self.attempt_tasks.retain(|task| !task.is_finished());
        self.attempt_tasks.push(tokio::spawn(attempt.run()));
    }

    async fn on_disconnected(&mut self, address: &MacAddress) {
        let Some(&index) = self.by_address.get(address) else {
            return;
        };
        if let Some(link) = self.sessions[index].disconnect() {
            info!("{} disconnected", self.device(index).name);
            self.enter_disconnected(index, link).await;
        }
    }

    fn on_notification(&mut self, address: &MacAddress, uuid: &uuid::Uuid, value: &[u8]) {
        let Some(&index) = self.by_address.get(address) else {
            return;
        };
        let Some(characteristic) = Characteristic::from_uuid(uuid) else {
            trace!("Ignoring notification from unknown characteristic {}", uuid);
            return;
        };
        let session = &mut self.sessions[index];
        if !session.is_subscribed() || !session.subscribed().contains(&characteristic) {
            trace!(
                "Dropping {} notification from {} while {}",
                characteristic,
                session.device().name,
                session.state()
            );
            return;
        }

        let measurement = match characteristic.decode(value) {
            Ok(measurement) => measurement,
            Err(e) => {
                let e = Error::from(e);
                warn!(
                    "{}: dropping malformed {} notification: {}",
                    session.device().name,
                    characteristic,
                    e
                );
                self.events.send(BridgeEvent::DecodeFailed {
                    device: session.device().name.clone(),
                    characteristic,
                    error: e.to_string(),
                });
                return;
            }
        };

        let update = match measurement {
            Measurement::HeartRate(bpm) => Some((Metric::HeartRate, bpm)),
            Measurement::Power(watts) => Some((Metric::Power, watts)),
            Measurement::Csc(csc) => csc
                .crank
                .and_then(|crank| session.observe_crank(crank))
                .map(|rpm| (Metric::Cadence, rpm)),
        };

        if let Some((metric, value)) = update {
            trace!("{}: {} = {}", session.device().name, metric, value);
            let device = session.device().name.clone();
            self.snapshot.set(metric, value);
            self.events.send(BridgeEvent::Measurement {
                device,
                metric,
                value,
            });
        }
    }

    /// Bookkeeping for a session that just entered `Disconnected`: zero its
    /// metrics, close the old link and arm the reconnect timer.
    async fn enter_disconnected(&mut self, index: usize, link: Option<Box<dyn GattLink>>) {
        let device = self.sessions[index].device().clone();
        self.snapshot.zero_device(index, &device);
        self.emit_session(index);
        if let Some(link) = link {
            self.close_link(link);
        }

        let generation = self.sessions[index].generation();
        let delay = self.config.reconnect_delay;
        let tx = self.internal_tx.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tasks.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Internal::ReconnectDue { index, generation });
                }
            }
        });

        self.refresh_scan().await;
    }

    fn close_link(&self, mut link: Box<dyn GattLink>) {
        tokio::spawn(async move {
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect of dropped link failed: {}", e);
            }
        });
    }

    /// The connect call stays outstanding until its attempt reports back,
    /// even if the session was disconnected in the meantime.
    fn connect_in_flight(&self) -> bool {
        self.attempt.is_some()
    }

    fn settle_attempt(&mut self, index: usize, generation: Generation) {
        if self.attempt == Some((index, generation)) {
            self.attempt = None;
        }
    }

    /// Start or stop scanning so that it runs exactly when the radio is on,
    /// no connect is in flight, and some device still needs a connection.
    async fn refresh_scan(&mut self) {
        let wanted = self.radio == RadioState::PoweredOn
            && !self.tasks.is_cancelled()
            && !self.connect_in_flight()
            && self.sessions.iter().any(|s| !s.is_subscribed());
        if wanted == self.scanning {
            return;
        }

        if wanted {
            match self.central.start_scan().await {
                Ok(()) => {
                    debug!("Scanning started");
                    self.scanning = true;
                }
                Err(e) => {
                    warn!("Failed to start scan: {}", e);
                    self.schedule_scan_retry();
                    return;
                }
            }
        } else {
            if let Err(e) = self.central.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            } else {
                debug!("Scanning stopped");
            }
            self.scanning = false;
        }
        self.events.send(BridgeEvent::Scanning {
            active: self.scanning,
        });
    }

    fn schedule_scan_retry(&mut self) {
        if self.scan_retry_pending {
            return;
        }
        self.scan_retry_pending = true;

        let delay = self.config.recovery_delay;
        let tx = self.internal_tx.clone();
        let tasks = self.tasks.clone();
        debug!("Retrying scan in {:?}", delay);
        tokio::spawn(async move {
            tokio::select! {
                _ = tasks.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Internal::ScanRetry);
                }
            }
        });
    }

    fn schedule_recovery(&mut self) {
        if self.recovery_pending {
            return;
        }
        self.recovery_pending = true;

        let delay = self.config.recovery_delay;
        let recovery = self.recovery.clone();
        let tx = self.internal_tx.clone();
        let tasks = self.tasks.clone();
        info!("Adapter recovery in {:?}", delay);
        tokio::spawn(async move {
            tokio::select! {
                _ = tasks.cancelled() => {}
                outcome = async {
                    tokio::time::sleep(delay).await;
                    recovery.recover().await
                } => {
                    let _ = tx.send(Internal::RecoveryDone(outcome));
                }
            }
        });
    }

    fn publish(&self) {
        let elapsed = self
            .config
            .include_elapsed
            .then(|| self.elapsed_secs());
        let payload = self.snapshot.to_payload(elapsed);
        let sink = self.sink.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.publish(&payload).await {
                warn!("Failed to publish metrics: {}", e);
                events.send(BridgeEvent::PublishFailed {
                    error: e.to_string(),
                });
            }
        });
    }

    fn log_status(&self) {
        let devices: Vec<String> = self
            .sessions
            .iter()
            .enumerate()
            .map(|(i, s)| {
                format!(
                    "{}: {}",
                    s.device().name,
                    if self.snapshot.is_connected(i) {
                        "connected"
                    } else {
                        "disconnected"
                    }
                )
            })
            .collect();
        info!(
            "[{}s] {} | {}",
            self.elapsed_secs(),
            self.snapshot.to_payload(None),
            devices.join(" | ")
        );
    }

    async fn shutdown(&mut self, internal_rx: &mut mpsc::UnboundedReceiver<Internal>) {
        info!("Shutting down");
        self.tasks.cancel();
        for task in self.attempt_tasks.drain(..) {
            if timeout(LINK_CLOSE_TIMEOUT, task).await.is_err() {
                warn!("Timed out waiting for a connection attempt to stop");
            }
        }
        // Links handed over after the loop stopped are not owned by any session.
        while let Ok(message) = internal_rx.try_recv() {
            if let Internal::Established { mut link, .. } = message {
                match timeout(LINK_CLOSE_TIMEOUT, link.disconnect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Disconnect of unclaimed link failed: {}", e),
                    Err(_) => debug!("Timed out disconnecting unclaimed link"),
                }
            }
        }
        if self.scanning {
            if let Err(e) = self.central.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
            self.scanning = false;
        }

        for session in &mut self.sessions {
            if let Some(mut link) = session.take_link() {
                match timeout(LINK_CLOSE_TIMEOUT, link.disconnect()).await {
                    Ok(Ok(())) => debug!("Disconnected {}", session.device().name),
                    Ok(Err(e)) => warn!("Failed to disconnect {}: {}", session.device().name, e),
                    Err(_) => warn!("Timed out disconnecting {}", session.device().name),
                }
            }
        }
        self.snapshot.zero_all();
    }
}

/// One connect → discover → subscribe sequence, run off the orchestrator task.
///
/// Once connected the attempt owns the link until it hands it over in
/// [`Internal::Established`], so it disconnects the link itself on failure
/// and on shutdown.
struct Attempt {
    central: Arc<dyn BleCentral>,
    device: KnownDevice,
    index: usize,
    generation: Generation,
    connect_timeout: Duration,
    discovery_timeout: Duration,
    platform_tx: PlatformEventSender,
    internal_tx: mpsc::UnboundedSender<Internal>,
    cancel: CancellationToken,
}

impl Attempt {
    fn fail(&self, stage: AttemptStage, error: Error) {
        let _ = self.internal_tx.send(Internal::AttemptFailed {
            index: self.index,
            generation: self.generation,
            stage,
            error,
        });
    }

    async fn close(&self, link: &mut dyn GattLink) {
        match timeout(LINK_CLOSE_TIMEOUT, link.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Disconnect of abandoned link failed: {}", e),
            Err(_) => debug!("Timed out disconnecting abandoned link"),
        }
    }

    #[instrument(skip(self), fields(device = %self.device.name, address = %self.device.address))]
    async fn run(self) {
        let connect = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = timeout(
                self.connect_timeout,
                self.central
                    .connect(&self.device.address, self.platform_tx.clone()),
            ) => result.unwrap_or_else(|_| Err(Error::timeout("connect", self.connect_timeout))),
        };

        let mut link = match connect {
            Ok(link) => link,
            Err(e) => return self.fail(AttemptStage::Connect, e),
        };
        let _ = self.internal_tx.send(Internal::Connected {
            index: self.index,
            generation: self.generation,
        });

        let discovery = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = timeout(self.discovery_timeout, link.discover_services()) => Some(
                result.unwrap_or_else(|_| {
                    Err(Error::timeout("discover services", self.discovery_timeout))
                }),
            ),
        };
        let available = match discovery {
            Some(Ok(available)) => available,
            Some(Err(e)) => {
                self.close(link.as_mut()).await;
                return self.fail(AttemptStage::Discovery, e);
            }
            None => {
                debug!("Shutdown during service discovery");
                return self.close(link.as_mut()).await;
            }
        };

        let mut subscribed = Vec::new();
        let mut skipped = Vec::new();
        for &characteristic in &self.device.characteristics {
            if !available.contains(&characteristic.uuid()) {
                let e = Error::characteristic_not_found(characteristic.uuid().to_string());
                skipped.push((characteristic, e.to_string()));
                continue;
            }
            let result = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = timeout(self.discovery_timeout, link.subscribe(characteristic)) => Some(
                    result.unwrap_or_else(|_| Err(Error::timeout("subscribe", self.discovery_timeout))),
                ),
            };
            match result {
                Some(Ok(())) => subscribed.push(characteristic),
                Some(Err(e)) => skipped.push((characteristic, e.to_string())),
                None => {
                    debug!("Shutdown while subscribing");
                    return self.close(link.as_mut()).await;
                }
            }
        }

        if subscribed.is_empty() {
            self.close(link.as_mut()).await;
            let reasons: Vec<String> = skipped
                .iter()
                .map(|(c, e)| format!("{}: {}", c, e))
                .collect();
            return self.fail(
                AttemptStage::Subscribe,
                Error::connection_failed(
                    self.device.address.as_str(),
                    format!("no characteristic could be subscribed ({})", reasons.join("; ")),
                ),
            );
        }

        if self.cancel.is_cancelled() {
            return self.close(link.as_mut()).await;
        }
        let _ = self.internal_tx.send(Internal::Established {
            index: self.index,
            generation: self.generation,
            link,
            subscribed,
            skipped,
        });
    }
}
