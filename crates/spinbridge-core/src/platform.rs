//! btleplug binding for [`BleCentral`] and [`GattLink`].
//!
//! The adapter is bound by index once at startup. BlueZ reports adapters as
//! `hciN (...)` through `adapter_info`, which is how the index chosen by the
//! [`AdapterHealthManager`](crate::adapter::AdapterHealthManager) is mapped
//! onto a btleplug [`Adapter`].

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use spinbridge_types::Characteristic;

use crate::error::{AdapterUnavailableReason, Error, Result};
use crate::known::MacAddress;
use crate::traits::{BleCentral, GattLink, PlatformEvent, PlatformEventSender, RadioState};

/// A btleplug adapter acting as the bridge's central.
pub struct BtleplugCentral {
    adapter: Adapter,
    index: u32,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BtleplugCentral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugCentral")
            .field("index", &self.index)
            .finish()
    }
}

impl BtleplugCentral {
    /// Bind to adapter `hci<index>`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] if btleplug has no adapter with
    /// that index.
    pub async fn bind(index: u32) -> Result<Self> {
        let manager = Manager::new().await?;
        let wanted = format!("hci{}", index);

        for adapter in manager.adapters().await? {
            let info = adapter.adapter_info().await?;
            trace!("btleplug adapter: {}", info);
            let name = info
                .split(|c: char| !c.is_ascii_alphanumeric())
                .next()
                .unwrap_or_default();
            if name == wanted {
                debug!("Bound to {}", info);
                return Ok(Self {
                    adapter,
                    index,
                    pump: Mutex::new(None),
                });
            }
        }

        Err(Error::AdapterUnavailable(
            AdapterUnavailableReason::NotBound { index },
        ))
    }

    /// The radio index this central is bound to.
    pub fn index(&self) -> u32 {
        self.index
    }

    async fn find_peripheral(&self, address: &MacAddress) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral_address(&peripheral).as_ref() == Some(address) {
                return Ok(peripheral);
            }
        }
        Err(Error::connection_failed(
            address.as_str(),
            "peripheral not known to the adapter",
        ))
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.try_lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

fn peripheral_address(peripheral: &Peripheral) -> Option<MacAddress> {
    MacAddress::parse(&peripheral.address().to_string()).ok()
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

async fn translate(adapter: &Adapter, event: CentralEvent) -> Option<PlatformEvent> {
    async fn lookup(adapter: &Adapter, id: &PeripheralId) -> Option<Peripheral> {
        adapter.peripheral(id).await.ok()
    }

    match event {
        CentralEvent::StateUpdate(state) => Some(PlatformEvent::RadioState(radio_state(state))),
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
            let peripheral = lookup(adapter, &id).await?;
            let address = peripheral_address(&peripheral)?;
            let properties = peripheral.properties().await.ok().flatten();
            Some(PlatformEvent::Discovered {
                address,
                name: properties.as_ref().and_then(|p| p.local_name.clone()),
                rssi: properties.and_then(|p| p.rssi),
            })
        }
        CentralEvent::DeviceDisconnected(id) => {
            let peripheral = lookup(adapter, &id).await?;
            let address = peripheral_address(&peripheral)?;
            Some(PlatformEvent::Disconnected { address })
        }
        _ => None,
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn listen(&self, events: PlatformEventSender) -> Result<()> {
        let mut stream = self.adapter.events().await?;

        let initial = match self.adapter.adapter_state().await {
            Ok(state) => radio_state(state),
            Err(e) => {
                // The radio was verified up before binding.
                debug!("adapter_state() failed, assuming powered on: {}", e);
                RadioState::PoweredOn
            }
        };
        let _ = events.send(PlatformEvent::RadioState(initial));

        let adapter = self.adapter.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let Some(event) = translate(&adapter, event).await {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
            debug!("Adapter event stream ended");
        });

        if let Some(previous) = self.pump.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(
        &self,
        address: &MacAddress,
        events: PlatformEventSender,
    ) -> Result<Box<dyn GattLink>> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral.connect().await?;
        Ok(Box::new(BtleLink {
            peripheral,
            address: address.clone(),
            events,
            forwarder: None,
        }))
    }
}

/// A connected btleplug peripheral.
///
/// Notifications from every subscribed characteristic share one forwarder
/// task, aborted on disconnect or drop.
pub struct BtleLink {
    peripheral: Peripheral,
    address: MacAddress,
    events: PlatformEventSender,
    forwarder: Option<JoinHandle<()>>,
}

impl BtleLink {
    async fn ensure_forwarder(&mut self) -> Result<()> {
        if self.forwarder.is_some() {
            return Ok(());
        }

        let mut stream = self.peripheral.notifications().await?;
        let address = self.address.clone();
        let events = self.events.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let event = PlatformEvent::Notification {
                    address: address.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            trace!("Notification stream for {} ended", address);
        }));
        Ok(())
    }
}

#[async_trait]
impl GattLink for BtleLink {
    async fn discover_services(&mut self) -> Result<Vec<Uuid>> {
        self.peripheral.discover_services().await?;
        let uuids: Vec<Uuid> = self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| c.uuid)
            .collect();
        debug!("{}: found {} characteristics", self.address, uuids.len());
        Ok(uuids)
    }

    async fn subscribe(&mut self, characteristic: Characteristic) -> Result<()> {
        let uuid = characteristic.uuid();
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::characteristic_not_found(uuid.to_string()))?;

        self.ensure_forwarder().await?;
        self.peripheral.subscribe(&target).await?;
        debug!("{}: subscribed to {}", self.address, characteristic);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
        match self.peripheral.is_connected().await {
            Ok(true) => self.peripheral.disconnect().await?,
            Ok(false) => {}
            Err(e) => warn!("{}: could not query connection state: {}", self.address, e),
        }
        Ok(())
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}
