//! [`Transport`] implementation over btleplug.
//!
//! Adapter events are forwarded from a background task as
//! [`TransportEvent`]s. Connecting runs on its own task and reports its
//! outcome as an event, so the connection manager never blocks on the radio.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use g7_types::Channel;

use crate::error::{ConnectionFailureReason, DisconnectReason, Error, Result};
use crate::transport::{
    Advertisement, PeripheralId, PeripheralInfo, PowerState, Transport, TransportEvent,
};
use crate::util::{Locked, format_peripheral_id};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

fn power_state(state: CentralState) -> PowerState {
    match state {
        CentralState::PoweredOn => PowerState::PoweredOn,
        CentralState::PoweredOff => PowerState::PoweredOff,
        _ => PowerState::Unknown,
    }
}

/// Peripherals this side asked to disconnect.
#[derive(Debug, Default)]
struct PendingCancels(Locked<HashSet<PeripheralId>>);

impl PendingCancels {
    fn insert(&self, id: &PeripheralId) {
        self.0.with(|ids| ids.insert(id.clone()));
    }

    fn remove(&self, id: &PeripheralId) -> bool {
        self.0.with(|ids| ids.remove(id))
    }

    /// Why `id` dropped, as far as the platform lets us tell.
    fn reason_for(&self, id: &PeripheralId) -> DisconnectReason {
        if self.remove(id) {
            DisconnectReason::UserRequested
        } else {
            DisconnectReason::PeripheralDisconnected
        }
    }
}

fn connect_failure(error: &btleplug::Error) -> ConnectionFailureReason {
    match error {
        btleplug::Error::TimedOut(_) => ConnectionFailureReason::Timeout,
        other => ConnectionFailureReason::BleError(other.to_string()),
    }
}

/// Bluetooth transport on the first system adapter.
///
/// btleplug reports a dropped link without a cause. Disconnects started by
/// [`Transport::cancel_connection`] are reported as
/// [`DisconnectReason::UserRequested`]; every other drop is reported as
/// [`DisconnectReason::PeripheralDisconnected`], since G7 sensors close the
/// link themselves after each exchange. A lost link is therefore never
/// reported to the connection delegate as an error on this transport. It is
/// still rescanned when stay-connected is set.
pub struct BtleplugTransport {
    adapter: Adapter,
    events: mpsc::Sender<TransportEvent>,
    peripherals: Locked<HashMap<PeripheralId, Peripheral>>,
    notifications: Locked<HashMap<PeripheralId, JoinHandle<()>>>,
    cancels: PendingCancels,
    forwarder: Locked<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("known_peripherals", &self.peripherals.with(|p| p.len()))
            .finish_non_exhaustive()
    }
}

impl BtleplugTransport {
    /// Open the first adapter and start forwarding its events.
    ///
    /// `capacity` bounds the event queue handed to the connection manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAdapter`] if the system has no Bluetooth adapter.
    pub async fn new(capacity: usize) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>)> {
        let adapter = get_adapter().await?;
        let central_events = adapter.events().await?;
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let transport = Arc::new(Self {
            adapter,
            events: tx,
            peripherals: Locked::new(HashMap::new()),
            notifications: Locked::new(HashMap::new()),
            cancels: PendingCancels::default(),
            forwarder: Locked::new(None),
        });

        let initial = transport.power_state().await;
        transport
            .send(TransportEvent::PowerStateChanged(initial))
            .await;

        let weak = Arc::downgrade(&transport);
        let handle = tokio::spawn(forward_central_events(weak, central_events));
        transport.forwarder.set(Some(handle));

        Ok((transport, rx))
    }

    async fn send(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Transport event receiver closed");
        }
    }

    fn remember(&self, peripheral: &Peripheral) -> PeripheralId {
        let id = PeripheralId::new(format_peripheral_id(&peripheral.id()));
        self.peripherals
            .with(|map| map.insert(id.clone(), peripheral.clone()));
        id
    }

    async fn info(&self, peripheral: &Peripheral) -> PeripheralInfo {
        let id = self.remember(peripheral);
        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        };
        PeripheralInfo { id, name }
    }

    async fn lookup(&self, id: &PeripheralId) -> Option<Peripheral> {
        if let Some(peripheral) = self.peripherals.with(|map| map.get(id).cloned()) {
            return Some(peripheral);
        }
        let peripherals = self.adapter.peripherals().await.ok()?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| format_peripheral_id(&p.id()) == id.as_str())?;
        self.remember(&peripheral);
        Some(peripheral)
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        self.lookup(id).await.ok_or_else(|| {
            Error::connection_failed(
                Some(id.to_string()),
                ConnectionFailureReason::PeripheralUnavailable,
            )
        })
    }

    async fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::StateUpdate(state) => {
                self.send(TransportEvent::PowerStateChanged(power_state(state)))
                    .await;
            }
            CentralEvent::DeviceDiscovered(bt_id) | CentralEvent::DeviceUpdated(bt_id) => {
                let Ok(peripheral) = self.adapter.peripheral(&bt_id).await else {
                    return;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    return;
                };
                let id = self.remember(&peripheral);
                let advertisement = Advertisement {
                    local_name: properties.local_name.clone(),
                    rssi: properties.rssi,
                    services: properties.services,
                    manufacturer_data: properties.manufacturer_data,
                };
                self.send(TransportEvent::Discovered {
                    peripheral: PeripheralInfo {
                        id,
                        name: properties.local_name,
                    },
                    advertisement,
                })
                .await;
            }
            CentralEvent::DeviceDisconnected(bt_id) => {
                let id = PeripheralId::new(format_peripheral_id(&bt_id));
                self.stop_notifications(&id);
                let reason = self.cancels.reason_for(&id);
                self.send(TransportEvent::Disconnected { id, reason }).await;
            }
            _ => {}
        }
    }

    fn stop_notifications(&self, id: &PeripheralId) {
        if let Some(handle) = self.notifications.with(|map| map.remove(id)) {
            handle.abort();
        }
    }

    fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| {
                Error::characteristic_not_found(uuid.to_string(), peripheral.services().len())
            })
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.replace(None) {
            handle.abort();
        }
        self.notifications.with(|map| {
            for (_, handle) in map.drain() {
                handle.abort();
            }
        });
    }
}

async fn forward_central_events(
    transport: Weak<BtleplugTransport>,
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
) {
    while let Some(event) = events.next().await {
        let Some(transport) = transport.upgrade() else {
            break;
        };
        transport.handle_central_event(event).await;
    }
    debug!("Adapter event stream ended");
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn power_state(&self) -> PowerState {
        match self.adapter.adapter_state().await {
            Ok(state) => power_state(state),
            Err(e) => {
                debug!("Failed to read adapter state: {}", e);
                PowerState::Unknown
            }
        }
    }

    async fn retrieve_peripheral(&self, id: &PeripheralId) -> Option<PeripheralInfo> {
        let peripheral = self.lookup(id).await?;
        Some(self.info(&peripheral).await)
    }

    async fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralInfo> {
        let Ok(peripherals) = self.adapter.peripherals().await else {
            return Vec::new();
        };
        let mut connected = Vec::new();
        for peripheral in peripherals {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let advertises = match peripheral.properties().await {
                Ok(Some(properties)) => properties.services.iter().any(|s| services.contains(s)),
                _ => false,
            };
            let exposes = peripheral
                .services()
                .iter()
                .any(|s| services.contains(&s.uuid));
            if advertises || exposes {
                connected.push(self.info(&peripheral).await);
            }
        }
        connected
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let events = self.events.clone();
        let id = id.clone();

        tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => TransportEvent::Connected(id),
                Err(e) => TransportEvent::ConnectFailed {
                    id,
                    reason: connect_failure(&e),
                },
            };
            let _ = events.send(event).await;
        });
        Ok(())
    }

    async fn configure(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;

        for channel in [Channel::Control, Channel::Backfill, Channel::Authentication] {
            let characteristic = Self::find_characteristic(&peripheral, channel.uuid())?;
            peripheral.subscribe(&characteristic).await?;
            debug!("Subscribed to {}", channel);
        }

        let mut stream = peripheral.notifications().await?;
        let events = self.events.clone();
        let source = id.clone();
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let Some(channel) = Channel::from_uuid(notification.uuid) else {
                    trace!("Notification from unknown characteristic {}", notification.uuid);
                    continue;
                };
                let event = TransportEvent::Value {
                    id: source.clone(),
                    channel,
                    data: notification.value,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.notifications.with(|map| map.insert(id.clone(), handle)) {
            previous.abort();
        }
        info!("Configured {}", id);
        Ok(())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<()> {
        self.stop_notifications(id);
        let Some(peripheral) = self.lookup(id).await else {
            return Ok(());
        };
        // Completion arrives from the adapter as a DeviceDisconnected event.
        self.cancels.insert(id);
        if let Err(e) = peripheral.disconnect().await {
            self.cancels.remove(id);
            warn!("Failed to disconnect {}: {}", id, e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn write(&self, id: &PeripheralId, channel: Channel, data: &[u8]) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let characteristic = Self::find_characteristic(&peripheral, channel.uuid())?;
        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }
}
