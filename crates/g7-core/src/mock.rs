//! Mock transport for testing.
//!
//! [`MockTransport`] records every call the connection manager makes and lets
//! tests inject [`TransportEvent`]s as if they came from the radio. With
//! auto-respond enabled, `connect` and `cancel_connection` answer with the
//! matching completion event, which is what a healthy radio stack does.
//!
//! # Features
//!
//! - **Call recording**: inspect the exact sequence of transport calls
//! - **Failure injection**: make `configure` or `write` fail
//! - **Peripheral registry**: known and already-connected peripherals

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use g7_types::Channel;

use crate::error::{DisconnectReason, Error, Result};
use crate::transport::{
    Advertisement, PeripheralId, PeripheralInfo, PowerState, Transport, TransportEvent,
};
use crate::util::Locked;

/// A transport call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(PeripheralId),
    Configure(PeripheralId),
    CancelConnection(PeripheralId),
    Write {
        id: PeripheralId,
        channel: Channel,
        data: Vec<u8>,
    },
}

/// In-memory [`Transport`] driven by the test.
#[derive(Debug)]
pub struct MockTransport {
    events: mpsc::Sender<TransportEvent>,
    power: Locked<PowerState>,
    known: Locked<Vec<PeripheralInfo>>,
    connected: Locked<Vec<PeripheralInfo>>,
    calls: Locked<Vec<TransportCall>>,
    auto_respond: AtomicBool,
    fail_configure: AtomicBool,
    fail_write: AtomicBool,
}

impl MockTransport {
    /// Create a mock and the event stream to hand to the manager.
    ///
    /// The radio starts powered off with auto-respond enabled.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let transport = Self {
            events: tx,
            power: Locked::new(PowerState::PoweredOff),
            known: Locked::new(Vec::new()),
            connected: Locked::new(Vec::new()),
            calls: Locked::new(Vec::new()),
            auto_respond: AtomicBool::new(true),
            fail_configure: AtomicBool::new(false),
            fail_write: AtomicBool::new(false),
        };
        (Arc::new(transport), rx)
    }

    /// Set the power state reported by `power_state` without emitting an event.
    pub fn set_power_state(&self, state: PowerState) {
        self.power.set(state);
    }

    /// Power the radio on and emit the change.
    pub async fn power_on(&self) {
        self.set_power_state(PowerState::PoweredOn);
        self.emit(TransportEvent::PowerStateChanged(PowerState::PoweredOn))
            .await;
    }

    /// Power the radio off and emit the change.
    pub async fn power_off(&self) {
        self.set_power_state(PowerState::PoweredOff);
        self.emit(TransportEvent::PowerStateChanged(PowerState::PoweredOff))
            .await;
    }

    /// Make a peripheral retrievable by identifier.
    pub fn add_known_peripheral(&self, peripheral: PeripheralInfo) {
        self.known.with(|known| known.push(peripheral));
    }

    /// Report a peripheral as already connected at the platform level.
    pub fn add_connected_peripheral(&self, peripheral: PeripheralInfo) {
        self.connected.with(|connected| connected.push(peripheral));
    }

    /// Answer `connect` and `cancel_connection` with completion events.
    pub fn set_auto_respond(&self, enabled: bool) {
        self.auto_respond.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_configure(&self, fail: bool) {
        self.fail_configure.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_write(&self, fail: bool) {
        self.fail_write.store(fail, Ordering::SeqCst);
    }

    /// Inject an event as if it came from the radio.
    pub async fn emit(&self, event: TransportEvent) {
        // A closed receiver means the manager is gone; nothing to deliver to.
        let _ = self.events.send(event).await;
    }

    /// Inject an advertisement from `peripheral`.
    pub async fn discover(&self, peripheral: PeripheralInfo) {
        let advertisement = Advertisement {
            local_name: peripheral.name.clone(),
            ..Default::default()
        };
        self.emit(TransportEvent::Discovered {
            peripheral,
            advertisement,
        })
        .await;
    }

    /// Inject a characteristic payload.
    pub async fn notify(&self, id: &PeripheralId, channel: Channel, data: &[u8]) {
        self.emit(TransportEvent::Value {
            id: id.clone(),
            channel,
            data: data.to_vec(),
        })
        .await;
    }

    /// Every call so far, oldest first.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.get()
    }

    pub fn clear_calls(&self) {
        self.calls.with(Vec::clear);
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.with(|calls| calls.iter().filter(|c| predicate(c)).count())
    }

    pub fn start_scan_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::StartScan(_)))
    }

    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Connect(_)))
    }

    fn record(&self, call: TransportCall) {
        self.calls.with(|calls| calls.push(call));
    }

    fn respond(&self, event: TransportEvent) {
        if self.auto_respond.load(Ordering::SeqCst) {
            // Completion events are asynchronous on a real radio too; a full
            // queue just drops the response.
            let _ = self.events.try_send(event);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn power_state(&self) -> PowerState {
        self.power.get()
    }

    async fn retrieve_peripheral(&self, id: &PeripheralId) -> Option<PeripheralInfo> {
        self.known
            .with(|known| known.iter().find(|p| &p.id == id).cloned())
    }

    async fn retrieve_connected_peripherals(&self, _services: &[Uuid]) -> Vec<PeripheralInfo> {
        self.connected.get()
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.record(TransportCall::StartScan(services.to_vec()));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(TransportCall::StopScan);
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        self.record(TransportCall::Connect(id.clone()));
        self.respond(TransportEvent::Connected(id.clone()));
        Ok(())
    }

    async fn configure(&self, id: &PeripheralId) -> Result<()> {
        self.record(TransportCall::Configure(id.clone()));
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(Error::characteristic_not_found(
                g7_types::uuids::CONTROL.to_string(),
                0,
            ));
        }
        Ok(())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<()> {
        self.record(TransportCall::CancelConnection(id.clone()));
        self.respond(TransportEvent::Disconnected {
            id: id.clone(),
            reason: DisconnectReason::UserRequested,
        });
        Ok(())
    }

    async fn write(&self, id: &PeripheralId, channel: Channel, data: &[u8]) -> Result<()> {
        self.record(TransportCall::Write {
            id: id.clone(),
            channel,
            data: data.to_vec(),
        });
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(Error::transport("write rejected"));
        }
        Ok(())
    }
}
