//! Single-sensor connection management.
//!
//! [`ConnectionManager`] keeps one link to one sensor alive across radio
//! churn. All transport work happens on a single worker task that drains,
//! in priority order, transport events, scheduled rescans and caller
//! commands, so no two connection operations ever interleave. Callers talk
//! to the worker through a command queue and wait for its reply.
//!
//! Flags that callers read or write at any time (stay-connected,
//! scan-while-connecting, the remembered peripheral) live in independent
//! [`Locked`] cells shared with the worker, so reading them never enters the
//! queue.
//!
//! ```text
//!  idle ──scan──▶ scanning ──admitted──▶ connecting ──connected──▶ connected
//!   ▲                 ▲                       │                        │
//!   └── power off ────┘◀──── 2s rescan ◀──────┴──── failed/dropped ────┘
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use g7_types::Channel;
use g7_types::uuid::{ADVERTISEMENT_SERVICE, CONNECTED_PERIPHERAL_SERVICES};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionFailureReason, DisconnectReason, Error, Result};
use crate::reconnect::RescanScheduler;
use crate::traits::ConnectionDelegate;
use crate::transport::{PeripheralId, PeripheralInfo, PowerState, Transport, TransportEvent};
use crate::util::Locked;

/// Observable state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not scanning and no link.
    #[default]
    Idle,
    /// Scanning for the sensor.
    Scanning,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected to the sensor.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Flags shared between callers and the worker.
///
/// Initialised from [`ConnectionConfig`] at spawn; the remembered peripheral
/// is cleared by [`ConnectionManager::forget_peripheral`].
#[derive(Debug)]
struct ConnectionFlags {
    stay_connected: Locked<bool>,
    scan_while_connecting: Locked<bool>,
    peripheral_id: Locked<Option<PeripheralId>>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Scan(Reply<()>),
    StopScanning(Reply<()>),
    Disconnect(Reply<()>),
    Forget(Reply<()>),
    Write {
        channel: Channel,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    IsScanning(oneshot::Sender<bool>),
    IsConnected(oneshot::Sender<bool>),
}

/// Message sent by the rescan scheduler.
#[derive(Debug, Clone, Copy)]
struct Rescan;

/// Handle to the connection worker.
///
/// Dropping the handle stops the worker and cancels any scheduled rescan.
///
/// # Example
///
/// ```ignore
/// use g7_core::{BtleplugTransport, ConnectionConfig, ConnectionManager};
///
/// let (transport, events) = BtleplugTransport::new(64).await?;
/// let manager = ConnectionManager::spawn(transport, events, None, &ConnectionConfig::default());
/// manager.scan_for_peripheral().await?;
/// ```
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    flags: Arc<ConnectionFlags>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Spawn the worker task. Must be called within a Tokio runtime.
    ///
    /// `events` is the transport's event stream; `delegate` is the single
    /// collaborator receiving status, payloads and admission queries.
    pub fn spawn<T: Transport>(
        transport: Arc<T>,
        events: mpsc::Receiver<TransportEvent>,
        delegate: Option<Arc<dyn ConnectionDelegate>>,
        config: &ConnectionConfig,
    ) -> Self {
        let flags = Arc::new(ConnectionFlags {
            stay_connected: Locked::new(config.stay_connected),
            scan_while_connecting: Locked::new(config.scan_while_connecting),
            peripheral_id: Locked::new(None),
        });
        let shutdown = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (rescan_tx, rescan_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let worker = Worker {
            transport,
            delegate,
            flags: Arc::clone(&flags),
            rescan: RescanScheduler::new(
                rescan_tx,
                Rescan,
                config.rescan_delay_duration(),
                shutdown.clone(),
            ),
            state_tx,
            power: PowerState::Unknown,
            peripheral: None,
            link: Link::Disconnected,
            scanning: false,
        };
        tokio::spawn(worker.run(command_rx, events, rescan_rx, shutdown.clone()));

        Self {
            commands: command_tx,
            flags,
            state: state_rx,
            shutdown,
        }
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::ManagerClosed)?;
        rx.await.map_err(|_| Error::ManagerClosed)
    }

    /// Find and connect to the sensor.
    ///
    /// Tries the remembered peripheral first, then peripherals the platform
    /// already has connected, then scans. Does nothing until the radio is
    /// powered on; a later power-on triggers the scan automatically.
    #[tracing::instrument(skip(self))]
    pub async fn scan_for_peripheral(&self) -> Result<()> {
        self.request(Command::Scan).await?
    }

    /// Stop scanning. Notifies the delegate only if a scan was running.
    #[tracing::instrument(skip(self))]
    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(Command::StopScanning).await?
    }

    /// Stop scanning and release the link. The remembered peripheral is kept.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await?
    }

    /// Release the link and forget the remembered peripheral.
    #[tracing::instrument(skip(self))]
    pub async fn forget_peripheral(&self) -> Result<()> {
        self.request(Command::Forget).await?
    }

    /// Write a payload to the connected sensor.
    ///
    /// Returns [`Error::NotConnected`] if no link is up.
    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, channel: Channel, data: Vec<u8>) -> Result<()> {
        self.request(|reply| Command::Write {
            channel,
            data,
            reply,
        })
        .await?
    }

    /// Whether a scan is running.
    pub async fn is_scanning(&self) -> Result<bool> {
        self.request(Command::IsScanning).await
    }

    /// Whether the link is connected.
    pub async fn is_connected(&self) -> Result<bool> {
        self.request(Command::IsConnected).await
    }

    /// Current observable state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stay_connected(&self) -> bool {
        self.flags.stay_connected.get()
    }

    /// Rescan automatically after a dropped link or failed connection.
    pub fn set_stay_connected(&self, enabled: bool) {
        self.flags.stay_connected.set(enabled);
    }

    pub fn scan_while_connecting(&self) -> bool {
        self.flags.scan_while_connecting.get()
    }

    /// Keep scanning while a connection attempt is in flight.
    pub fn set_scan_while_connecting(&self, enabled: bool) {
        self.flags.scan_while_connecting.set(enabled);
    }

    /// The remembered peripheral.
    pub fn peripheral_id(&self) -> Option<PeripheralId> {
        self.flags.peripheral_id.get()
    }

    /// Restore the remembered peripheral, typically at process start.
    pub fn set_peripheral_id(&self, id: Option<PeripheralId>) {
        self.flags.peripheral_id.set(id);
    }

    /// Stop the worker. Pending and later requests fail with [`Error::ManagerClosed`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("flags", &self.flags)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Disconnected,
    Connecting,
    Connected,
}

struct Worker<T> {
    transport: Arc<T>,
    delegate: Option<Arc<dyn ConnectionDelegate>>,
    flags: Arc<ConnectionFlags>,
    rescan: RescanScheduler<Rescan>,
    state_tx: watch::Sender<ConnectionState>,
    power: PowerState,
    peripheral: Option<PeripheralInfo>,
    link: Link,
    scanning: bool,
}

impl<T: Transport> Worker<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<TransportEvent>,
        mut rescans: mpsc::Receiver<Rescan>,
        shutdown: CancellationToken,
    ) {
        self.power = self.transport.power_state().await;
        debug!("Connection worker started, radio {}", self.power);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Connection worker shutting down");
                    break;
                }
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(Rescan) = rescans.recv() => {
                    debug!("Delayed rescan");
                    if let Err(e) = self.scan_for_peripheral().await {
                        warn!("Rescan failed: {}", e);
                    }
                }
                Some(command) = commands.recv() => self.handle_command(command).await,
                else => break,
            }
            self.publish_state();
        }

        self.rescan.cancel();
    }

    fn publish_state(&self) {
        let state = match (self.link, self.scanning) {
            (Link::Connected, _) => ConnectionState::Connected,
            (Link::Connecting, _) => ConnectionState::Connecting,
            (Link::Disconnected, true) => ConnectionState::Scanning,
            (Link::Disconnected, false) => ConnectionState::Idle,
        };
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                trace!("Connection state {} -> {}", current, state);
                *current = state;
                true
            }
        });
    }

    async fn handle_command(&mut self, command: Command) {
        // A dropped reply receiver means the caller stopped waiting.
        match command {
            Command::Scan(reply) => {
                let _ = reply.send(self.scan_for_peripheral().await);
            }
            Command::StopScanning(reply) => {
                let _ = reply.send(self.stop_scan().await);
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(self.disconnect().await);
            }
            Command::Forget(reply) => {
                let _ = reply.send(self.forget().await);
            }
            Command::Write {
                channel,
                data,
                reply,
            } => {
                let _ = reply.send(self.write(channel, &data).await);
            }
            Command::IsScanning(reply) => {
                let _ = reply.send(self.scanning);
            }
            Command::IsConnected(reply) => {
                let _ = reply.send(self.link == Link::Connected);
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PowerStateChanged(state) => self.on_power_state(state).await,
            TransportEvent::Restored(peripherals) => self.on_restored(peripherals),
            TransportEvent::Discovered { peripheral, .. } => self.on_discovered(peripheral).await,
            TransportEvent::Connected(id) => self.on_connected(id).await,
            TransportEvent::ConnectFailed { id, reason } => self.on_connect_failed(id, reason),
            TransportEvent::Disconnected { id, reason } => self.on_disconnected(id, reason),
            TransportEvent::Value { id, channel, data } => self.on_value(&id, channel, &data),
        }
    }

    // --- Helpers ---

    fn admits(&self, peripheral: &PeripheralInfo) -> bool {
        self.delegate
            .as_ref()
            .is_none_or(|delegate| delegate.should_connect(peripheral))
    }

    fn is_current(&self, id: &PeripheralId) -> bool {
        self.peripheral.as_ref().is_some_and(|p| &p.id == id)
    }

    fn adopt(&mut self, peripheral: PeripheralInfo) {
        self.flags.peripheral_id.set(Some(peripheral.id.clone()));
        self.peripheral = Some(peripheral);
    }

    fn report(&self, peripheral: &PeripheralInfo, result: Result<()>) {
        if let Some(delegate) = &self.delegate {
            delegate.connection_ready(peripheral, result);
        }
    }

    fn notify_scanning(&self, scanning: bool) {
        if let Some(delegate) = &self.delegate {
            delegate.scanning_status_changed(scanning);
        }
    }

    fn rescan_if_staying(&mut self) {
        if self.flags.stay_connected.get() {
            self.rescan.schedule();
        }
    }

    fn should_stop_scan_for_connection(&self) -> bool {
        self.scanning && !self.flags.scan_while_connecting.get()
    }

    // --- Operations ---

    async fn scan_for_peripheral(&mut self) -> Result<()> {
        if self.power != PowerState::PoweredOn {
            debug!("Radio {}, scan deferred until powered on", self.power);
            return Ok(());
        }
        if self.link == Link::Connected {
            debug!("Already connected, nothing to scan for");
            return Ok(());
        }

        if self.link == Link::Disconnected {
            let known = match self.flags.peripheral_id.get() {
                Some(id) => self.transport.retrieve_peripheral(&id).await,
                None => None,
            };

            if let Some(peripheral) = known {
                info!("Reconnecting to known peripheral {}", peripheral.id);
                self.connect_to(peripheral).await;
            } else {
                let connected = self
                    .transport
                    .retrieve_connected_peripherals(&CONNECTED_PERIPHERAL_SERVICES)
                    .await;
                if let Some(peripheral) = connected.into_iter().find(|p| self.admits(p)) {
                    info!("Adopting already connected peripheral {}", peripheral.id);
                    self.connect_to(peripheral).await;
                }
            }
        }

        if self.link != Link::Connecting || self.flags.scan_while_connecting.get() {
            self.start_scan().await?;
        }
        Ok(())
    }

    async fn start_scan(&mut self) -> Result<()> {
        if self.scanning {
            return Ok(());
        }
        self.transport.start_scan(&[ADVERTISEMENT_SERVICE]).await?;
        info!("Scanning for sensors");
        self.scanning = true;
        self.notify_scanning(true);
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if !self.scanning {
            return Ok(());
        }
        let result = self.transport.stop_scan().await;
        debug!("Scan stopped");
        self.scanning = false;
        self.notify_scanning(false);
        result
    }

    async fn connect_to(&mut self, peripheral: PeripheralInfo) {
        let id = peripheral.id.clone();
        self.adopt(peripheral);
        self.link = Link::Connecting;

        if let Err(e) = self.transport.connect(&id).await {
            warn!("Failed to start connection to {}: {}", id, e);
            self.on_connect_failed(id, ConnectionFailureReason::BleError(e.to_string()));
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Err(e) = self.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        let Some(peripheral) = self.peripheral.clone() else {
            return Ok(());
        };
        if self.link == Link::Disconnected {
            return Ok(());
        }
        info!("Disconnecting from {}", peripheral.id);
        self.link = Link::Disconnected;
        self.transport.cancel_connection(&peripheral.id).await
    }

    async fn forget(&mut self) -> Result<()> {
        self.rescan.cancel();
        self.flags.peripheral_id.set(None);
        let link = std::mem::replace(&mut self.link, Link::Disconnected);
        let Some(peripheral) = self.peripheral.take() else {
            return Ok(());
        };
        info!("Forgetting peripheral {}", peripheral.id);
        if link != Link::Disconnected {
            self.transport.cancel_connection(&peripheral.id).await?;
        }
        Ok(())
    }

    async fn write(&mut self, channel: Channel, data: &[u8]) -> Result<()> {
        match &self.peripheral {
            Some(peripheral) if self.link == Link::Connected => {
                self.transport.write(&peripheral.id, channel, data).await
            }
            _ => Err(Error::NotConnected),
        }
    }

    // --- Event handlers ---

    async fn on_power_state(&mut self, state: PowerState) {
        info!("Radio {}", state);
        self.power = state;

        if state == PowerState::PoweredOn {
            if let Err(e) = self.scan_for_peripheral().await {
                warn!("Scan after power on failed: {}", e);
            }
        } else if let Err(e) = self.stop_scan().await {
            debug!("Stop scan with radio {}: {}", state, e);
        }
    }

    fn on_restored(&mut self, peripherals: Vec<PeripheralInfo>) {
        if self.link != Link::Disconnected {
            debug!("Ignoring restored peripherals while a link is up");
            return;
        }
        if let Some(peripheral) = peripherals.into_iter().find(|p| self.admits(p)) {
            info!("Restored peripheral {}", peripheral.id);
            self.adopt(peripheral);
        }
    }

    async fn on_discovered(&mut self, peripheral: PeripheralInfo) {
        if self.link == Link::Connected {
            trace!("Ignoring discovery of {} while connected", peripheral.id);
            return;
        }
        if self.link == Link::Connecting && self.is_current(&peripheral.id) {
            return;
        }
        if !self.admits(&peripheral) {
            debug!("Peripheral {} rejected by admission check", peripheral.id);
            return;
        }

        if self.link == Link::Connecting
            && let Some(previous) = self.peripheral.clone()
        {
            debug!("Abandoning connection to {} for {}", previous.id, peripheral.id);
            if let Err(e) = self.transport.cancel_connection(&previous.id).await {
                debug!("Failed to cancel connection to {}: {}", previous.id, e);
            }
            self.link = Link::Disconnected;
        }

        info!(
            "Discovered {} ({}), connecting",
            peripheral.id,
            peripheral.name.as_deref().unwrap_or("unnamed")
        );
        self.connect_to(peripheral).await;

        if self.should_stop_scan_for_connection()
            && let Err(e) = self.stop_scan().await
        {
            warn!("Failed to stop scan: {}", e);
        }
    }

    async fn on_connected(&mut self, id: PeripheralId) {
        let Some(peripheral) = self.peripheral.clone().filter(|p| p.id == id) else {
            debug!("Releasing stale connection to {}", id);
            if let Err(e) = self.transport.cancel_connection(&id).await {
                debug!("Failed to release {}: {}", id, e);
            }
            return;
        };

        if self.should_stop_scan_for_connection()
            && let Err(e) = self.stop_scan().await
        {
            warn!("Failed to stop scan: {}", e);
        }

        self.link = Link::Connected;
        info!("Connected to {}", id);

        match self.transport.configure(&id).await {
            Ok(()) => {
                if self.power == PowerState::PoweredOn {
                    self.report(&peripheral, Ok(()));
                }
            }
            Err(e) => {
                warn!("Failed to configure {}: {}", id, e);
                self.report(
                    &peripheral,
                    Err(Error::connection_failed(
                        Some(id.to_string()),
                        ConnectionFailureReason::ConfigurationFailed(e.to_string()),
                    )),
                );
                self.link = Link::Disconnected;
                if let Err(e) = self.transport.cancel_connection(&id).await {
                    debug!("Failed to release {}: {}", id, e);
                }
            }
        }
    }

    fn on_connect_failed(&mut self, id: PeripheralId, reason: ConnectionFailureReason) {
        let Some(peripheral) = self.peripheral.clone().filter(|p| p.id == id) else {
            debug!("Ignoring connection failure for stale peripheral {}", id);
            return;
        };
        warn!("Connection to {} failed: {}", id, reason);
        self.link = Link::Disconnected;
        self.report(
            &peripheral,
            Err(Error::connection_failed(Some(id.to_string()), reason)),
        );
        self.rescan_if_staying();
    }

    fn on_disconnected(&mut self, id: PeripheralId, reason: DisconnectReason) {
        let Some(peripheral) = self.peripheral.clone().filter(|p| p.id == id) else {
            debug!("Ignoring disconnect of stale peripheral {}", id);
            return;
        };
        self.link = Link::Disconnected;

        if reason.is_benign() {
            debug!("Disconnected from {}: {}", id, reason);
        } else {
            warn!("Disconnected from {}: {}", id, reason);
            self.report(
                &peripheral,
                Err(Error::disconnected(Some(id.to_string()), reason)),
            );
        }
        self.rescan_if_staying();
    }

    fn on_value(&self, id: &PeripheralId, channel: Channel, data: &[u8]) {
        let Some(peripheral) = self.peripheral.as_ref().filter(|p| &p.id == id) else {
            trace!("Dropping {} payload from stale peripheral {}", channel, id);
            return;
        };
        match channel {
            Channel::Communication => {
                trace!("Ignoring communication payload ({} bytes)", data.len());
            }
            Channel::Control | Channel::Backfill | Channel::Authentication => {
                if let Some(delegate) = &self.delegate {
                    delegate.data_received(peripheral, channel, data);
                }
            }
        }
    }
}
