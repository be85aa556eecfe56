//! Transport abstraction consumed by the connection manager.
//!
//! A [`Transport`] performs radio operations on request and reports
//! everything asynchronous (power changes, discoveries, connection results,
//! characteristic payloads) as [`TransportEvent`]s on a channel the manager
//! drains. [`crate::ble::BtleplugTransport`] is the real implementation and
//! [`crate::mock::MockTransport`] the test double.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use g7_types::Channel;

use crate::error::{ConnectionFailureReason, DisconnectReason, Result};

/// Opaque platform identifier of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create a peripheral ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralInfo {
    /// Platform identifier.
    pub id: PeripheralId,
    /// Advertised local name; the sensor's serial for G7-family sensors.
    pub name: Option<String>,
}

impl PeripheralInfo {
    /// Create peripheral info.
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: PeripheralId::new(id),
            name,
        }
    }

    /// Create peripheral info with a known name.
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, Some(name.into()))
    }
}

/// Radio power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    #[default]
    Unknown,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Unknown => write!(f, "unknown"),
            PowerState::PoweredOff => write!(f, "powered off"),
            PowerState::PoweredOn => write!(f, "powered on"),
        }
    }
}

/// Data carried by one advertisement event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Asynchronous notifications from a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The radio changed power state.
    PowerStateChanged(PowerState),
    /// The platform restored peripherals from a previous process.
    Restored(Vec<PeripheralInfo>),
    /// A peripheral advertised during a scan.
    Discovered {
        peripheral: PeripheralInfo,
        advertisement: Advertisement,
    },
    /// A connection attempt completed.
    Connected(PeripheralId),
    /// A connection attempt failed.
    ConnectFailed {
        id: PeripheralId,
        reason: ConnectionFailureReason,
    },
    /// A link dropped.
    Disconnected {
        id: PeripheralId,
        reason: DisconnectReason,
    },
    /// A characteristic notification arrived.
    Value {
        id: PeripheralId,
        channel: Channel,
        data: Vec<u8>,
    },
}

/// Radio operations the connection manager needs.
///
/// Operations that complete asynchronously in the radio stack (connecting,
/// disconnecting) report their outcome as a [`TransportEvent`] rather than
/// through the returned future.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Current radio power state.
    async fn power_state(&self) -> PowerState;

    /// Look up a previously seen peripheral by identifier.
    async fn retrieve_peripheral(&self, id: &PeripheralId) -> Option<PeripheralInfo>;

    /// Peripherals the platform already has connected that expose any of `services`.
    async fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralInfo>;

    /// Begin scanning for peripherals advertising any of `services`.
    async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Begin connecting. Completion arrives as `Connected` or `ConnectFailed`.
    async fn connect(&self, id: &PeripheralId) -> Result<()>;

    /// Connection-time setup: service discovery and notification subscription.
    async fn configure(&self, id: &PeripheralId) -> Result<()>;

    /// Release the link or abort a pending connection.
    async fn cancel_connection(&self, id: &PeripheralId) -> Result<()>;

    /// Write a payload to a channel's characteristic.
    async fn write(&self, id: &PeripheralId, channel: Channel, data: &[u8]) -> Result<()>;
}
