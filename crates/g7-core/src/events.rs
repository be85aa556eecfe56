//! Session event system.
//!
//! The session layer publishes a [`SessionEvent`] for every observable change:
//! connection status, new readings, backfill, sensor adoption. Subscribers
//! (UI, uploader, persistence) receive them over a broadcast channel.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use g7_types::{AuthStatus, BackfillRecord, ExtendedVersion, GlucoseMessage, SensorVariant};

use crate::transport::PeripheralInfo;

/// Sensor identifier for events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorId {
    /// Platform peripheral identifier.
    pub id: String,
    /// Advertised name (the sensor serial), if known.
    pub name: Option<String>,
    /// Detected variant, if known.
    pub variant: Option<SensorVariant>,
}

impl SensorId {
    /// Create a sensor ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            variant: None,
        }
    }

    /// Create a sensor ID from a peripheral.
    pub fn from_peripheral(peripheral: &PeripheralInfo, variant: Option<SensorVariant>) -> Self {
        Self {
            id: peripheral.id.to_string(),
            name: peripheral.name.clone(),
            variant,
        }
    }
}

/// Events emitted by the session layer.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// Connected and configured.
    Connected { sensor: SensorId },
    /// A connection attempt failed or a link dropped unexpectedly.
    ConnectionError {
        sensor: Option<SensorId>,
        error: String,
    },
    /// Scanning started or stopped.
    ScanningChanged { scanning: bool },
    /// A new sensor was paired and its session started.
    SensorAdopted {
        sensor: SensorId,
        #[serde(with = "time::serde::rfc3339")]
        activated_at: OffsetDateTime,
    },
    /// A glucose reading newer than any seen before.
    NewReading {
        sensor: SensorId,
        reading: GlucoseMessage,
        #[serde(with = "time::serde::rfc3339")]
        received_at: OffsetDateTime,
        upload: bool,
    },
    /// Backfill records not delivered before.
    Backfill {
        sensor: SensorId,
        records: Vec<BackfillRecord>,
        upload: bool,
    },
    /// The sensor reported its session timing.
    ExtendedVersion {
        sensor: SensorId,
        version: ExtendedVersion,
    },
    /// Authentication status changed.
    Authentication { sensor: SensorId, status: AuthStatus },
    /// The sensor was forgotten; session state is empty.
    SensorForgotten,
    /// Session state changed and should be persisted.
    StateChanged,
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SessionEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
