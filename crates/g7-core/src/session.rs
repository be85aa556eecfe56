//! Session management: the single owner of [`SessionState`].
//!
//! [`SensorSession`] is the connection manager's delegate. It decodes
//! payloads, applies them to the session state and broadcasts a
//! [`SessionEvent`] for every observable change. Everyone else reads the
//! state through cloned snapshots.

use std::collections::BTreeSet;

use time::{Duration, OffsetDateTime};
use tracing::{debug, info, trace, warn};

use g7_types::{
    AuthStatus, BackfillRecord, Channel, ControlMessage, ExtendedVersion, GlucoseMessage,
    SensorVariant,
};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::events::{EventDispatcher, EventReceiver, SensorId, SessionEvent};
use crate::lifecycle::{LifecycleCalculator, LifecycleReport};
use crate::state::{ReadingOutcome, SessionState};
use crate::traits::ConnectionDelegate;
use crate::transport::PeripheralInfo;
use crate::util::Locked;

/// Backfill records held until the next live reading.
///
/// Sensor timestamps delivered during this process are tracked exactly, so
/// a gap record older than the latest live reading still gets through. On
/// restore only the latest reading is known; everything at or before it is
/// treated as delivered.
#[derive(Debug, Default)]
struct BackfillBuffer {
    floor: Option<Duration>,
    delivered: BTreeSet<Duration>,
    pending: Vec<BackfillRecord>,
}

impl BackfillBuffer {
    fn restored(latest: Option<&GlucoseMessage>) -> Self {
        Self {
            floor: latest.map(GlucoseMessage::glucose_timestamp),
            ..Self::default()
        }
    }

    fn is_delivered(&self, timestamp: Duration) -> bool {
        self.floor.is_some_and(|floor| timestamp <= floor) || self.delivered.contains(&timestamp)
    }

    /// Record a live reading's sensor timestamp.
    fn observe(&mut self, timestamp: Duration) {
        self.delivered.insert(timestamp);
    }

    fn push(&mut self, record: BackfillRecord) -> bool {
        if self.is_delivered(record.timestamp) {
            return false;
        }
        self.delivered.insert(record.timestamp);
        self.pending.push(record);
        true
    }

    fn take(&mut self, live: Option<&GlucoseMessage>) -> Vec<BackfillRecord> {
        let mut records = std::mem::take(&mut self.pending);
        if let Some(live) = live {
            let timestamp = live.glucose_timestamp();
            records.retain(|record| record.timestamp != timestamp);
        }
        records
    }
}

/// Owner of the session state and delegate of the connection manager.
#[derive(Debug)]
pub struct SensorSession {
    state: Locked<SessionState>,
    events: EventDispatcher,
    peripheral: Locked<Option<PeripheralInfo>>,
    backfill: Locked<BackfillBuffer>,
    signal_loss_threshold: Duration,
}

impl SensorSession {
    /// Create a session from restored (or empty) state.
    pub fn new(initial: SessionState, config: &SessionConfig) -> Self {
        let backfill = BackfillBuffer::restored(initial.latest_reading.as_ref());
        Self {
            state: Locked::new(initial),
            events: EventDispatcher::new(config.event_capacity.max(1)),
            peripheral: Locked::new(None),
            backfill: Locked::new(backfill),
            signal_loss_threshold: config.signal_loss_threshold(),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.state.get()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Lifecycle facts as of `now`.
    pub fn lifecycle(&self, now: OffsetDateTime) -> LifecycleReport {
        let snapshot = self.snapshot();
        LifecycleCalculator::new(&snapshot)
            .with_signal_loss_threshold(self.signal_loss_threshold)
            .report(now)
    }

    /// The peripheral of the current or most recent connection.
    pub fn peripheral(&self) -> Option<PeripheralInfo> {
        self.peripheral.get()
    }

    /// Forget the paired sensor and start over with empty state.
    pub fn forget_sensor(&self) {
        let forgotten = self.state.with(|state| {
            let id = state.sensor_id.take();
            state.reset();
            id
        });
        self.backfill.set(BackfillBuffer::default());
        info!("Forgot sensor {}", forgotten.as_deref().unwrap_or("(none)"));
        self.events.send(SessionEvent::SensorForgotten);
        self.events.send(SessionEvent::StateChanged);
    }

    pub fn set_upload_readings(&self, enabled: bool) {
        let changed = self.state.with(|state| {
            std::mem::replace(&mut state.upload_readings, enabled) != enabled
        });
        if changed {
            self.events.send(SessionEvent::StateChanged);
        }
    }

    /// The latest reading, if its algorithm state makes it trustworthy.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Calibration`] when the latest reading exists
    /// but its algorithm state is not OK.
    pub fn latest_reliable_reading(&self) -> Result<Option<GlucoseMessage>> {
        let Some(reading) = self.snapshot().latest_reading else {
            return Ok(None);
        };
        reading.algorithm_state.ensure_reliable()?;
        Ok(Some(reading))
    }

    /// Admission check for candidate peripherals.
    ///
    /// With a paired sensor only that sensor is accepted; otherwise any
    /// peripheral advertising a known sensor name.
    pub fn admits(&self, peripheral: &PeripheralInfo) -> bool {
        let Some(name) = peripheral.name.as_deref() else {
            return false;
        };
        match self.state.with(|state| state.sensor_id.clone()) {
            Some(sensor_id) => sensor_id == name,
            None => SensorVariant::is_sensor_name(name),
        }
    }

    fn sensor_id(&self, peripheral: &PeripheralInfo) -> SensorId {
        let variant = self.state.with(|state| state.variant);
        SensorId::from_peripheral(peripheral, Some(variant))
    }

    fn flush_backfill(&self, peripheral: &PeripheralInfo, live: Option<&GlucoseMessage>) {
        let records = self.backfill.with(|buffer| buffer.take(live));
        if records.is_empty() {
            return;
        }
        debug!("Delivering {} backfill records", records.len());
        let upload = self.state.with(|state| state.upload_readings);
        self.events.send(SessionEvent::Backfill {
            sensor: self.sensor_id(peripheral),
            records,
            upload,
        });
    }

    // --- Handlers ---

    /// A connection attempt finished.
    pub fn handle_connected(
        &self,
        peripheral: &PeripheralInfo,
        result: Result<()>,
        now: OffsetDateTime,
    ) {
        match result {
            Ok(()) => {
                self.peripheral.set(Some(peripheral.clone()));
                self.flush_backfill(peripheral, None);
                self.state.with(|state| state.record_connect(now));
                self.events.send(SessionEvent::Connected {
                    sensor: self.sensor_id(peripheral),
                });
                self.events.send(SessionEvent::StateChanged);
            }
            Err(e) => {
                self.events.send(SessionEvent::ConnectionError {
                    sensor: Some(self.sensor_id(peripheral)),
                    error: e.to_string(),
                });
            }
        }
    }

    /// A control channel payload arrived.
    pub fn handle_control(&self, peripheral: &PeripheralInfo, data: &[u8], now: OffsetDateTime) {
        match ControlMessage::from_bytes(data) {
            Ok(ControlMessage::Glucose(reading)) => self.apply_reading(peripheral, reading, now),
            Ok(ControlMessage::ExtendedVersion(version)) => {
                self.apply_extended_version(peripheral, version);
            }
            Err(e) => debug!("Dropping control payload ({} bytes): {}", data.len(), e),
        }
    }

    fn apply_reading(
        &self,
        peripheral: &PeripheralInfo,
        reading: GlucoseMessage,
        now: OffsetDateTime,
    ) {
        let (outcome, activated_at, upload) = self.state.with(|state| {
            let outcome = state.apply_reading(reading.clone(), peripheral.name.as_deref(), now);
            (outcome, state.activated_at, state.upload_readings)
        });

        match outcome {
            ReadingOutcome::Duplicate => {
                trace!("Duplicate reading {}", reading.sequence);
                return;
            }
            ReadingOutcome::Stale => {
                debug!("Stale reading {}", reading.sequence);
                return;
            }
            ReadingOutcome::Adopted => {
                let sensor = self.sensor_id(peripheral);
                info!(
                    "Adopted sensor {} ({})",
                    sensor.name.as_deref().unwrap_or("unnamed"),
                    sensor.variant.unwrap_or_default()
                );
                if let Some(activated_at) = activated_at {
                    self.events.send(SessionEvent::SensorAdopted {
                        sensor,
                        activated_at,
                    });
                }
            }
            ReadingOutcome::New => {}
        }

        if reading.algorithm_state.sensor_failed() {
            warn!("Sensor reports {}", reading.algorithm_state.description());
        }

        self.flush_backfill(peripheral, Some(&reading));
        self.backfill
            .with(|buffer| buffer.observe(reading.glucose_timestamp()));
        self.events.send(SessionEvent::NewReading {
            sensor: self.sensor_id(peripheral),
            reading,
            received_at: now,
            upload,
        });
        self.events.send(SessionEvent::StateChanged);
    }

    fn apply_extended_version(&self, peripheral: &PeripheralInfo, version: ExtendedVersion) {
        debug!(
            "Session length {}, warmup {}, grace {}",
            version.session_length, version.warmup_length, version.grace_period
        );
        self.state.with(|state| state.apply_extended_version(version));
        self.events.send(SessionEvent::ExtendedVersion {
            sensor: self.sensor_id(peripheral),
            version,
        });
        self.events.send(SessionEvent::StateChanged);
    }

    /// A backfill record arrived.
    pub fn handle_backfill(&self, data: &[u8]) {
        match BackfillRecord::from_bytes(data) {
            Ok(record) => {
                let timestamp = record.timestamp;
                if !self.backfill.with(|buffer| buffer.push(record)) {
                    trace!("Backfill record at {} already delivered", timestamp);
                }
            }
            Err(e) => debug!("Dropping backfill payload: {}", e),
        }
    }

    /// An authentication payload arrived.
    pub fn handle_authentication(&self, peripheral: &PeripheralInfo, data: &[u8]) {
        match AuthStatus::from_bytes(data) {
            Ok(status) => {
                debug!(
                    "Authenticated: {}, bonded: {}",
                    status.authenticated, status.bonded
                );
                self.events.send(SessionEvent::Authentication {
                    sensor: self.sensor_id(peripheral),
                    status,
                });
            }
            Err(e) => trace!("Ignoring authentication payload: {}", e),
        }
    }
}

impl ConnectionDelegate for SensorSession {
    fn should_connect(&self, peripheral: &PeripheralInfo) -> bool {
        self.admits(peripheral)
    }

    fn connection_ready(&self, peripheral: &PeripheralInfo, result: Result<()>) {
        self.handle_connected(peripheral, result, OffsetDateTime::now_utc());
    }

    fn data_received(&self, peripheral: &PeripheralInfo, channel: Channel, data: &[u8]) {
        match channel {
            Channel::Control => self.handle_control(peripheral, data, OffsetDateTime::now_utc()),
            Channel::Backfill => self.handle_backfill(data),
            Channel::Authentication => self.handle_authentication(peripheral, data),
            Channel::Communication => {}
        }
    }

    fn scanning_status_changed(&self, scanning: bool) {
        self.events.send(SessionEvent::ScanningChanged { scanning });
    }
}
