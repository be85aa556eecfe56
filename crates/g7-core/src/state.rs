//! Session state and its persisted form.
//!
//! [`SessionState`] is owned by the session layer and handed to everyone
//! else as a cloned snapshot. [`PersistedState`] is the key/value form
//! written to disk; every key is optional on load.

use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use g7_types::{ExtendedVersion, GlucoseMessage, SensorVariant};

use crate::error::Result;

/// Outcome of offering a glucose message to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingOutcome {
    /// First reading from a new sensor; the sensor was adopted.
    Adopted,
    /// A reading newer than the latest one.
    New,
    /// Same sequence number as the latest reading.
    Duplicate,
    /// Older than the latest reading.
    Stale,
}

impl ReadingOutcome {
    /// Whether the reading replaced the latest one.
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Adopted | Self::New)
    }
}

/// One sensor session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    /// Advertised name of the paired sensor.
    pub sensor_id: Option<String>,
    pub variant: SensorVariant,
    pub activated_at: Option<OffsetDateTime>,
    pub latest_reading: Option<GlucoseMessage>,
    /// When the latest reading was received.
    pub latest_reading_at: Option<OffsetDateTime>,
    pub latest_connect: Option<OffsetDateTime>,
    pub upload_readings: bool,
    /// The sensor runs the 15 day session option.
    pub fifteen_day: bool,
    /// Timing reported by the sensor on this connection. Not persisted.
    pub extended_version: Option<ExtendedVersion>,
    /// When a failed algorithm state was first seen. Not persisted.
    pub failed_at: Option<OffsetDateTime>,
}

impl SessionState {
    /// Empty state: no sensor paired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a sensor is paired.
    pub fn has_sensor(&self) -> bool {
        self.sensor_id.is_some()
    }

    /// Apply a decoded glucose message received at `received_at`.
    ///
    /// `peripheral_name` is the advertised name of the peripheral the
    /// message came from; it becomes the sensor identifier when no sensor is
    /// paired yet.
    pub fn apply_reading(
        &mut self,
        reading: GlucoseMessage,
        peripheral_name: Option<&str>,
        received_at: OffsetDateTime,
    ) -> ReadingOutcome {
        if let Some(latest) = &self.latest_reading {
            if reading.sequence == latest.sequence {
                return ReadingOutcome::Duplicate;
            }
            if reading.sequence < latest.sequence {
                return ReadingOutcome::Stale;
            }
        }

        let mut outcome = ReadingOutcome::New;
        if self.sensor_id.is_none()
            && let Some(name) = peripheral_name
        {
            self.sensor_id = Some(name.to_string());
            self.variant = SensorVariant::detect(name, self.fifteen_day);
            self.activated_at = Some(received_at - reading.message_timestamp);
            outcome = ReadingOutcome::Adopted;
        } else if self.activated_at.is_none() {
            self.activated_at = Some(received_at - reading.message_timestamp);
        }

        if reading.algorithm_state.sensor_failed() && self.failed_at.is_none() {
            self.failed_at = Some(received_at);
        }

        self.latest_reading = Some(reading);
        self.latest_reading_at = Some(received_at);
        outcome
    }

    /// Record the timing the sensor reported for this connection.
    ///
    /// A reported lifetime of 15 days or more marks the session as a
    /// 15 day session.
    pub fn apply_extended_version(&mut self, version: ExtendedVersion) {
        if version.lifetime() >= time::Duration::days(15) {
            self.fifteen_day = true;
            self.variant = self.variant.with_fifteen_day(true);
        }
        self.extended_version = Some(version);
    }

    /// Record a completed connection.
    pub fn record_connect(&mut self, at: OffsetDateTime) {
        self.latest_connect = Some(at);
    }

    /// Forget the sensor. The upload preference survives.
    pub fn reset(&mut self) {
        *self = Self {
            upload_readings: self.upload_readings,
            ..Self::default()
        };
    }

    /// Convert to the persisted form.
    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            sensor_id: self.sensor_id.clone(),
            sensor_type: self
                .sensor_id
                .as_ref()
                .map(|_| self.variant.tag().to_string()),
            activated_at: self.activated_at,
            latest_reading: self
                .latest_reading
                .as_ref()
                .map(|reading| reading.as_bytes().to_vec()),
            latest_reading_timestamp: self.latest_reading_at,
            latest_connect: self.latest_connect,
            upload_readings: self.upload_readings,
            is_fifteen_day_sensor: self.fifteen_day,
        }
    }

    /// Restore from the persisted form.
    ///
    /// A missing or unrecognized sensor type is recomputed from the sensor
    /// identifier. A latest reading that no longer decodes is dropped.
    pub fn from_persisted(persisted: PersistedState) -> Self {
        let variant = persisted
            .sensor_type
            .as_deref()
            .and_then(SensorVariant::from_tag)
            .or_else(|| {
                persisted
                    .sensor_id
                    .as_deref()
                    .map(|id| SensorVariant::detect(id, persisted.is_fifteen_day_sensor))
            })
            .unwrap_or_default();

        let latest_reading = persisted.latest_reading.as_deref().and_then(|bytes| {
            GlucoseMessage::from_bytes(bytes)
                .inspect_err(|e| warn!("Dropping persisted reading: {}", e))
                .ok()
        });

        let failed_at = latest_reading
            .as_ref()
            .filter(|reading| reading.algorithm_state.sensor_failed())
            .and(persisted.latest_reading_timestamp);

        Self {
            sensor_id: persisted.sensor_id,
            variant,
            activated_at: persisted.activated_at,
            latest_reading,
            latest_reading_at: persisted.latest_reading_timestamp,
            latest_connect: persisted.latest_connect,
            upload_readings: persisted.upload_readings,
            fifteen_day: persisted.is_fifteen_day_sensor,
            extended_version: None,
            failed_at,
        }
    }

    /// Load state from a JSON file. A missing file yields empty state.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No session state at {}", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read(path)?;
        let persisted: PersistedState = serde_json::from_slice(&content)?;
        Ok(Self::from_persisted(persisted))
    }

    /// Save state to a JSON file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(&self.to_persisted())?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Persisted key/value snapshot of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(rename = "sensorID", skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub activated_at: Option<OffsetDateTime>,
    /// Raw bytes of the latest glucose message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_reading: Option<Vec<u8>>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub latest_reading_timestamp: Option<OffsetDateTime>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub latest_connect: Option<OffsetDateTime>,
    pub upload_readings: bool,
    pub is_fifteen_day_sensor: bool,
}
