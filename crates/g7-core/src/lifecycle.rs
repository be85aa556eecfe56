//! Time-based lifecycle facts derived from session state.
//!
//! Nothing here is cached or polled: [`LifecycleCalculator`] borrows a
//! snapshot and answers each query for the instant it is given.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use g7_types::{ExtendedVersion, SensorVariant};

use crate::state::SessionState;

/// Default age after which the latest reading counts as signal loss.
pub const DEFAULT_SIGNAL_LOSS_THRESHOLD: Duration = Duration::minutes(15);

/// Window before expiration in which a sensor is expiring soon.
pub const EXPIRING_SOON_WINDOW: Duration = Duration::hours(24);

/// Durations that define a sensor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTiming {
    /// Nominal session length, excluding grace.
    pub lifetime: Duration,
    pub warmup: Duration,
    pub grace_period: Duration,
}

impl SessionTiming {
    /// Fixed timing for a variant.
    pub fn for_variant(variant: SensorVariant) -> Self {
        Self {
            lifetime: variant.lifetime(),
            warmup: variant.warmup(),
            grace_period: variant.grace_period(),
        }
    }

    /// Timing reported by the sensor itself.
    pub fn from_extended_version(version: &ExtendedVersion) -> Self {
        Self {
            lifetime: version.lifetime(),
            warmup: version.warmup_length,
            grace_period: version.grace_period,
        }
    }
}

/// Coarse lifecycle state for status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No sensor paired, or no reading received yet.
    Searching,
    Warmup,
    Ok,
    /// Temporary sensor issue or signal loss.
    Error,
    Failed,
    Expired,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Searching => write!(f, "Searching for sensor"),
            LifecycleState::Warmup => write!(f, "Warming up"),
            LifecycleState::Ok => write!(f, "OK"),
            LifecycleState::Error => write!(f, "Sensor error"),
            LifecycleState::Failed => write!(f, "Sensor failed"),
            LifecycleState::Expired => write!(f, "Sensor expired"),
        }
    }
}

/// Which phase a progress fraction refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Warmup,
    Session,
}

/// Elapsed fraction of the current phase, in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LifecycleProgress {
    pub phase: LifecyclePhase,
    pub fraction: f64,
}

/// Lifecycle facts for one instant, for display and logging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LifecycleReport {
    pub state: LifecycleState,
    pub progress: Option<LifecycleProgress>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub warmup_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    pub expiring_soon: bool,
    pub in_grace_period: bool,
}

/// Lifecycle queries over one session snapshot.
///
/// Timing comes from the sensor's extended-version report when one was
/// received on this connection, otherwise from the variant's constants.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleCalculator<'a> {
    state: &'a SessionState,
    timing: SessionTiming,
    signal_loss_threshold: Duration,
}

impl<'a> LifecycleCalculator<'a> {
    pub fn new(state: &'a SessionState) -> Self {
        let timing = state
            .extended_version
            .as_ref()
            .map_or_else(
                || SessionTiming::for_variant(state.variant),
                SessionTiming::from_extended_version,
            );
        Self {
            state,
            timing,
            signal_loss_threshold: DEFAULT_SIGNAL_LOSS_THRESHOLD,
        }
    }

    /// Override the age at which the latest reading counts as signal loss.
    #[must_use]
    pub fn with_signal_loss_threshold(mut self, threshold: Duration) -> Self {
        self.signal_loss_threshold = threshold;
        self
    }

    pub fn timing(&self) -> SessionTiming {
        self.timing
    }

    pub fn activated_at(&self) -> Option<OffsetDateTime> {
        self.state.activated_at
    }

    pub fn sensor_finishes_warmup_at(&self) -> Option<OffsetDateTime> {
        self.state.activated_at.map(|at| at + self.timing.warmup)
    }

    /// End of the nominal lifetime.
    pub fn sensor_expires_at(&self) -> Option<OffsetDateTime> {
        self.state.activated_at.map(|at| at + self.timing.lifetime)
    }

    /// End of the grace period; the sensor stops working here.
    pub fn sensor_ends_at(&self) -> Option<OffsetDateTime> {
        self.sensor_expires_at()
            .map(|at| at + self.timing.grace_period)
    }

    /// True on `[activation, activation + warmup)`.
    pub fn is_in_warmup(&self, now: OffsetDateTime) -> bool {
        match (self.state.activated_at, self.sensor_finishes_warmup_at()) {
            (Some(start), Some(end)) => start <= now && now < end,
            _ => false,
        }
    }

    pub fn is_in_grace_period(&self, now: OffsetDateTime) -> bool {
        match (self.sensor_expires_at(), self.sensor_ends_at()) {
            (Some(expires), Some(ends)) => expires <= now && now < ends,
            _ => false,
        }
    }

    /// Within a day of the nominal expiration but not yet past it.
    pub fn is_expiring_soon(&self, now: OffsetDateTime) -> bool {
        self.sensor_expires_at()
            .is_some_and(|expires| now < expires && expires - now <= EXPIRING_SOON_WINDOW)
    }

    /// Past lifetime plus grace period.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.sensor_ends_at().is_some_and(|ends| now >= ends)
    }

    /// The latest reading is older than the signal loss threshold.
    pub fn has_signal_loss(&self, now: OffsetDateTime) -> bool {
        self.state
            .latest_reading_at
            .is_some_and(|at| now - at > self.signal_loss_threshold)
    }

    /// Progress through the current phase.
    ///
    /// A failed sensor's progress stops at the failure instant.
    pub fn progress(&self, now: OffsetDateTime) -> Option<LifecycleProgress> {
        let start = self.state.activated_at?;
        let point = self.state.failed_at.map_or(now, |failed| failed.min(now));
        let elapsed = point - start;

        let (phase, length) = if elapsed < self.timing.warmup {
            (LifecyclePhase::Warmup, self.timing.warmup)
        } else {
            (LifecyclePhase::Session, self.timing.lifetime)
        };

        let fraction = if length.is_positive() {
            (elapsed / length).clamp(0.0, 1.0)
        } else {
            1.0
        };
        Some(LifecycleProgress { phase, fraction })
    }

    pub fn lifecycle_state(&self, now: OffsetDateTime) -> LifecycleState {
        if !self.state.has_sensor() {
            return LifecycleState::Searching;
        }
        if self.is_expired(now) {
            return LifecycleState::Expired;
        }
        let Some(reading) = &self.state.latest_reading else {
            return LifecycleState::Searching;
        };

        let algorithm = reading.algorithm_state;
        if algorithm.sensor_failed() {
            LifecycleState::Failed
        } else if algorithm.is_in_warmup() || self.is_in_warmup(now) {
            LifecycleState::Warmup
        } else if algorithm.has_temporary_error() || self.has_signal_loss(now) {
            LifecycleState::Error
        } else {
            LifecycleState::Ok
        }
    }

    /// Every fact at once.
    pub fn report(&self, now: OffsetDateTime) -> LifecycleReport {
        LifecycleReport {
            state: self.lifecycle_state(now),
            progress: self.progress(now),
            warmup_ends_at: self.sensor_finishes_warmup_at(),
            expires_at: self.sensor_expires_at(),
            ends_at: self.sensor_ends_at(),
            expiring_soon: self.is_expiring_soon(now),
            in_grace_period: self.is_in_grace_period(now),
        }
    }
}
