//! Sensor algorithm state and its calibration classification.
//!
//! Every glucose message and backfill record carries a one-byte algorithm
//! state. [`AlgorithmState`] keeps unrecognized codes as
//! [`AlgorithmState::Unknown`] so a decoder never rejects a status it has
//! not seen before.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Named algorithm states reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KnownState {
    Stopped = 1,
    Warmup = 2,
    ExcessNoise = 3,
    FirstOfTwoBgsNeeded = 4,
    SecondOfTwoBgsNeeded = 5,
    Ok = 6,
    NeedsCalibration = 7,
    CalibrationError1 = 8,
    CalibrationError2 = 9,
    CalibrationLinearityFitFailure = 10,
    SensorFailedDueToCountsAberration = 11,
    SensorFailedDueToResidualAberration = 12,
    OutOfCalibrationDueToOutlier = 13,
    OutlierCalibrationRequest = 14,
    SessionExpired = 15,
    SessionFailedDueToUnrecoverableError = 16,
    SessionFailedDueToTransmitterError = 17,
    TemporarySensorIssue = 18,
    SensorFailedDueToProgressiveSensorDecline = 19,
    SensorFailedDueToHighCountsAberration = 20,
    SensorFailedDueToLowCountsAberration = 21,
    SensorFailedDueToRestart = 22,
    Expired = 24,
    SensorFailed = 25,
    SessionEnded = 26,
}

impl KnownState {
    /// Look up a named state by its raw code.
    #[must_use]
    pub fn from_raw(value: u8) -> Option<Self> {
        use KnownState::*;
        let state = match value {
            1 => Stopped,
            2 => Warmup,
            3 => ExcessNoise,
            4 => FirstOfTwoBgsNeeded,
            5 => SecondOfTwoBgsNeeded,
            6 => Ok,
            7 => NeedsCalibration,
            8 => CalibrationError1,
            9 => CalibrationError2,
            10 => CalibrationLinearityFitFailure,
            11 => SensorFailedDueToCountsAberration,
            12 => SensorFailedDueToResidualAberration,
            13 => OutOfCalibrationDueToOutlier,
            14 => OutlierCalibrationRequest,
            15 => SessionExpired,
            16 => SessionFailedDueToUnrecoverableError,
            17 => SessionFailedDueToTransmitterError,
            18 => TemporarySensorIssue,
            19 => SensorFailedDueToProgressiveSensorDecline,
            20 => SensorFailedDueToHighCountsAberration,
            21 => SensorFailedDueToLowCountsAberration,
            22 => SensorFailedDueToRestart,
            24 => Expired,
            25 => SensorFailed,
            26 => SessionEnded,
            _ => return None,
        };
        Some(state)
    }

    /// Primary display category for this state.
    #[must_use]
    pub fn category(self) -> CalibrationCategory {
        use KnownState::*;
        match self {
            Ok => CalibrationCategory::Ok,
            Warmup => CalibrationCategory::WarmingUp,
            Stopped | SessionEnded => CalibrationCategory::Stopped,
            SessionExpired | Expired => CalibrationCategory::Expired,
            ExcessNoise | TemporarySensorIssue => CalibrationCategory::TemporaryError,
            FirstOfTwoBgsNeeded
            | SecondOfTwoBgsNeeded
            | NeedsCalibration
            | CalibrationError1
            | CalibrationError2
            | CalibrationLinearityFitFailure
            | OutOfCalibrationDueToOutlier
            | OutlierCalibrationRequest => CalibrationCategory::NeedsCalibration,
            SensorFailedDueToCountsAberration
            | SensorFailedDueToResidualAberration
            | SessionFailedDueToUnrecoverableError
            | SessionFailedDueToTransmitterError
            | SensorFailedDueToProgressiveSensorDecline
            | SensorFailedDueToHighCountsAberration
            | SensorFailedDueToLowCountsAberration
            | SensorFailedDueToRestart
            | SensorFailed => CalibrationCategory::Failed,
        }
    }
}

/// Algorithm state byte as reported by the sensor.
///
/// Equality holds only between the same known state, or between two unknown
/// states carrying the same raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "u8", into = "u8"))]
pub enum AlgorithmState {
    /// A state with a defined meaning.
    Known(KnownState),
    /// A code this library does not recognize.
    Unknown(u8),
}

impl From<u8> for AlgorithmState {
    fn from(value: u8) -> Self {
        KnownState::from_raw(value).map_or(Self::Unknown(value), Self::Known)
    }
}

impl From<AlgorithmState> for u8 {
    fn from(state: AlgorithmState) -> Self {
        state.raw_value()
    }
}

impl AlgorithmState {
    /// The raw byte this state was decoded from.
    #[must_use]
    pub fn raw_value(self) -> u8 {
        match self {
            Self::Known(state) => state as u8,
            Self::Unknown(value) => value,
        }
    }

    /// The named state, if the code is recognized.
    #[must_use]
    pub fn known(self) -> Option<KnownState> {
        match self {
            Self::Known(state) => Some(state),
            Self::Unknown(_) => None,
        }
    }

    /// Primary display category; unknown codes echo their raw value.
    #[must_use]
    pub fn category(self) -> CalibrationCategory {
        match self {
            Self::Known(state) => state.category(),
            Self::Unknown(value) => CalibrationCategory::Unknown(value),
        }
    }

    /// The sensor has failed and will not produce further readings.
    #[must_use]
    pub fn sensor_failed(self) -> bool {
        self.category() == CalibrationCategory::Failed
    }

    #[must_use]
    pub fn is_in_warmup(self) -> bool {
        self == Self::Known(KnownState::Warmup)
    }

    /// The sensor reports a transient issue that is expected to clear.
    #[must_use]
    pub fn has_temporary_error(self) -> bool {
        self == Self::Known(KnownState::TemporarySensorIssue)
    }

    /// Only the `Ok` state produces glucose values that may be acted on.
    #[must_use]
    pub fn has_reliable_glucose(self) -> bool {
        self == Self::Known(KnownState::Ok)
    }

    #[must_use]
    pub fn needs_calibration(self) -> bool {
        self.category() == CalibrationCategory::NeedsCalibration
    }

    /// Human-readable description of the state's category.
    #[must_use]
    pub fn description(self) -> String {
        self.category().to_string()
    }

    /// Return an error unless glucose values in this state are reliable.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::UnreliableState`] carrying this state.
    pub fn ensure_reliable(self) -> Result<(), CalibrationError> {
        if self.has_reliable_glucose() {
            Ok(())
        } else {
            Err(CalibrationError::UnreliableState(self))
        }
    }
}

impl fmt::Display for AlgorithmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(state) => write!(f, "{:?}", state),
            Self::Unknown(value) => write!(f, "Unknown({})", value),
        }
    }
}

/// Primary human-readable category of an algorithm state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CalibrationCategory {
    Failed,
    NeedsCalibration,
    Stopped,
    WarmingUp,
    Expired,
    Ok,
    /// Excess noise or a temporary sensor issue.
    TemporaryError,
    /// Raw code with no known meaning.
    Unknown(u8),
}

impl fmt::Display for CalibrationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "Sensor failed"),
            Self::NeedsCalibration => write!(f, "Sensor needs calibration"),
            Self::Stopped => write!(f, "Sensor is stopped"),
            Self::WarmingUp => write!(f, "Sensor is warming up"),
            Self::Expired => write!(f, "Sensor expired"),
            Self::Ok => write!(f, "Sensor calibration is OK"),
            Self::TemporaryError => write!(f, "Sensor has a temporary issue"),
            Self::Unknown(value) => write!(f, "Sensor is in unknown state {}", value),
        }
    }
}
