//! Wire format of the G7 control, backfill and authentication channels.
//!
//! Every decoder checks the opcode marker and the fixed minimum length before
//! touching any field. All multi-byte fields are little-endian. Time fields
//! are converted to [`time::Duration`] at decode time.

use core::fmt;

use bytes::{Buf, BufMut};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::Duration;

use crate::algorithm::AlgorithmState;
use crate::error::{ParseError, ParseResult};

/// Minimum length of a glucose message.
pub const MIN_GLUCOSE_MESSAGE_BYTES: usize = 19;

/// Minimum length of a backfill record.
pub const MIN_BACKFILL_RECORD_BYTES: usize = 9;

/// Minimum length of an extended version message.
pub const MIN_EXTENDED_VERSION_BYTES: usize = 15;

/// Minimum length of an authentication status message.
pub const MIN_AUTH_STATUS_BYTES: usize = 3;

const NO_GLUCOSE: u16 = 0xFFFF;
const GLUCOSE_MASK: u16 = 0x0FFF;
const NO_TREND: i8 = 0x7F;
const DISPLAY_ONLY_FLAG: u8 = 0x10;

/// First byte of every opcode-framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    AuthStatus = 0x05,
    SessionStop = 0x28,
    Glucose = 0x4E,
    ExtendedVersion = 0x52,
    Backfill = 0x59,
}

impl Opcode {
    /// Look up an opcode by its byte value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x05 => Some(Opcode::AuthStatus),
            0x28 => Some(Opcode::SessionStop),
            0x4E => Some(Opcode::Glucose),
            0x52 => Some(Opcode::ExtendedVersion),
            0x59 => Some(Opcode::Backfill),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, *self as u8)
    }
}

/// Validate the opcode marker and minimum length of a framed message.
fn check_frame(data: &[u8], opcode: Opcode, min_len: usize) -> ParseResult<()> {
    match data.first() {
        Some(&actual) if actual != opcode as u8 => Err(ParseError::UnexpectedOpcode {
            expected: opcode as u8,
            actual,
        }),
        _ if data.len() < min_len => Err(ParseError::InsufficientBytes {
            expected: min_len,
            actual: data.len(),
        }),
        _ => Ok(()),
    }
}

fn decode_glucose(raw: u16) -> Option<u16> {
    (raw != NO_GLUCOSE).then_some(raw & GLUCOSE_MASK)
}

fn decode_trend(raw: u8) -> Option<i8> {
    let trend = raw as i8;
    (trend != NO_TREND).then_some(trend)
}

fn seconds(value: impl Into<i64>) -> Duration {
    Duration::seconds(value.into())
}

/// Live glucose reading from the control channel.
///
/// The byte format is:
/// - byte 0: opcode (0x4E)
/// - byte 1: status (0 when the reading is valid)
/// - bytes 2-5: message timestamp, seconds since activation (u32 LE)
/// - bytes 6-7: sequence number (u16 LE)
/// - bytes 8-9: reserved
/// - byte 10: age of the reading in seconds
/// - byte 11: reserved
/// - bytes 12-13: glucose in mg/dL (u16 LE, 0xFFFF = none, low 12 bits)
/// - byte 14: algorithm state
/// - byte 15: trend in tenths of mg/dL/min (i8, 0x7F = none)
/// - bytes 16-17: predicted glucose (same encoding as glucose)
/// - byte 18: calibration flags (0x10 = display only)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlucoseMessage {
    /// Time since activation at which the message was produced.
    pub message_timestamp: Duration,
    pub sequence: u16,
    /// How old the glucose value was when the message was produced.
    pub age: Duration,
    pub glucose: Option<u16>,
    pub predicted_glucose: Option<u16>,
    pub algorithm_state: AlgorithmState,
    /// Trend in tenths of mg/dL per minute.
    pub trend_tenths: Option<i8>,
    /// The value may be displayed but must not drive treatment decisions.
    pub display_only: bool,
    raw: Vec<u8>,
}

impl GlucoseMessage {
    /// Decode a glucose message.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnexpectedOpcode`] for a different opcode,
    /// [`ParseError::InsufficientBytes`] if `data` is shorter than
    /// [`MIN_GLUCOSE_MESSAGE_BYTES`], and [`ParseError::InvalidValue`] if the
    /// status byte is non-zero.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        check_frame(data, Opcode::Glucose, MIN_GLUCOSE_MESSAGE_BYTES)?;

        let mut buf = &data[1..];
        let status = buf.get_u8();
        if status != 0 {
            return Err(ParseError::invalid_value(format!(
                "glucose message status 0x{:02X}",
                status
            )));
        }
        let message_timestamp = seconds(buf.get_u32_le());
        let sequence = buf.get_u16_le();
        buf.advance(2);
        let age = seconds(buf.get_u8());
        buf.advance(1);
        let glucose = decode_glucose(buf.get_u16_le());
        let algorithm_state = AlgorithmState::from(buf.get_u8());
        let trend_tenths = decode_trend(buf.get_u8());
        let predicted_glucose = decode_glucose(buf.get_u16_le());
        let display_only = buf.get_u8() & DISPLAY_ONLY_FLAG != 0;

        Ok(GlucoseMessage {
            message_timestamp,
            sequence,
            age,
            glucose,
            predicted_glucose,
            algorithm_state,
            trend_tenths,
            display_only,
            raw: data.to_vec(),
        })
    }

    /// Time since activation at which the glucose value was measured.
    #[must_use]
    pub fn glucose_timestamp(&self) -> Duration {
        self.message_timestamp - self.age
    }

    /// Trend in mg/dL per minute.
    #[must_use]
    pub fn trend(&self) -> Option<f64> {
        self.trend_tenths.map(|t| f64::from(t) / 10.0)
    }

    /// The exact bytes this message was decoded from.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// Historical glucose record from the backfill channel.
///
/// The backfill characteristic carries nothing else, so records have no
/// opcode. The byte format is:
/// - bytes 0-3: timestamp, seconds since activation (u32 LE)
/// - bytes 4-5: glucose (u16 LE, 0xFFFF = none, low 12 bits)
/// - byte 6: algorithm state
/// - byte 7: flags (0x10 = display only)
/// - byte 8: trend in tenths of mg/dL/min (i8, 0x7F = none)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BackfillRecord {
    pub timestamp: Duration,
    pub glucose: Option<u16>,
    pub algorithm_state: AlgorithmState,
    pub display_only: bool,
    pub trend_tenths: Option<i8>,
}

impl BackfillRecord {
    /// Decode one backfill record.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] if `data` is shorter than
    /// [`MIN_BACKFILL_RECORD_BYTES`].
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        if data.len() < MIN_BACKFILL_RECORD_BYTES {
            return Err(ParseError::InsufficientBytes {
                expected: MIN_BACKFILL_RECORD_BYTES,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let timestamp = seconds(buf.get_u32_le());
        let glucose = decode_glucose(buf.get_u16_le());
        let algorithm_state = AlgorithmState::from(buf.get_u8());
        let display_only = buf.get_u8() & DISPLAY_ONLY_FLAG != 0;
        let trend_tenths = decode_trend(buf.get_u8());

        Ok(BackfillRecord {
            timestamp,
            glucose,
            algorithm_state,
            display_only,
            trend_tenths,
        })
    }

    /// Trend in mg/dL per minute.
    #[must_use]
    pub fn trend(&self) -> Option<f64> {
        self.trend_tenths.map(|t| f64::from(t) / 10.0)
    }
}

/// Session timing reported by the sensor, decoded once per connection.
///
/// The byte format is:
/// - byte 0: opcode (0x52)
/// - byte 1: status
/// - bytes 2-5: session length including grace period, seconds (u32 LE)
/// - bytes 6-7: warmup length, seconds (u16 LE)
/// - bytes 8-11: algorithm version (u32 LE)
/// - byte 12: hardware version
/// - bytes 13-14: grace period, hours (u16 LE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExtendedVersion {
    pub status: u8,
    pub session_length: Duration,
    pub warmup_length: Duration,
    pub algorithm_version: u32,
    pub hardware_version: u8,
    pub grace_period: Duration,
}

impl ExtendedVersion {
    /// Decode an extended version message.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnexpectedOpcode`] for a different opcode and
    /// [`ParseError::InsufficientBytes`] if `data` is shorter than
    /// [`MIN_EXTENDED_VERSION_BYTES`].
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        check_frame(data, Opcode::ExtendedVersion, MIN_EXTENDED_VERSION_BYTES)?;

        let mut buf = &data[1..];
        let status = buf.get_u8();
        let session_length = seconds(buf.get_u32_le());
        let warmup_length = seconds(buf.get_u16_le());
        let algorithm_version = buf.get_u32_le();
        let hardware_version = buf.get_u8();
        let grace_period = Duration::hours(i64::from(buf.get_u16_le()));

        Ok(ExtendedVersion {
            status,
            session_length,
            warmup_length,
            algorithm_version,
            hardware_version,
            grace_period,
        })
    }

    /// Encode back into the fixed 15 byte layout.
    ///
    /// Durations are truncated to whole seconds (grace period to whole
    /// hours) and saturate at the field width.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_EXTENDED_VERSION_BYTES);
        buf.put_u8(Opcode::ExtendedVersion as u8);
        buf.put_u8(self.status);
        buf.put_u32_le(u32_field(self.session_length.whole_seconds()));
        buf.put_u16_le(u16_field(self.warmup_length.whole_seconds()));
        buf.put_u32_le(self.algorithm_version);
        buf.put_u8(self.hardware_version);
        buf.put_u16_le(u16_field(self.grace_period.whole_hours()));
        buf
    }

    /// Usable session length, excluding the grace period.
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        if self.session_length > self.grace_period {
            self.session_length - self.grace_period
        } else {
            self.session_length
        }
    }
}

fn u32_field(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn u16_field(value: i64) -> u16 {
    u16::try_from(value.max(0)).unwrap_or(u16::MAX)
}

/// Authentication status from the authentication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AuthStatus {
    pub authenticated: bool,
    pub bonded: bool,
}

impl AuthStatus {
    /// Decode an authentication status message.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnexpectedOpcode`] for a different opcode and
    /// [`ParseError::InsufficientBytes`] if `data` is shorter than
    /// [`MIN_AUTH_STATUS_BYTES`].
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        check_frame(data, Opcode::AuthStatus, MIN_AUTH_STATUS_BYTES)?;
        Ok(AuthStatus {
            authenticated: data[1] != 0,
            bonded: data[2] != 0,
        })
    }
}

/// A decoded control channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Glucose(GlucoseMessage),
    ExtendedVersion(ExtendedVersion),
}

impl ControlMessage {
    /// Decode a control channel payload, dispatching on its opcode.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnknownOpcode`] for opcodes not carried on the
    /// control channel, or the error of the matching message decoder.
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        let Some(&first) = data.first() else {
            return Err(ParseError::InsufficientBytes {
                expected: 1,
                actual: 0,
            });
        };
        match Opcode::from_u8(first) {
            Some(Opcode::Glucose) => GlucoseMessage::from_bytes(data).map(Self::Glucose),
            Some(Opcode::ExtendedVersion) => {
                ExtendedVersion::from_bytes(data).map(Self::ExtendedVersion)
            }
            _ => Err(ParseError::UnknownOpcode(first)),
        }
    }
}

/// Requests written to the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Ask for the latest glucose message.
    Glucose,
    /// Ask for the session timing message.
    ExtendedVersion,
    /// Ask for backfill records between two offsets since activation.
    Backfill { start: Duration, end: Duration },
    /// Stop the session at an offset since activation.
    SessionStop { at: Duration },
}

impl ControlRequest {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlRequest::Glucose => Opcode::Glucose,
            ControlRequest::ExtendedVersion => Opcode::ExtendedVersion,
            ControlRequest::Backfill { .. } => Opcode::Backfill,
            ControlRequest::SessionStop { .. } => Opcode::SessionStop,
        }
    }

    /// Encode the request, opcode first.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.put_u8(self.opcode() as u8);
        match self {
            ControlRequest::Glucose | ControlRequest::ExtendedVersion => {}
            ControlRequest::Backfill { start, end } => {
                buf.put_u32_le(u32_field(start.whole_seconds()));
                buf.put_u32_le(u32_field(end.whole_seconds()));
            }
            ControlRequest::SessionStop { at } => {
                buf.put_u32_le(u32_field(at.whole_seconds()));
            }
        }
        buf
    }
}
