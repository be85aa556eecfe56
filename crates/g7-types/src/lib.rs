//! Platform-agnostic protocol types for Dexcom G7 family CGM sensors.
//!
//! This crate has no transport or runtime dependencies. It provides:
//!
//! - Decoders and encoders for the control, backfill and authentication
//!   channel payloads ([`messages`])
//! - Algorithm state classification ([`algorithm`])
//! - Sensor variant detection and lifecycle constants ([`sensor`])
//! - GATT UUIDs and channel identities ([`uuid`])
//!
//! # Example
//!
//! ```
//! use g7_types::{ExtendedVersion, SensorVariant};
//!
//! let data = [
//!     0x52, 0x00, 0xC0, 0xD7, 0x0D, 0x00, 0x54, 0x06, 0x00, 0x02, 0x04, 0x04, 0xFF, 0x0C, 0x00,
//! ];
//! let version = ExtendedVersion::from_bytes(&data).unwrap();
//! assert_eq!(version.grace_period, time::Duration::hours(12));
//!
//! assert_eq!(SensorVariant::detect("DXCM98765", false), SensorVariant::G7);
//! ```

pub mod algorithm;
pub mod error;
pub mod messages;
pub mod sensor;
pub mod uuid;

pub use algorithm::{AlgorithmState, CalibrationCategory, KnownState};
pub use error::{CalibrationError, ParseError, ParseResult};
pub use messages::{
    AuthStatus, BackfillRecord, ControlMessage, ControlRequest, ExtendedVersion, GlucoseMessage,
    Opcode,
};
pub use sensor::SensorVariant;
pub use uuid::Channel;
pub use uuid as uuids;
