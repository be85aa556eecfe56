//! Connection management and session tracking for Dexcom G7 family CGM sensors.
//!
//! This crate keeps one Bluetooth Low Energy link to one paired sensor alive,
//! decodes what the sensor sends over it, and tracks the sensor's session
//! from warmup to expiration.
//!
//! # Features
//!
//! - **Connection management**: a single worker task serializes every radio
//!   operation; dropped links are rescanned after a short fixed delay
//! - **Admission control**: only the paired sensor (or, before pairing, a
//!   peripheral with a known sensor name) is connected to
//! - **Session tracking**: readings are deduplicated by sequence number,
//!   backfill is delivered once, failures freeze lifecycle progress
//! - **Lifecycle queries**: warmup, expiration, grace period and progress as
//!   of any instant, computed on demand
//! - **Persistence**: session state survives restarts as a JSON file
//!
//! # Supported Sensors
//!
//! | Sensor | Name prefix | Lifetime | Warmup |
//! |--------|-------------|----------|--------|
//! | Dexcom G7 | `DXCM` | 10 days | 25 min |
//! | Dexcom G7 (15 day) | `DXCM` | 15 days | 60 min |
//! | Dexcom ONE+ | `DX02` | 10 days | 25 min |
//! | Dexcom Stelo | `DX01` | 15 days | 25 min |
//!
//! Every sensor keeps working for a 12 hour grace period after its lifetime.
//!
//! # Architecture
//!
//! ```text
//!  Transport ──events──▶ ConnectionManager ──delegate──▶ SensorSession ──▶ SessionEvent
//!  (btleplug / mock)      (worker task)                  (SessionState)     (broadcast)
//! ```
//!
//! The radio sits behind the [`Transport`] trait. [`BtleplugTransport`] drives
//! a real adapter and [`MockTransport`] replaces it in tests.
//!
//! # Quick Start
//!
//! ```no_run
//! use g7_core::{BtleplugTransport, Config, SensorMonitor, SessionState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let (transport, events) = BtleplugTransport::new(64).await?;
//!     let monitor = SensorMonitor::start(transport, events, SessionState::new(), &config).await?;
//!
//!     let mut rx = monitor.subscribe();
//!     while let Ok(event) = rx.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod mock;
pub mod monitor;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod traits;
pub mod transport;
pub mod util;

pub use ble::BtleplugTransport;
pub use config::{Config, ConfigError, ConnectionConfig, SessionConfig, ValidationError};
pub use error::{ConnectionFailureReason, DisconnectReason, Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, SensorId, SessionEvent};
pub use lifecycle::{
    LifecycleCalculator, LifecyclePhase, LifecycleProgress, LifecycleReport, LifecycleState,
    SessionTiming,
};
pub use manager::{ConnectionManager, ConnectionState};
pub use mock::{MockTransport, TransportCall};
pub use monitor::SensorMonitor;
pub use reconnect::RescanScheduler;
pub use session::SensorSession;
pub use state::{PersistedState, ReadingOutcome, SessionState};
pub use traits::ConnectionDelegate;
pub use transport::{
    Advertisement, PeripheralId, PeripheralInfo, PowerState, Transport, TransportEvent,
};
pub use util::{Locked, format_peripheral_id};

// Re-export the protocol types
pub use g7_types::uuid as uuids;
pub use g7_types::{
    AlgorithmState, AuthStatus, BackfillRecord, CalibrationCategory, CalibrationError, Channel,
    ControlMessage, ControlRequest, ExtendedVersion, GlucoseMessage, ParseError, SensorVariant,
};
