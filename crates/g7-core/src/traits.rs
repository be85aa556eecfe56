//! Collaborator interface for the connection manager.
//!
//! The manager holds at most one [`ConnectionDelegate`]. Every method has a
//! default so a collaborator only implements the capabilities it cares
//! about; a manager without a delegate behaves as if every method were the
//! default (admit everything, ignore every notification).

use g7_types::Channel;

use crate::error::Result;
use crate::transport::PeripheralInfo;

/// Receives connection status, payloads and admission queries.
///
/// Methods are called from the manager's task, one at a time and in event
/// order. They must not block.
///
/// # Example
///
/// ```ignore
/// use g7_core::{ConnectionDelegate, PeripheralInfo};
///
/// struct OnlyDexcom;
///
/// impl ConnectionDelegate for OnlyDexcom {
///     fn should_connect(&self, peripheral: &PeripheralInfo) -> bool {
///         peripheral.name.as_deref().is_some_and(|n| n.starts_with("DXCM"))
///     }
/// }
/// ```
pub trait ConnectionDelegate: Send + Sync {
    /// Admission check for a discovered, restored or already connected peripheral.
    fn should_connect(&self, peripheral: &PeripheralInfo) -> bool {
        let _ = peripheral;
        true
    }

    /// The link is connected and configured, or a connection attempt failed
    /// or dropped unexpectedly.
    fn connection_ready(&self, peripheral: &PeripheralInfo, result: Result<()>) {
        let _ = (peripheral, result);
    }

    /// A payload arrived on the control, backfill or authentication channel.
    fn data_received(&self, peripheral: &PeripheralInfo, channel: Channel, data: &[u8]) {
        let _ = (peripheral, channel, data);
    }

    /// Scanning started or stopped.
    fn scanning_status_changed(&self, scanning: bool) {
        let _ = scanning;
    }
}
