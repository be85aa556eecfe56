//! Bluetooth UUIDs for Dexcom G7 family sensors.
//!
//! The sensor advertises a 16-bit service and exposes its protocol on a
//! vendor service with four characteristics. Payloads are routed by
//! [`Channel`], which maps one-to-one onto those characteristics.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::{Uuid, uuid};

// --- Service UUIDs ---

/// Service UUID carried in the sensor's advertisement packets.
pub const ADVERTISEMENT_SERVICE: Uuid = uuid!("0000febc-0000-1000-8000-00805f9b34fb");

/// Vendor CGM service that hosts the protocol characteristics.
pub const CGM_SERVICE: Uuid = uuid!("f8083532-849e-531c-c594-30f1f86a4ea5");

// --- Characteristic UUIDs ---

/// Communication characteristic.
pub const COMMUNICATION: Uuid = uuid!("f8083533-849e-531c-c594-30f1f86a4ea5");

/// Control characteristic: glucose and extended version messages, control requests.
pub const CONTROL: Uuid = uuid!("f8083534-849e-531c-c594-30f1f86a4ea5");

/// Authentication characteristic.
pub const AUTHENTICATION: Uuid = uuid!("f8083535-849e-531c-c594-30f1f86a4ea5");

/// Backfill characteristic: historical glucose records.
pub const BACKFILL: Uuid = uuid!("f8083536-849e-531c-c594-30f1f86a4ea5");

/// Services to look for when adopting a peripheral the platform already has connected.
pub const CONNECTED_PERIPHERAL_SERVICES: [Uuid; 2] = [ADVERTISEMENT_SERVICE, CGM_SERVICE];

/// Identity of the characteristic a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Channel {
    /// Glucose readings, extended version, control requests.
    Control,
    /// Historical glucose records.
    Backfill,
    /// Authentication status.
    Authentication,
    /// Raw communication; not interpreted by this library.
    Communication,
}

impl Channel {
    /// Every channel, in subscription order.
    pub const ALL: [Channel; 4] = [
        Channel::Control,
        Channel::Backfill,
        Channel::Authentication,
        Channel::Communication,
    ];

    /// The characteristic UUID for this channel.
    #[must_use]
    pub fn uuid(self) -> Uuid {
        match self {
            Channel::Control => CONTROL,
            Channel::Backfill => BACKFILL,
            Channel::Authentication => AUTHENTICATION,
            Channel::Communication => COMMUNICATION,
        }
    }

    /// Look up the channel for a characteristic UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|channel| channel.uuid() == uuid)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Control => "control",
            Channel::Backfill => "backfill",
            Channel::Authentication => "authentication",
            Channel::Communication => "communication",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_uuid_lookup() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_uuid(channel.uuid()), Some(channel));
        }
        assert_eq!(Channel::from_uuid(CGM_SERVICE), None);
        assert_eq!(Channel::from_uuid(ADVERTISEMENT_SERVICE), None);
    }

    #[test]
    fn test_characteristics_share_vendor_base() {
        for channel in Channel::ALL {
            let text = channel.uuid().to_string();
            assert!(text.ends_with("-849e-531c-c594-30f1f86a4ea5"), "{text}");
        }
    }
}
