//! Sensor product variants and their lifecycle constants.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::Duration;

/// Product variant of a G7-family sensor.
///
/// Serialized with the tag strings used in persisted session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SensorVariant {
    /// Dexcom G7, 10 day session.
    #[cfg_attr(feature = "serde", serde(rename = "G7"))]
    G7,
    /// Dexcom G7 with the 15 day session option.
    #[cfg_attr(feature = "serde", serde(rename = "G7 Extended"))]
    G7Extended,
    /// Dexcom ONE+.
    #[cfg_attr(feature = "serde", serde(rename = "ONE+"))]
    OnePlus,
    /// Dexcom Stelo.
    #[cfg_attr(feature = "serde", serde(rename = "Stelo"))]
    Stelo,
    /// Unrecognized name prefix.
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "Unknown"))]
    Unknown,
}

impl SensorVariant {
    /// Classify a sensor from its advertised name.
    ///
    /// Matching is a case-insensitive prefix check. `fifteen_day` is the
    /// explicitly reported extended-session flag; it only upgrades a base G7.
    ///
    /// # Examples
    ///
    /// ```
    /// use g7_types::SensorVariant;
    ///
    /// assert_eq!(SensorVariant::detect("DX0212345", false), SensorVariant::OnePlus);
    /// assert_eq!(SensorVariant::detect("DXCM98765", false), SensorVariant::G7);
    /// assert_eq!(SensorVariant::detect("DXCM98765", true), SensorVariant::G7Extended);
    /// assert_eq!(SensorVariant::detect("dx01abcd", false), SensorVariant::Stelo);
    /// assert_eq!(SensorVariant::detect("Polar H10 1234", false), SensorVariant::Unknown);
    /// ```
    #[must_use]
    pub fn detect(name: &str, fifteen_day: bool) -> Self {
        Self::from_name(name).with_fifteen_day(fifteen_day)
    }

    /// Prefix-only classification.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.starts_with("DXCM") {
            SensorVariant::G7
        } else if upper.starts_with("DX01") {
            SensorVariant::Stelo
        } else if upper.starts_with("DX02") {
            SensorVariant::OnePlus
        } else {
            SensorVariant::Unknown
        }
    }

    /// Apply the extended-session flag to a prefix classification.
    #[must_use]
    pub fn with_fifteen_day(self, fifteen_day: bool) -> Self {
        match self {
            SensorVariant::G7 if fifteen_day => SensorVariant::G7Extended,
            other => other,
        }
    }

    /// Whether a name carries one of the known sensor prefixes.
    #[must_use]
    pub fn is_sensor_name(name: &str) -> bool {
        Self::from_name(name) != SensorVariant::Unknown
    }

    /// Nominal session length, excluding the grace period.
    #[must_use]
    pub fn lifetime(self) -> Duration {
        match self {
            SensorVariant::G7Extended | SensorVariant::Stelo => Duration::days(15),
            SensorVariant::G7 | SensorVariant::OnePlus | SensorVariant::Unknown => {
                Duration::days(10)
            }
        }
    }

    #[must_use]
    pub fn warmup(self) -> Duration {
        match self {
            SensorVariant::G7Extended => Duration::minutes(60),
            _ => Duration::minutes(25),
        }
    }

    /// Extra time after the nominal lifetime during which the sensor keeps working.
    #[must_use]
    pub fn grace_period(self) -> Duration {
        Duration::hours(12)
    }

    /// Lifetime plus grace period.
    #[must_use]
    pub fn total_lifetime(self) -> Duration {
        self.lifetime() + self.grace_period()
    }

    /// Tag string used in persisted state.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            SensorVariant::G7 => "G7",
            SensorVariant::G7Extended => "G7 Extended",
            SensorVariant::OnePlus => "ONE+",
            SensorVariant::Stelo => "Stelo",
            SensorVariant::Unknown => "Unknown",
        }
    }

    /// Parse a persisted tag string.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        [
            SensorVariant::G7,
            SensorVariant::G7Extended,
            SensorVariant::OnePlus,
            SensorVariant::Stelo,
            SensorVariant::Unknown,
        ]
        .into_iter()
        .find(|variant| variant.tag() == tag)
    }

    /// Product name for display.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            SensorVariant::G7 => "Dexcom G7",
            SensorVariant::G7Extended => "Dexcom G7 Extended",
            SensorVariant::OnePlus => "Dexcom ONE+",
            SensorVariant::Stelo => "Dexcom Stelo",
            SensorVariant::Unknown => "Unknown Sensor",
        }
    }
}

impl fmt::Display for SensorVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
