//! The static table of sensors the bridge connects to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use spinbridge_types::{Characteristic, Metric};

use crate::error::{Error, Result};

/// A Bluetooth device address, normalized to 12 lower-case hex digits with no
/// separators.
///
/// Parsing accepts `:`/`-` separated or bare forms in either case, so
/// `B8:27:EB:95:0B:90`, `b8-27-eb-95-0b-90` and `B827EB950B90` are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    /// Parse and normalize an address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] unless the input holds exactly 12 hex
    /// digits once separators are removed.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized: String = input
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        if normalized.len() != 12 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::invalid_config(format!(
                "invalid MAC address '{}'",
                input
            )));
        }
        Ok(Self(normalized))
    }

    /// The normalized form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Colon-separated upper-case form, as printed by BlueZ.
    pub fn to_colon_string(&self) -> String {
        self.0
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).to_ascii_uppercase())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_colon_string())
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.0
    }
}

/// A sensor the bridge should keep connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    /// Display name used in logs and events.
    pub name: String,
    /// Device address.
    pub address: MacAddress,
    /// Measurement characteristics to subscribe to.
    pub characteristics: Vec<Characteristic>,
}

impl KnownDevice {
    /// Create a known device.
    pub fn new(
        name: impl Into<String>,
        address: MacAddress,
        characteristics: impl IntoIterator<Item = Characteristic>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    /// Whether this device feeds the given characteristic.
    pub fn handles(&self, characteristic: Characteristic) -> bool {
        self.characteristics.contains(&characteristic)
    }

    /// Snapshot metrics owned by this device.
    pub fn metrics(&self) -> impl Iterator<Item = Metric> + '_ {
        self.characteristics.iter().map(|c| c.metric())
    }
}

/// The two sensors of the reference installation: a Gymnasticon bike bridge
/// (power and cadence) and a COROS PACE 3 watch (heart rate).
pub fn default_devices() -> Vec<KnownDevice> {
    vec![
        KnownDevice {
            name: "Gymnasticon".to_string(),
            address: MacAddress("b827eb950b90".to_string()),
            characteristics: vec![Characteristic::CyclingPower, Characteristic::Csc],
        },
        KnownDevice {
            name: "COROS PACE 3".to_string(),
            address: MacAddress("f7af40380890".to_string()),
            characteristics: vec![Characteristic::HeartRate],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_normalization() {
        let a = MacAddress::parse("B8:27:EB:95:0B:90").unwrap();
        let b = MacAddress::parse("b8-27-eb-95-0b-90").unwrap();
        let c = MacAddress::parse(" B827EB950B90 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.as_str(), "b827eb950b90");
        assert_eq!(a.to_string(), "B8:27:EB:95:0B:90");
    }

    #[test]
    fn test_mac_rejects_bad_input() {
        assert!(MacAddress::parse("").is_err());
        assert!(MacAddress::parse("B8:27:EB:95:0B").is_err());
        assert!(MacAddress::parse("B8:27:EB:95:0B:90:11").is_err());
        assert!(MacAddress::parse("ZZ:27:EB:95:0B:90").is_err());
    }

    #[test]
    fn test_mac_serde_roundtrip_normalizes() {
        let mac: MacAddress = serde_json::from_str(r#""F7:AF:40:38:08:90""#).unwrap();
        assert_eq!(mac.as_str(), "f7af40380890");
        assert_eq!(serde_json::to_string(&mac).unwrap(), r#""f7af40380890""#);
        assert!(serde_json::from_str::<MacAddress>(r#""nope""#).is_err());
    }

    #[test]
    fn test_default_devices() {
        let devices = default_devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(
            devices[0].address,
            MacAddress::parse("B8:27:EB:95:0B:90").unwrap()
        );
        assert!(devices[0].handles(Characteristic::CyclingPower));
        assert!(devices[0].handles(Characteristic::Csc));
        assert!(!devices[0].handles(Characteristic::HeartRate));
        assert_eq!(
            devices[1].metrics().collect::<Vec<_>>(),
            vec![Metric::HeartRate]
        );
    }
}
