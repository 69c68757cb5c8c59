//! Locally administered MAC addresses for container interfaces.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use skiff_common::SkiffError;

/// A 48-bit Ethernet address, serialized as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// The broadcast address.
    pub const BROADCAST: Self = Self([0xff; 6]);

    /// Wrap raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Generate a random unicast, locally administered address whose first
    /// two octets come from `prefix`.
    #[must_use]
    pub fn generate(prefix: [u8; 2]) -> Self {
        let suffix: [u8; 4] = rand::random();
        let first = (prefix[0] & 0xfe) | 0x02;
        Self([first, prefix[1], suffix[0], suffix[1], suffix[2], suffix[3]])
    }

    /// Raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether the locally administered bit is set.
    #[must_use]
    pub const fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Whether the group bit is set (multicast or broadcast).
    #[must_use]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SkiffError::InvalidRequest {
            message: format!("invalid MAC address '{s}'"),
        };
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

impl TryFrom<String> for MacAddress {
    type Error = SkiffError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_addresses_are_local_unicast() {
        for _ in 0..64 {
            let mac = MacAddress::generate([0x03, 0x42]);
            assert!(mac.is_locally_administered());
            assert!(!mac.is_multicast());
            assert_eq!(mac.octets()[1], 0x42);
        }
    }

    #[test]
    fn parse_and_display() {
        let mac: MacAddress = "02:42:ac:1e:00:02".parse().unwrap();
        assert_eq!(mac.octets(), [0x02, 0x42, 0xac, 0x1e, 0x00, 0x02]);
        assert_eq!(mac.to_string(), "02:42:ac:1e:00:02");
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for bad in ["", "02:42:ac:1e:00", "02:42:ac:1e:00:02:03", "0242ac1e0002", "zz:42:ac:1e:00:02"] {
            assert!(bad.parse::<MacAddress>().is_err(), "{bad}");
        }
    }

    #[test]
    fn serde_uses_colon_notation() {
        let mac = MacAddress::new([2, 0x42, 0, 0, 0, 1]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"02:42:00:00:00:01\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }
}
