//! Ethernet (MAC) addresses.

use super::InvalidArgument;
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet address, canonically `ab:cd:ef:12:34:56`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EthernetAddress(pub [u8; 6]);

impl EthernetAddress {
    /// The broadcast address `ff:ff:ff:ff:ff:ff`
    pub const BROADCAST: Self = Self([0xFF; 6]);

    /// Raw octets
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether this is the broadcast address
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Whether the group bit is set (multicast or broadcast)
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Whether this is a unicast address
    #[must_use]
    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }
}

impl FromStr for EthernetAddress {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidArgument::new("EthernetAddress", s);
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let addr: EthernetAddress = "ab:cd:ef:12:34:56".parse().unwrap();
        assert_eq!(addr.octets(), [0xAB, 0xCD, 0xEF, 0x12, 0x34, 0x56]);
        assert_eq!(addr.to_string(), "ab:cd:ef:12:34:56");
    }

    #[test]
    fn test_roundtrip_uppercase_input() {
        let addr: EthernetAddress = "AB:CD:EF:12:34:56".parse().unwrap();
        assert_eq!(addr.to_string(), "ab:cd:ef:12:34:56");
    }

    #[test]
    fn test_invalid_inputs() {
        for input in [
            "",
            "ab:cd:ef:12:34",
            "ab:cd:ef:12:34:56:78",
            "ab:cd:ef:12:34:5",
            "ab:cd:ef:12:34:5g",
            "abcdef123456",
            "ab-cd-ef-12-34-56",
        ] {
            assert!(input.parse::<EthernetAddress>().is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn test_classification() {
        let unicast: EthernetAddress = "02:00:00:00:00:01".parse().unwrap();
        assert!(unicast.is_unicast());
        assert!(!unicast.is_multicast());

        let multicast: EthernetAddress = "01:00:5e:00:00:01".parse().unwrap();
        assert!(multicast.is_multicast());
        assert!(!multicast.is_unicast());

        assert!(EthernetAddress::BROADCAST.is_broadcast());
        assert!(EthernetAddress::BROADCAST.is_multicast());
    }
}
