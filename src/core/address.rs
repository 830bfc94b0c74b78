//! Client addresses accepted for tickets and list entries
//!
//! An [`Address`] is a closed set of formats: IPv4, IPv6 or Ethernet (MAC).
//! Parsing is by format only; nothing checks that the address is reachable.
//! Once parsed, every format is handled the same way downstream and is
//! rendered in a canonical text form so that `AA-BB-CC-DD-EE-FF` and
//! `aa:bb:cc:dd:ee:ff` refer to the same ticket and the same set element.

use crate::core::error::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family, one per nftables set type.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Family {
    #[strum(serialize = "ether")]
    Ether,
    #[strum(serialize = "ipv4")]
    Ipv4,
    #[strum(serialize = "ipv6")]
    Ipv6,
}

impl Family {
    /// nftables set element type for this family
    pub const fn nft_type(self) -> &'static str {
        match self {
            Family::Ether => "ether_addr",
            Family::Ipv4 => "ipv4_addr",
            Family::Ipv6 => "ipv6_addr",
        }
    }
}

/// 48-bit Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = Error;

    /// Accepts six two-digit hex groups separated uniformly by `:` or `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress(s.to_string());

        let sep = if s.contains(':') { ':' } else { '-' };
        let mut octets = [0u8; 6];
        let mut count = 0;

        for part in s.split(sep) {
            if count == 6 || part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            octets[count] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
            count += 1;
        }

        if count == 6 {
            Ok(MacAddr(octets))
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// A validated client address.
///
/// Ordering is by family first, then by value, which keeps ticket listings
/// and persisted state stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    Ether(MacAddr),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl Address {
    pub const fn family(&self) -> Family {
        match self {
            Address::Ether(_) => Family::Ether,
            Address::Ipv4(_) => Family::Ipv4,
            Address::Ipv6(_) => Family::Ipv6,
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress("address is empty".to_string()));
        }

        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(ip.into());
        }

        s.parse::<MacAddr>()
            .map(Address::Ether)
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ether(mac) => mac.fmt(f),
            Address::Ipv4(ip) => ip.fmt(f),
            Address::Ipv6(ip) => ip.fmt(f),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
