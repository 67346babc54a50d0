use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Decode the wire integer form of an IPv4 address. The low byte carries the
/// first octet, and 0 stands for "no address".
pub fn ipv4_from_wire(raw: u32) -> Option<Ipv4Addr> {
    if raw == 0 {
        None
    } else {
        Some(Ipv4Addr::from(raw.to_le_bytes()))
    }
}

/// Encode an IPv4 address into its wire integer form.
pub fn ipv4_to_wire(addr: Ipv4Addr) -> u32 {
    u32::from_le_bytes(addr.octets())
}

/// A 48-bit hardware address in its canonical colon-hex spelling.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Accepts exactly six bytes, anything else is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid mac address: {0}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| MacParseError(s.into()))?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.into()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.into()));
        }
        Ok(Self(octets))
    }
}
