//! Ethernet header parsing and destination classification.
//!
//! Everything here works on borrowed slices and `Copy` values; the switch
//! calls it once per forwarded frame.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Ethernet header size: dst(6) + src(6) + ether_type(2).
pub const HEADER_LEN: usize = 14;

/// Common `ether_type` values.
pub mod ether_type {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const VLAN: u16 = 0x8100;
    pub const IPV6: u16 = 0x86DD;
}

/// A raw 48-bit MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const ZERO: MacAddr = MacAddr([0x00; 6]);

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(MacAddr(arr))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit (I/G) set.  Broadcast is also multicast.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

impl FromStr for MacAddr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ProtocolError::ParseError(format!("bad MAC address {s:?}"));
        let mut mac = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in mac.iter_mut() {
            let part = parts.next().ok_or_else(bad)?;
            if part.len() != 2 {
                return Err(bad());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| bad())?;
        }
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(MacAddr(mac))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtherHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ether_type: u16,
}

impl EtherHeader {
    /// Parse the first [`HEADER_LEN`] bytes of `bytes`; `None` if shorter.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            dst: MacAddr::from_slice(&bytes[0..6])?,
            src: MacAddr::from_slice(&bytes[6..12])?,
            ether_type: u16::from_be_bytes([bytes[12], bytes[13]]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::BufferTooSmall { required: HEADER_LEN });
        }
        buf[0..6].copy_from_slice(&self.dst.0);
        buf[6..12].copy_from_slice(&self.src.0);
        buf[12..14].copy_from_slice(&self.ether_type.to_be_bytes());
        Ok(())
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst.is_broadcast()
    }

    pub fn is_multicast(&self) -> bool {
        self.dst.is_multicast()
    }
}
