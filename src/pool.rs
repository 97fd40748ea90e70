//! Per-network IPv4 lease allocation for the `ipad` handshake.
//!
//! Every network draws from the same configured subnet; networks are separate
//! broadcast domains so their address spaces never meet.  The first usable
//! host address is reserved for a gateway, the rest are handed out lowest
//! free first.  A session keeps its lease until it is released.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::control::{prefix_to_mask, Lease};
use crate::error::ProtocolError;
use crate::registry::SessionId;

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub base: Ipv4Addr,
    pub prefix_len: u8,
}

impl Subnet {
    pub fn new(base: Ipv4Addr, prefix_len: u8) -> Result<Self, ProtocolError> {
        if !(1..=30).contains(&prefix_len) {
            return Err(ProtocolError::ParseError(format!(
                "prefix length {prefix_len} leaves no room for hosts"
            )));
        }
        let mask = u32::from(prefix_to_mask(prefix_len));
        Ok(Self {
            base: Ipv4Addr::from(u32::from(base) & mask),
            prefix_len,
        })
    }

    pub fn netmask(&self) -> Ipv4Addr {
        prefix_to_mask(self.prefix_len)
    }

    /// Host addresses excluding network, gateway (first host) and broadcast.
    fn assignable(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.base);
        let size = 1u32 << (32 - u32::from(self.prefix_len));
        (2..size - 1).map(move |offset| Ipv4Addr::from(base + offset))
    }
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            base: Ipv4Addr::new(10, 99, 0, 0),
            prefix_len: 24,
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lease: Lease = s.parse()?;
        Subnet::new(lease.address, lease.prefix_len)
    }
}

#[derive(Debug)]
pub struct AddressPool {
    subnet: Subnet,
    leases: HashMap<String, HashMap<SessionId, Ipv4Addr>>,
}

impl AddressPool {
    pub fn new(subnet: Subnet) -> Self {
        Self {
            subnet,
            leases: HashMap::new(),
        }
    }

    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    /// The session's existing lease, or the lowest free address.  `None`
    /// when the network's pool is exhausted.
    pub fn allocate(&mut self, network: &str, session: SessionId) -> Option<Lease> {
        let prefix_len = self.subnet.prefix_len;
        let subnet = self.subnet;
        let domain = self.leases.entry(network.to_string()).or_default();
        if let Some(&address) = domain.get(&session) {
            return Some(Lease { address, prefix_len });
        }
        let address = subnet
            .assignable()
            .find(|candidate| !domain.values().any(|taken| taken == candidate))?;
        domain.insert(session, address);
        Some(Lease { address, prefix_len })
    }

    pub fn lookup(&self, network: &str, session: SessionId) -> Option<Ipv4Addr> {
        self.leases.get(network)?.get(&session).copied()
    }

    pub fn release(&mut self, network: &str, session: SessionId) -> Option<Ipv4Addr> {
        let domain = self.leases.get_mut(network)?;
        let released = domain.remove(&session);
        if domain.is_empty() {
            self.leases.remove(network);
        }
        released
    }
}
