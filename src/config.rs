//! Tunables for the switch and the endpoint.
//!
//! Every struct has a `Default` holding the values the binary uses when a
//! flag is not given; `main.rs` maps CLI flags onto them.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::control::{Credentials, Lease, DEFAULT_NETWORK};
use crate::pool::Subnet;

/// Default switch port.
pub const DEFAULT_PORT: u16 = 7000;

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Address the switch listens on.
    pub bind: SocketAddr,
    /// Shared secret every login must present.  `None` accepts any login.
    pub secret: Option<String>,
    /// Subnet leases are drawn from, per network.
    pub subnet: Subnet,
    /// Learned MAC bindings older than this read as absent (`None` = never).
    pub mac_max_age: Option<Duration>,
    /// How often expired and dangling MAC bindings are reclaimed.
    pub sweep_interval: Duration,
    /// A connection that has not logged in by then is dropped.
    pub login_timeout: Duration,
    /// Upper bound on one send to one recipient.  A stuck recipient only
    /// costs the sender this long.
    pub send_timeout: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            secret: None,
            subnet: Subnet::default(),
            mac_max_age: Some(Duration::from_secs(300)),
            sweep_interval: Duration::from_secs(60),
            login_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Interface name, e.g. `tap0`.
    pub name: String,
    pub mtu: u32,
    /// Static address applied when the device comes up.
    pub address: Option<Lease>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "tap0".to_string(),
            mtu: 1400,
            address: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Interval between `ping_req` probes.  Zero disables keepalive.
    pub interval: Duration,
    /// Unanswered probes tolerated before the link is declared dead.
    pub max_missed: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_missed: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub device: DeviceConfig,
    /// Ask the switch for an address (`ipaddr_req`) once logged in.
    pub request_address: bool,
    pub login_timeout: Duration,
    pub keepalive: KeepaliveConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            credentials: Credentials::new("anonymous", DEFAULT_NETWORK),
            device: DeviceConfig::default(),
            request_address: false,
            login_timeout: Duration::from_secs(10),
            keepalive: KeepaliveConfig::default(),
        }
    }
}
