//! Control sub-protocol carried inside frame payloads.
//!
//! A control payload starts with a fixed 6-byte ASCII prefix: four lowercase
//! letters naming the command, a sigil (`=` request, `:` response) and one
//! space.  Everything after the prefix is opaque command data.
//!
//! ```text
//!  0   1   2   3   4   5   6 ...
//! +---+---+---+---+---+---+-------------+
//! | l | o | g | i | = |   | data ...    |
//! +---+---+---+---+---+---+-------------+
//! ```
//!
//! The sigil offset is what [`crate::frame::is_control`] keys on, so it is
//! exported as [`SIGIL_OFFSET`].
//!
//! The typed bodies used by the login, address and neighbor handshakes
//! ([`Credentials`], [`LoginReply`], [`Lease`], [`Neighbor`]) are plain UTF-8
//! text and are encoded/parsed here as well.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Length of every command prefix.
pub const PREFIX_LEN: usize = 6;

/// Offset of the request/response sigil inside the prefix.
pub const SIGIL_OFFSET: usize = 4;

/// Network used when a login does not name one.
pub const DEFAULT_NETWORK: &str = "default";

const LOGIN_REQ: &[u8; PREFIX_LEN] = b"logi= ";
const LOGIN_RESP: &[u8; PREFIX_LEN] = b"logi: ";
const NEIGHBOR_REQ: &[u8; PREFIX_LEN] = b"neig= ";
const NEIGHBOR_RESP: &[u8; PREFIX_LEN] = b"neig: ";
const IPADDR_REQ: &[u8; PREFIX_LEN] = b"ipad= ";
const IPADDR_RESP: &[u8; PREFIX_LEN] = b"ipad: ";
const PING_REQ: &[u8; PREFIX_LEN] = b"ping= ";
const PONG_RESP: &[u8; PREFIX_LEN] = b"pong: ";
const LEFT_REQ: &[u8; PREFIX_LEN] = b"left= ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    LoginReq,
    LoginResp,
    NeighborReq,
    NeighborResp,
    IpaddrReq,
    IpaddrResp,
    PingReq,
    PongResp,
    LeftReq,
}

impl ControlCommand {
    pub const ALL: [ControlCommand; 9] = [
        ControlCommand::LoginReq,
        ControlCommand::LoginResp,
        ControlCommand::NeighborReq,
        ControlCommand::NeighborResp,
        ControlCommand::IpaddrReq,
        ControlCommand::IpaddrResp,
        ControlCommand::PingReq,
        ControlCommand::PongResp,
        ControlCommand::LeftReq,
    ];

    pub fn prefix(self) -> &'static [u8; PREFIX_LEN] {
        match self {
            ControlCommand::LoginReq => LOGIN_REQ,
            ControlCommand::LoginResp => LOGIN_RESP,
            ControlCommand::NeighborReq => NEIGHBOR_REQ,
            ControlCommand::NeighborResp => NEIGHBOR_RESP,
            ControlCommand::IpaddrReq => IPADDR_REQ,
            ControlCommand::IpaddrResp => IPADDR_RESP,
            ControlCommand::PingReq => PING_REQ,
            ControlCommand::PongResp => PONG_RESP,
            ControlCommand::LeftReq => LEFT_REQ,
        }
    }

    pub fn from_prefix(prefix: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.prefix().as_slice() == prefix)
    }

    pub fn is_request(self) -> bool {
        self.prefix()[SIGIL_OFFSET] == b'='
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // "logi=" / "pong:" without the trailing space.
        let p = self.prefix();
        f.write_str(std::str::from_utf8(&p[..PREFIX_LEN - 1]).unwrap_or("????"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub command: ControlCommand,
    pub data: Vec<u8>,
}

/// Concatenate the command prefix and `data`.
pub fn encode(command: ControlCommand, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PREFIX_LEN + data.len());
    buf.extend_from_slice(command.prefix());
    buf.extend_from_slice(data);
    buf
}

/// Write prefix + `data` into `buf`, returning the number of bytes written.
pub fn encode_into(
    command: ControlCommand,
    data: &[u8],
    buf: &mut [u8],
) -> Result<usize, ProtocolError> {
    let required = PREFIX_LEN + data.len();
    if buf.len() < required {
        return Err(ProtocolError::EncodeError {
            required,
            available: buf.len(),
        });
    }
    buf[..PREFIX_LEN].copy_from_slice(command.prefix());
    buf[PREFIX_LEN..required].copy_from_slice(data);
    Ok(required)
}

pub fn decode(payload: &[u8]) -> Result<ControlMessage, ProtocolError> {
    if payload.len() < PREFIX_LEN {
        return Err(ProtocolError::ParseError(format!(
            "control payload of {} bytes is shorter than a prefix",
            payload.len()
        )));
    }
    let command = ControlCommand::from_prefix(&payload[..PREFIX_LEN]).ok_or_else(|| {
        ProtocolError::ParseError(format!(
            "unknown control prefix {:?}",
            String::from_utf8_lossy(&payload[..PREFIX_LEN])
        ))
    })?;
    Ok(ControlMessage {
        command,
        data: payload[PREFIX_LEN..].to_vec(),
    })
}

// ---------------------------------------------------------------------------
// Typed bodies
// ---------------------------------------------------------------------------

/// Login body: `"<username> <network> [<secret>]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub network: String,
    pub secret: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            network: network.into(),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = format!("{} {}", self.username, self.network);
        if let Some(secret) = &self.secret {
            s.push(' ');
            s.push_str(secret);
        }
        s.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ProtocolError::ParseError("credentials are not UTF-8".into()))?;
        let mut parts = text.split_whitespace();
        let username = parts
            .next()
            .ok_or_else(|| ProtocolError::ParseError("missing username".into()))?;
        let network = parts.next().unwrap_or(DEFAULT_NETWORK);
        let secret = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(ProtocolError::ParseError("trailing fields in credentials".into()));
        }
        Ok(Self {
            username: username.to_string(),
            network: network.to_string(),
            secret,
        })
    }
}

/// Body of a `login_resp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginReply {
    Accepted { session: u64, network: String },
    Rejected(String),
}

impl LoginReply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            LoginReply::Accepted { session, network } => format!("ok {session} {network}"),
            LoginReply::Rejected(reason) => format!("err {reason}"),
        }
        .into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ProtocolError::ParseError("login reply is not UTF-8".into()))?;
        if let Some(reason) = text.strip_prefix("err") {
            return Ok(LoginReply::Rejected(reason.trim().to_string()));
        }
        let mut parts = text.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("ok"), Some(id), Some(network)) => {
                let session = id
                    .parse()
                    .map_err(|_| ProtocolError::ParseError(format!("bad session id {id:?}")))?;
                Ok(LoginReply::Accepted {
                    session,
                    network: network.to_string(),
                })
            }
            _ => Err(ProtocolError::ParseError(format!("bad login reply {text:?}"))),
        }
    }
}

/// An address handed out in an `ipaddr_resp`: `"<ipv4>/<prefix-len>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl Lease {
    /// Dotted netmask for the prefix length.
    pub fn netmask(&self) -> Ipv4Addr {
        prefix_to_mask(self.prefix_len)
    }

    /// Encode a lease, or `"none"` when no address was available.
    pub fn encode(lease: Option<Lease>) -> Vec<u8> {
        match lease {
            Some(l) => l.to_string().into_bytes(),
            None => b"none".to_vec(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ProtocolError::ParseError("lease is not UTF-8".into()))?
            .trim();
        if text == "none" {
            return Ok(None);
        }
        text.parse().map(Some)
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Lease {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ProtocolError::ParseError(format!("bad address {s:?}"));
        let (addr, len) = s.split_once('/').ok_or_else(bad)?;
        let address = addr.parse().map_err(|_| bad())?;
        let prefix_len: u8 = len.parse().map_err(|_| bad())?;
        if prefix_len > 32 {
            return Err(bad());
        }
        Ok(Lease { address, prefix_len })
    }
}

pub fn prefix_to_mask(prefix_len: u8) -> Ipv4Addr {
    let bits = match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - n),
    };
    Ipv4Addr::from(bits)
}

/// One line of a `neighbor_resp`: `"<session-id> <username> <ipv4|->"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub session: u64,
    pub username: String,
    pub address: Option<Ipv4Addr>,
}

impl Neighbor {
    pub fn encode_list(neighbors: &[Neighbor]) -> Vec<u8> {
        neighbors
            .iter()
            .map(|n| match n.address {
                Some(a) => format!("{} {} {}", n.session, n.username, a),
                None => format!("{} {} -", n.session, n.username),
            })
            .collect::<Vec<_>>()
            .join("\n")
            .into_bytes()
    }

    pub fn parse_list(data: &[u8]) -> Result<Vec<Neighbor>, ProtocolError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ProtocolError::ParseError("neighbor list is not UTF-8".into()))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let bad = || ProtocolError::ParseError(format!("bad neighbor line {line:?}"));
                let mut parts = line.split_whitespace();
                let session = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
                let username = parts.next().ok_or_else(bad)?.to_string();
                let address = match parts.next().ok_or_else(bad)? {
                    "-" => None,
                    a => Some(a.parse().map_err(|_| bad())?),
                };
                Ok(Neighbor { session, username, address })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_roundtrips() {
        for command in ControlCommand::ALL {
            let data = format!("payload for {command}").into_bytes();
            let msg = decode(&encode(command, &data)).unwrap();
            assert_eq!(msg.command, command);
            assert_eq!(msg.data, data);
        }
    }

    #[test]
    fn prefixes_are_literal() {
        let wire: Vec<&[u8; PREFIX_LEN]> = ControlCommand::ALL.iter().map(|c| c.prefix()).collect();
        assert_eq!(
            wire,
            vec![
                b"logi= ",
                b"logi: ",
                b"neig= ",
                b"neig: ",
                b"ipad= ",
                b"ipad: ",
                b"ping= ",
                b"pong: ",
                b"left= ",
            ]
        );
    }

    #[test]
    fn every_prefix_is_seen_as_control() {
        for command in ControlCommand::ALL {
            assert!(crate::frame::is_control(command.prefix()));
        }
    }

    #[test]
    fn bare_prefix_has_empty_data() {
        let msg = decode(b"ping= ").unwrap();
        assert_eq!(msg.command, ControlCommand::PingReq);
        assert!(msg.data.is_empty());
    }

    #[test]
    fn short_or_unknown_prefix_is_parse_error() {
        assert!(matches!(decode(b"ping="), Err(ProtocolError::ParseError(_))));
        assert!(matches!(decode(b"xxxx= data"), Err(ProtocolError::ParseError(_))));
        // Sigil flipped: "pong=" is not in the table.
        assert!(matches!(decode(b"pong= "), Err(ProtocolError::ParseError(_))));
        // Missing the trailing space.
        assert!(matches!(decode(b"logi=xyz"), Err(ProtocolError::ParseError(_))));
    }

    #[test]
    fn encode_into_checks_capacity() {
        let mut small = [0u8; 7];
        assert_eq!(
            encode_into(ControlCommand::PingReq, b"ab", &mut small),
            Err(ProtocolError::EncodeError { required: 8, available: 7 })
        );
        let mut buf = [0u8; 8];
        assert_eq!(encode_into(ControlCommand::PingReq, b"ab", &mut buf), Ok(8));
        assert_eq!(&buf, b"ping= ab");
    }

    #[test]
    fn request_sigil() {
        assert!(ControlCommand::LoginReq.is_request());
        assert!(ControlCommand::LeftReq.is_request());
        assert!(!ControlCommand::PongResp.is_request());
        assert!(!ControlCommand::IpaddrResp.is_request());
    }

    #[test]
    fn credentials_parse() {
        let c = Credentials::parse(b"alice lab s3cret").unwrap();
        assert_eq!(c, Credentials::new("alice", "lab").with_secret("s3cret"));

        let c = Credentials::parse(b"bob").unwrap();
        assert_eq!(c.network, DEFAULT_NETWORK);
        assert_eq!(c.secret, None);

        assert!(Credentials::parse(b"   ").is_err());
        assert!(Credentials::parse(b"a b c d").is_err());

        let c = Credentials::new("carol", "default").with_secret("x");
        assert_eq!(Credentials::parse(&c.encode()).unwrap(), c);
    }

    #[test]
    fn login_reply_parse() {
        assert_eq!(
            LoginReply::parse(b"ok 7 default").unwrap(),
            LoginReply::Accepted { session: 7, network: "default".into() }
        );
        assert_eq!(
            LoginReply::parse(b"err bad secret").unwrap(),
            LoginReply::Rejected("bad secret".into())
        );
        assert!(LoginReply::parse(b"ok seven default").is_err());
        assert!(LoginReply::parse(b"maybe").is_err());
    }

    #[test]
    fn lease_parse() {
        let lease = Lease::parse(b"10.99.0.2/24").unwrap().unwrap();
        assert_eq!(lease.address, Ipv4Addr::new(10, 99, 0, 2));
        assert_eq!(lease.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(Lease::parse(b"none").unwrap(), None);
        assert!(Lease::parse(b"10.0.0.1/33").is_err());
        assert!(Lease::parse(b"10.0.0.1").is_err());
    }

    #[test]
    fn neighbor_list_roundtrip() {
        let list = vec![
            Neighbor { session: 1, username: "a".into(), address: Some(Ipv4Addr::new(10, 0, 0, 2)) },
            Neighbor { session: 4, username: "b".into(), address: None },
        ];
        assert_eq!(Neighbor::parse_list(&Neighbor::encode_list(&list)).unwrap(), list);
        assert!(Neighbor::parse_list(b"").unwrap().is_empty());
        assert!(Neighbor::parse_list(b"x a -").is_err());
    }

    #[test]
    fn masks() {
        assert_eq!(prefix_to_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_mask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));
    }
}
