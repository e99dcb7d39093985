//! Composite network addresses
//!
//! An [`Address`] is a sequence of protocol components written as
//! `/ip4/127.0.0.1/tcp/4001/p2p/<peer-id>`. Parsing is strict: exactly one
//! host component which comes first, a transport component, an optional
//! `quic-v1` marker after `udp`, and at most one trailing `p2p` component.
//!
//! ```
//! use kadlink_core::Address;
//!
//! let addr: Address = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
//! assert_eq!(addr.to_string(), "/ip4/10.0.0.1/tcp/4001");
//! assert!(addr.peer_id().is_none());
//! assert_eq!(addr.socket_addr(), Some("10.0.0.1:4001".parse().unwrap()));
//! ```

use crate::error::{NetworkError, Result};
use crate::identity::PeerId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Longest DNS name accepted in a `dns` component
const MAX_DNS_NAME_LEN: usize = 253;

/// One component of an [`Address`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// IPv4 host
    Ip4(Ipv4Addr),
    /// IPv6 host
    Ip6(Ipv6Addr),
    /// DNS host name
    Dns(String),
    /// TCP port
    Tcp(u16),
    /// UDP port
    Udp(u16),
    /// QUIC v1 over the preceding UDP port
    QuicV1,
    /// Peer identity
    P2p(PeerId),
}

impl Protocol {
    fn is_host(&self) -> bool {
        matches!(self, Protocol::Ip4(_) | Protocol::Ip6(_) | Protocol::Dns(_))
    }

    fn is_port(&self) -> bool {
        matches!(self, Protocol::Tcp(_) | Protocol::Udp(_))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Protocol::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Protocol::Dns(name) => write!(f, "/dns/{name}"),
            Protocol::Tcp(port) => write!(f, "/tcp/{port}"),
            Protocol::Udp(port) => write!(f, "/udp/{port}"),
            Protocol::QuicV1 => f.write_str("/quic-v1"),
            Protocol::P2p(peer) => write!(f, "/p2p/{peer}"),
        }
    }
}

/// Composite address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    components: Vec<Protocol>,
}

impl Address {
    /// Parse the canonical string form
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::AddressParse`] on unknown components, bad values,
    /// or components out of order.
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix('/')
            .ok_or_else(|| NetworkError::address("address must start with '/'"))?;
        let mut parts = rest.split('/');
        let mut components = Vec::new();

        while let Some(name) = parts.next() {
            if name.is_empty() {
                return Err(NetworkError::address("empty address component"));
            }
            let component = match name {
                "quic-v1" => Protocol::QuicV1,
                "ip4" | "ip6" | "dns" | "tcp" | "udp" | "p2p" => {
                    let value = parts
                        .next()
                        .filter(|v| !v.is_empty())
                        .ok_or_else(|| missing_value(name))?;
                    parse_component(name, value)?
                }
                other => {
                    return Err(NetworkError::AddressParse(Cow::Owned(format!(
                        "unknown protocol '{other}'"
                    ))));
                }
            };
            components.push(component);
        }

        Self::from_components(components)
    }

    /// Build an address from components, enforcing the ordering rules
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::AddressParse`] if the sequence is not
    /// `host, port, [quic-v1], [p2p]`.
    pub fn from_components(components: Vec<Protocol>) -> Result<Self> {
        let mut iter = components.iter().peekable();

        match iter.next() {
            Some(c) if c.is_host() => {}
            _ => return Err(NetworkError::address("address must start with a host")),
        }
        let port = match iter.next() {
            Some(c) if c.is_port() => c,
            _ => return Err(NetworkError::address("host must be followed by tcp or udp")),
        };
        if iter.peek() == Some(&&Protocol::QuicV1) {
            if !matches!(port, Protocol::Udp(_)) {
                return Err(NetworkError::address("quic-v1 requires udp"));
            }
            iter.next();
        }
        if let Some(Protocol::P2p(_)) = iter.peek() {
            iter.next();
        }
        if iter.next().is_some() {
            return Err(NetworkError::address(
                "unexpected component after transport or p2p",
            ));
        }

        Ok(Self { components })
    }

    /// TCP address for a socket address
    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Self {
            components: vec![host, Protocol::Tcp(addr.port())],
        }
    }

    /// Components in order
    #[must_use]
    pub fn components(&self) -> &[Protocol] {
        &self.components
    }

    /// Trailing peer id, if any
    #[must_use]
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.components.last() {
            Some(Protocol::P2p(peer)) => Some(*peer),
            _ => None,
        }
    }

    /// Same address with `/p2p/<peer>` set (replacing an existing one)
    #[must_use]
    pub fn with_peer_id(&self, peer: PeerId) -> Self {
        let mut addr = self.without_peer_id();
        addr.components.push(Protocol::P2p(peer));
        addr
    }

    /// Same address without the `p2p` component
    #[must_use]
    pub fn without_peer_id(&self) -> Self {
        let mut components = self.components.clone();
        if let Some(Protocol::P2p(_)) = components.last() {
            components.pop();
        }
        Self { components }
    }

    /// Socket address for ip4/ip6 + tcp addresses
    ///
    /// DNS hosts and UDP transports are not dialable by the TCP transport and
    /// return `None`.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = match self.components.first()? {
            Protocol::Ip4(ip) => IpAddr::V4(*ip),
            Protocol::Ip6(ip) => IpAddr::V6(*ip),
            _ => return None,
        };
        match self.components.get(1)? {
            Protocol::Tcp(port) => Some(SocketAddr::new(ip, *port)),
            _ => None,
        }
    }
}

fn missing_value(name: &str) -> NetworkError {
    NetworkError::AddressParse(Cow::Owned(format!("missing value for '{name}'")))
}

fn parse_component(name: &str, value: &str) -> Result<Protocol> {
    let invalid =
        |what: &str| NetworkError::AddressParse(Cow::Owned(format!("invalid {what}: '{value}'")));
    match name {
        "ip4" => value.parse().map(Protocol::Ip4).map_err(|_| invalid("ipv4 address")),
        "ip6" => value.parse().map(Protocol::Ip6).map_err(|_| invalid("ipv6 address")),
        "dns" => {
            let valid = value.len() <= MAX_DNS_NAME_LEN
                && value
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.');
            if valid {
                Ok(Protocol::Dns(value.to_ascii_lowercase()))
            } else {
                Err(invalid("dns name"))
            }
        }
        "tcp" => value.parse().map(Protocol::Tcp).map_err(|_| invalid("tcp port")),
        "udp" => value.parse().map(Protocol::Udp).map_err(|_| invalid("udp port")),
        "p2p" => value.parse().map(Protocol::P2p).map_err(|_| invalid("peer id")),
        _ => Err(invalid("protocol")),
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Address::parse(&text).map_err(serde::de::Error::custom)
    }
}
