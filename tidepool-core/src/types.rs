//! Addressing types shared by every tidepool layer.
//!
//! - [`NetworkAddress`]: IP address + port of a node's RPC server
//! - [`NodeId`]: one process incarnation listening on a [`NetworkAddress`]
//! - [`ActorId`]: process-unique actor instance number
//! - [`ActorAddress`]: globally unique `(NodeId, ActorId)` pair

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Network address (IPv4/IPv6 + port).
///
/// Node equality in the membership layer is defined by this value.
///
/// # Examples
///
/// ```
/// use tidepool_core::NetworkAddress;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500);
/// assert_eq!(addr.to_string(), "127.0.0.1:4500");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
}

impl NetworkAddress {
    /// Create a new network address.
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Loopback address with the given port, handy for tests.
    pub const fn localhost(port: u16) -> Self {
        Self::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port)
    }

    /// Parse from string "ip:port" format.
    ///
    /// Supports both IPv4 (`127.0.0.1:4500`) and IPv6 (`[::1]:4500`) notation.
    ///
    /// # Errors
    ///
    /// Returns error if IP or port cannot be parsed.
    pub fn parse(s: &str) -> Result<Self, NetworkAddressParseError> {
        let (ip_str, port_str) = if let Some(rest) = s.strip_prefix('[') {
            let (ip, tail) = rest
                .split_once(']')
                .ok_or(NetworkAddressParseError::InvalidIp)?;
            let port = tail
                .strip_prefix(':')
                .ok_or(NetworkAddressParseError::MissingPort)?;
            (ip, port)
        } else {
            s.rsplit_once(':')
                .ok_or(NetworkAddressParseError::MissingPort)?
        };

        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| NetworkAddressParseError::InvalidIp)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| NetworkAddressParseError::InvalidPort)?;
        Ok(Self::new(ip, port))
    }
}

impl std::str::FromStr for NetworkAddress {
    type Err = NetworkAddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<NetworkAddress> for SocketAddr {
    fn from(addr: NetworkAddress) -> Self {
        SocketAddr::new(addr.ip, addr.port)
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Error parsing a network address from string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkAddressParseError {
    /// The IP address could not be parsed.
    #[error("invalid IP address")]
    InvalidIp,
    /// The port number could not be parsed.
    #[error("invalid port number")]
    InvalidPort,
    /// No `:port` suffix was found.
    #[error("missing port")]
    MissingPort,
}

/// Identity of one process incarnation.
///
/// Two processes restarted on the same address get different incarnations,
/// so actor addresses from a previous run never alias live actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Address of the node's RPC server.
    pub address: NetworkAddress,
    /// Random value chosen at process start.
    pub incarnation: u64,
}

impl NodeId {
    /// Create a node id.
    pub const fn new(address: NetworkAddress, incarnation: u64) -> Self {
        Self {
            address,
            incarnation,
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{:08x}", self.address, self.incarnation as u32)
    }
}

/// Process-unique actor instance number. Never reused while the node lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub u64);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "actor-{}", self.0)
    }
}

/// Globally unique actor address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorAddress {
    /// Node hosting the actor.
    pub node: NodeId,
    /// Actor instance on that node.
    pub actor: ActorId,
}

impl ActorAddress {
    /// Create an actor address.
    pub const fn new(node: NodeId, actor: ActorId) -> Self {
        Self { node, actor }
    }
}

impl std::fmt::Display for ActorAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.actor, self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_parse_ipv4() {
        let addr = NetworkAddress::parse("10.0.0.7:9000").expect("parse");
        assert_eq!(addr.port, 9000);
        assert_eq!(addr.to_string(), "10.0.0.7:9000");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = NetworkAddress::parse("[::1]:4500").expect("parse");
        assert_eq!(addr.ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.to_string(), "[::1]:4500");
    }

    #[test]
    fn test_from_str_matches_parse() {
        let addr: NetworkAddress = "127.0.0.1:4500".parse().expect("parse");
        assert_eq!(addr, NetworkAddress::localhost(4500));
        assert_eq!(
            "127.0.0.1".parse::<NetworkAddress>(),
            Err(NetworkAddressParseError::MissingPort)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            NetworkAddress::parse("127.0.0.1"),
            Err(NetworkAddressParseError::MissingPort)
        );
        assert_eq!(
            NetworkAddress::parse("nope:1"),
            Err(NetworkAddressParseError::InvalidIp)
        );
        assert_eq!(
            NetworkAddress::parse("127.0.0.1:99999"),
            Err(NetworkAddressParseError::InvalidPort)
        );
        assert_eq!(
            NetworkAddress::parse("[::1]4500"),
            Err(NetworkAddressParseError::MissingPort)
        );
    }

    #[test]
    fn test_node_id_distinguishes_incarnations() {
        let a = NodeId::new(NetworkAddress::localhost(1), 1);
        let b = NodeId::new(NetworkAddress::localhost(1), 2);
        assert_ne!(a, b);
        assert_eq!(a.address, b.address);
    }
}
