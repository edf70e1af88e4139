//! Network address parsing
//!
//! The bind address is given as `ip/prefix:port`; prefix and port are optional.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// Standard BACnet/IP UDP port (0xBAC0)
pub const DEFAULT_PORT: u16 = 47808;

/// Prefix assumed when the bind address has none
pub const DEFAULT_PREFIX: u8 = 24;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid IPv4 address: {0}")]
    InvalidIp(String),

    #[error("Invalid prefix length: {0}")]
    InvalidPrefix(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Local interface address with its network prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindAddress {
    pub ip: Ipv4Addr,
    pub prefix: u8,
    pub port: u16,
}

impl BindAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let bits = match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p)),
        };
        Ipv4Addr::from(bits)
    }

    /// Directed broadcast address of the interface's network.
    ///
    /// An unspecified bind address has no network, so the limited broadcast
    /// address is used instead.
    pub fn broadcast(&self) -> Ipv4Addr {
        if self.ip.is_unspecified() {
            return Ipv4Addr::BROADCAST;
        }
        Ipv4Addr::from(u32::from(self.ip) | !u32::from(self.netmask()))
    }
}

impl Default for BindAddress {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            prefix: DEFAULT_PREFIX,
            port: DEFAULT_PORT,
        }
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.ip, self.prefix, self.port)
    }
}

impl FromStr for BindAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .map_err(|_| AddressError::InvalidPort(port.to_string()))?,
            ),
            None => (s, DEFAULT_PORT),
        };

        let (ip, prefix) = match host.split_once('/') {
            Some((ip, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| AddressError::InvalidPrefix(prefix.to_string()))?;
                if prefix > 32 {
                    return Err(AddressError::InvalidPrefix(prefix.to_string()));
                }
                (ip, prefix)
            }
            None => (host, DEFAULT_PREFIX),
        };

        let ip = ip
            .parse()
            .map_err(|_| AddressError::InvalidIp(ip.to_string()))?;

        Ok(Self { ip, prefix, port })
    }
}

/// Parse `ip` or `ip:port`, defaulting the port to [`DEFAULT_PORT`]
pub fn parse_peer(s: &str) -> Result<SocketAddr, AddressError> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddrV4>() {
        return Ok(SocketAddr::V4(addr));
    }
    match s.parse::<Ipv4Addr>() {
        Ok(ip) => Ok(SocketAddr::V4(SocketAddrV4::new(ip, DEFAULT_PORT))),
        Err(_) => match s.rsplit_once(':') {
            Some((ip, port)) if ip.parse::<Ipv4Addr>().is_ok() => {
                Err(AddressError::InvalidPort(port.to_string()))
            }
            _ => Err(AddressError::InvalidIp(s.to_string())),
        },
    }
}
