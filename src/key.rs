//! Connection identifiers.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// The identifier of a connection.
///
/// This is the pair of the local (host) endpoint and the remote (client) endpoint. Equality is
/// field-wise and exact; no normalization of any kind is done.
///
/// The default key is all zeros, which is what empty buckets carry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// The host address.
    pub host_addr: u32,
    /// The host port.
    pub host_port: u16,
    /// The client address.
    pub client_addr: u32,
    /// The client port.
    pub client_port: u16,
}

impl ConnectionKey {
    /// Create a key from its raw fields.
    pub fn new(host_addr: u32, host_port: u16, client_addr: u32, client_port: u16) -> ConnectionKey {
        ConnectionKey {
            host_addr: host_addr,
            host_port: host_port,
            client_addr: client_addr,
            client_port: client_port,
        }
    }

    /// Create a key from a host and a client socket address.
    pub fn from_addrs(host: SocketAddrV4, client: SocketAddrV4) -> ConnectionKey {
        ConnectionKey::new(
            u32::from(*host.ip()),
            host.port(),
            u32::from(*client.ip()),
            client.port(),
        )
    }

    /// The host endpoint.
    pub fn host(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.host_addr), self.host_port)
    }

    /// The client endpoint.
    pub fn client(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.client_addr), self.client_port)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} <- {}", self.host(), self.client())
    }
}
