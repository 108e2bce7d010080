//! Non-blocking socket layer (spec §4.2).
//!
//! Both the TCP and UDP wrappers here put the underlying `std::net` socket
//! into non-blocking mode at construction and never park the calling
//! thread: every operation that would otherwise block instead returns
//! [`crate::error::Error::WouldBlock`] and the caller loops (the VRCP and
//! video-socket state machines above this layer do exactly that).

pub mod tcp;
pub mod udp;

pub use tcp::{TcpSocket, TcpState};
pub use udp::UdpSocket;

/// 32-bit IPv4 address + 16-bit port, per spec §3. Port 0 means
/// "auto-assign"; address 0 means "any". A thin newtype over
/// [`std::net::SocketAddrV4`] so the wire-level meaning of the all-zero
/// values is documented at the type that carries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddr(pub std::net::SocketAddrV4);

impl SocketAddr {
    pub const ANY: SocketAddr = SocketAddr(std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0));

    pub fn new(ip: std::net::Ipv4Addr, port: u16) -> Self {
        Self(std::net::SocketAddrV4::new(ip, port))
    }

    pub fn port_is_auto_assign(&self) -> bool {
        self.0.port() == 0
    }

    pub fn addr_is_any(&self) -> bool {
        self.0.ip().is_unspecified()
    }
}

impl From<std::net::SocketAddrV4> for SocketAddr {
    fn from(v: std::net::SocketAddrV4) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
