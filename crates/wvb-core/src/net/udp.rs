//! Non-blocking UDP socket with optional broadcast (spec §4.2).

use crate::error::{Error, Result};
use crate::telemetry::SocketBucketHandle;

pub struct UdpSocket {
    socket: std::net::UdpSocket,
    bucket: Option<SocketBucketHandle>,
}

impl UdpSocket {
    pub fn bind(addr: std::net::SocketAddrV4) -> Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            bucket: None,
        })
    }

    pub fn enable_broadcast(&self) -> Result<()> {
        self.socket.set_broadcast(true)?;
        Ok(())
    }

    pub fn register_bucket(&mut self, bucket: SocketBucketHandle) {
        self.bucket = Some(bucket);
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub fn send_to(&self, buf: &[u8], addr: std::net::SocketAddr) -> Result<usize> {
        match self.socket.send_to(buf, addr) {
            Ok(n) => {
                if let Some(b) = &self.bucket {
                    b.record_sent(n);
                }
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Broadcast `buf` to every address in `targets` (used for VRCP
    /// advertisement, spec §4.6).
    pub fn broadcast_to_all(&self, buf: &[u8], targets: &[std::net::SocketAddr]) -> Result<()> {
        for &addr in targets {
            self.send_to(buf, addr)?;
        }
        Ok(())
    }

    /// Receive one datagram. UDP preserves message boundaries, so no
    /// partial-assembly logic is needed here (spec §4.6 "Send/receive
    /// discipline"); the caller splits a compound datagram by walking
    /// `n_rows * 4` boundaries.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, std::net::SocketAddr)> {
        match self.socket.recv_from(buf) {
            Ok((n, addr)) => {
                if let Some(b) = &self.bucket {
                    b.record_received(n);
                }
                Ok((n, addr))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn send_recv_round_trip() {
        let a = UdpSocket::bind(std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let b = UdpSocket::bind(std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"ping", b_addr).unwrap();

        let mut buf = [0u8; 16];
        let (n, _from) = loop {
            match b.recv_from(&mut buf) {
                Ok(r) => break r,
                Err(Error::WouldBlock) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("{e:?}"),
            }
        };
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn recv_would_block_when_empty() {
        let s = UdpSocket::bind(std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(s.recv_from(&mut buf), Err(Error::WouldBlock)));
    }
}
