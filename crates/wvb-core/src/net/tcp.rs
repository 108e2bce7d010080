//! Non-blocking TCP socket with an explicit connection state machine
//! (spec §4.2):
//!
//! ```text
//! NOT_STARTED --(listen)--> LISTENING --(accept ok)--> CONNECTED
//!             \-(connect)-> CONNECTING --(connect ok)->
//! CONNECTED --(close / peer FIN detected)--> CLOSED
//! ```

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::telemetry::SocketBucketHandle;

/// TCP connection state, driven only by the transitions listed in spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    NotStarted,
    Connecting,
    Listening,
    Connected,
    Closed,
}

/// Non-blocking TCP wrapper. `listen()`/`connect()` are retry-on-would-block:
/// callers loop, calling again until the state advances past
/// `Connecting`/`Listening`.
pub struct TcpSocket {
    state: TcpState,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    bucket: Option<SocketBucketHandle>,
}

impl TcpSocket {
    pub fn new() -> Self {
        Self {
            state: TcpState::NotStarted,
            listener: None,
            stream: None,
            bucket: None,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, TcpState::NotStarted | TcpState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        self.state == TcpState::Connected
    }

    pub fn register_bucket(&mut self, bucket: SocketBucketHandle) {
        self.bucket = Some(bucket);
    }

    /// Begin (or continue) listening on `addr`. Port 0 auto-assigns.
    /// Idempotent: calling again once `Listening` is a no-op.
    pub fn listen(&mut self, addr: std::net::SocketAddrV4) -> Result<()> {
        if self.state == TcpState::Listening {
            return Ok(());
        }
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        self.listener = Some(listener);
        self.state = TcpState::Listening;
        tracing::debug!(%addr, "tcp socket listening");
        Ok(())
    }

    /// Poll for an incoming connection. Returns `Ok(())` and transitions to
    /// `Connected` once a peer has connected; otherwise
    /// `Err(Error::WouldBlock)`.
    pub fn accept(&mut self) -> Result<()> {
        let listener = self.listener.as_ref().ok_or(Error::Closed)?;
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                self.stream = Some(stream);
                self.listener = None;
                self.state = TcpState::Connected;
                tracing::info!(%peer, "tcp accept");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Begin (or continue) a non-blocking connect to `addr`.
    pub fn connect(&mut self, addr: std::net::SocketAddrV4) -> Result<()> {
        match self.state {
            TcpState::Connected => return Ok(()),
            TcpState::Connecting => {}
            _ => {
                let stream = TcpStream::connect_timeout(
                    &std::net::SocketAddr::V4(addr),
                    Duration::from_millis(1),
                )
                .or_else(|e| {
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                    {
                        TcpStream::connect(addr)
                    } else {
                        Err(e)
                    }
                })?;
                stream.set_nonblocking(true)?;
                self.stream = Some(stream);
                self.state = TcpState::Connecting;
            }
        }

        // A non-blocking connect is "done" once the socket is writable and
        // reports no pending error; std::net has no direct poll for this, so
        // a zero-length peek is used as the cheapest available probe.
        if let Some(stream) = &self.stream {
            match stream.peer_addr() {
                Ok(_) => {
                    self.state = TcpState::Connected;
                    Ok(())
                }
                Err(_) => Err(Error::WouldBlock),
            }
        } else {
            Err(Error::WouldBlock)
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .or_else(|| self.listener.as_ref().and_then(|l| l.local_addr().ok()))
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Peek one byte (`MSG_PEEK`) to detect whether the peer has closed the
    /// connection without consuming any buffered data, and update `state`
    /// to `Closed` if so.
    pub fn refresh_state(&mut self) {
        if self.state != TcpState::Connected {
            return;
        }
        if let Some(stream) = &self.stream {
            let mut probe = [0u8; 1];
            match stream.peek(&mut probe) {
                Ok(0) => self.state = TcpState::Closed,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => self.state = TcpState::Closed,
            }
        }
    }

    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        use std::io::Write;
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        match stream.write(buf) {
            Ok(n) => {
                if let Some(b) = &self.bucket {
                    b.record_sent(n);
                }
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) if is_peer_reset(&e) => {
                self.state = TcpState::Closed;
                Err(Error::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Loop sending `buf`, re-issuing the remaining tail on partial sends,
    /// for up to `budget` before giving up with `Error::Timeout`. Any
    /// peer-reset transitions the socket to `Closed`.
    pub fn send_all_with_budget(&mut self, buf: &[u8], budget: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + budget;
        let mut sent = 0usize;
        while sent < buf.len() {
            match self.send(&buf[sent..]) {
                Ok(n) => sent += n,
                Err(Error::WouldBlock) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        match stream.read(buf) {
            Ok(0) => {
                self.state = TcpState::Closed;
                Err(Error::Closed)
            }
            Ok(n) => {
                if let Some(b) = &self.bucket {
                    b.record_received(n);
                }
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) if is_peer_reset(&e) => {
                self.state = TcpState::Closed;
                Err(Error::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn close(&mut self) {
        self.stream = None;
        self.listener = None;
        self.state = TcpState::Closed;
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

fn is_peer_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn fresh_socket_is_not_started() {
        let s = TcpSocket::new();
        assert_eq!(s.state(), TcpState::NotStarted);
        assert!(!s.is_open());
    }

    #[test]
    fn listen_then_connect_reach_connected() {
        let mut server = TcpSocket::new();
        server
            .listen(std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        assert_eq!(server.state(), TcpState::Listening);
        let addr = match server.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let mut client = TcpSocket::new();
        // Retry loop like a real caller: connect() may return WouldBlock
        // while the handshake is in flight.
        for _ in 0..200 {
            match client.connect(addr) {
                Ok(()) => break,
                Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("unexpected connect error: {e:?}"),
            }
        }
        assert_eq!(client.state(), TcpState::Connected);

        for _ in 0..200 {
            match server.accept() {
                Ok(()) => break,
                Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("unexpected accept error: {e:?}"),
            }
        }
        assert_eq!(server.state(), TcpState::Connected);
    }

    #[test]
    fn send_recv_round_trip() {
        let mut server = TcpSocket::new();
        server
            .listen(std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        let addr = match server.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let mut client = TcpSocket::new();
        loop {
            match client.connect(addr) {
                Ok(()) => break,
                Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("{e:?}"),
            }
        }
        loop {
            match server.accept() {
                Ok(()) => break,
                Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("{e:?}"),
            }
        }

        client.send_all_with_budget(b"hello", Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 16];
        let n = loop {
            match server.recv(&mut buf) {
                Ok(n) => break n,
                Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("{e:?}"),
            }
        };
        assert_eq!(&buf[..n], b"hello");
    }
}
