//! VRCP server-side state machine (spec §4.6):
//!
//! ```text
//! AwaitingConnection --(advertise + accept)--> Negotiating --(CONN_REQ ok)--> Connected
//!                                                   \--(CONN_REQ invalid)--> AwaitingConnection
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::net::tcp::TcpSocket;
use crate::net::udp::UdpSocket;
use crate::types::VrSystemSpecs;

use super::packet::{Advertisement, ConnAccept, ConnReject, ConnReq};
use super::{BaseHeader, FieldType, MAX_EYE_DIMENSION, RejectReason, ROW_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    AwaitingConnection,
    Negotiating,
    Connected,
}

/// Reassembly buffer for the reliable (TCP) VRCP stream: a single reception
/// buffer with head/tail indices (spec §4.6 "Send/receive discipline").
/// After each OS read at the tail, the buffer is scanned head-forward for
/// complete packets; partial tail data is compacted back to index 0.
#[derive(Default)]
struct TcpReassembly {
    buf: Vec<u8>,
}

impl TcpReassembly {
    fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete VRCP packet, if any, compacting the remainder.
    /// A malformed `n_rows == 0` packet is treated as a malformed 1-row
    /// packet and skipped, rather than stalling reassembly on every
    /// subsequent byte (spec §4.6 / §6.1).
    fn pop_packet(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < ROW_SIZE {
                return None;
            }
            if self.buf[1] == 0 {
                self.buf.drain(..ROW_SIZE);
                continue;
            }
            let (_header, len) = BaseHeader::parse(&self.buf)?;
            if self.buf.len() < len {
                return None;
            }
            let packet = self.buf[..len].to_vec();
            self.buf.drain(..len);
            return Some(packet);
        }
    }
}

/// Who the server is currently waiting to hear from during the handshake,
/// and what it will validate/respond with.
pub struct VrcpServerSocket {
    state: ServerState,
    tcp: TcpSocket,
    broadcast_socket: Option<UdpSocket>,
    vrcp_udp: Option<UdpSocket>,
    tcp_port: u16,
    advertisement_interval: Duration,
    last_advertisement: Instant,
    broadcast_addrs: Vec<std::net::SocketAddr>,
    codec_preference: Vec<String>,
    video_mode_is_udp: bool,
    reassembly: TcpReassembly,
    pub peer_udp_addr: Option<std::net::SocketAddr>,
    pub chosen_codec: Option<String>,
    pub client_specs: Option<VrSystemSpecs>,
    pub client_ntp_timestamp: Option<u64>,
}

impl VrcpServerSocket {
    pub fn new(
        tcp_port: u16,
        advertisement_interval: Duration,
        broadcast_addrs: Vec<std::net::SocketAddr>,
        codec_preference: Vec<String>,
        video_mode_is_udp: bool,
    ) -> Result<Self> {
        let mut tcp = TcpSocket::new();
        tcp.listen(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, tcp_port))?;
        let actual_port = match tcp.local_addr() {
            Some(std::net::SocketAddr::V4(a)) => a.port(),
            _ => tcp_port,
        };

        let broadcast_socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        broadcast_socket.enable_broadcast()?;

        Ok(Self {
            state: ServerState::AwaitingConnection,
            tcp,
            broadcast_socket: Some(broadcast_socket),
            vrcp_udp: None,
            tcp_port: actual_port,
            advertisement_interval,
            last_advertisement: Instant::now() - advertisement_interval,
            broadcast_addrs,
            codec_preference,
            video_mode_is_udp,
            reassembly: TcpReassembly::default(),
            peer_udp_addr: None,
            chosen_codec: None,
            client_specs: None,
            client_ntp_timestamp: None,
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Drive the state machine one step. Call repeatedly from a poll loop;
    /// never blocks.
    pub fn poll(&mut self) -> Result<()> {
        match self.state {
            ServerState::AwaitingConnection => self.poll_awaiting(),
            ServerState::Negotiating => self.poll_negotiating(),
            ServerState::Connected => Ok(()),
        }
    }

    fn poll_awaiting(&mut self) -> Result<()> {
        if self.last_advertisement.elapsed() >= self.advertisement_interval {
            self.broadcast_advertisement()?;
            self.last_advertisement = Instant::now();
        }

        match self.tcp.accept() {
            Ok(()) => {
                self.state = ServerState::Negotiating;
                tracing::info!("vrcp: client connected, negotiating");
                Ok(())
            }
            Err(Error::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn broadcast_advertisement(&self) -> Result<()> {
        let Some(socket) = &self.broadcast_socket else {
            return Ok(());
        };
        let ad = Advertisement {
            tcp_port: self.tcp_port,
            interval_seconds: self.advertisement_interval.as_secs().min(255) as u8,
            unix_seconds: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0),
        };
        socket.broadcast_to_all(&ad.encode(), &self.broadcast_addrs)
    }

    fn poll_negotiating(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.tcp.recv(&mut chunk) {
                Ok(n) if n > 0 => self.reassembly.feed(&chunk[..n]),
                Ok(_) => break,
                Err(Error::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }

        while let Some(packet) = self.reassembly.pop_packet() {
            if packet.is_empty() {
                continue;
            }
            if packet[0] == FieldType::ConnReq as u8 {
                self.handle_conn_req(&packet)?;
                return Ok(());
            }
        }
        Ok(())
    }

    fn handle_conn_req(&mut self, packet: &[u8]) -> Result<()> {
        let Some(req) = ConnReq::decode(packet) else {
            return self.reject(RejectReason::GenericError, 0);
        };

        if let Some(reason) = self.validate(&req) {
            return self.reject(reason, 0);
        }

        let chosen = self
            .codec_preference
            .iter()
            .find(|c| req.supported_video_codecs.iter().any(|rc| rc == *c))
            .cloned();

        let Some(chosen) = chosen else {
            return self.reject(RejectReason::NoSupportedVideoCodec, 0);
        };

        self.client_specs = Some(VrSystemSpecs {
            eye_width: req.eye_width,
            eye_height: req.eye_height,
            refresh_rate_num: req.refresh_rate_num,
            refresh_rate_den: req.refresh_rate_den,
            ipd_meters: f32::from_bits(req.ipd_bits),
            eye_to_head_distance: f32::from_bits(req.eye_to_head_bits),
            world_bounds_width: f32::from_bits(req.world_width_bits),
            world_bounds_height: f32::from_bits(req.world_height_bits),
            manufacturer_name: req.manufacturer_name.clone(),
            system_name: req.system_name.clone(),
        });
        self.client_ntp_timestamp = Some(req.ntp_timestamp);

        let peer_ip = match self.tcp.peer_addr() {
            Some(std::net::SocketAddr::V4(a)) => *a.ip(),
            _ => Ipv4Addr::UNSPECIFIED,
        };
        self.peer_udp_addr = Some(std::net::SocketAddr::V4(SocketAddrV4::new(
            peer_ip,
            req.udp_vrcp_port,
        )));

        let udp = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        let udp_port = match udp.local_addr() {
            Some(std::net::SocketAddr::V4(a)) => a.port(),
            _ => 0,
        };
        self.vrcp_udp = Some(udp);

        let video_port = req.video_port;
        let accept = ConnAccept {
            udp_vrcp_port: udp_port,
            video_port,
            chosen_video_codec: chosen.clone(),
        };
        self.tcp
            .send_all_with_budget(&accept.encode(), Duration::from_millis(200))?;

        self.chosen_codec = Some(chosen);
        self.broadcast_socket = None;
        self.state = ServerState::Connected;
        tracing::info!(codec = %self.chosen_codec.as_deref().unwrap_or(""), "vrcp: connected");
        Ok(())
    }

    fn validate(&self, req: &ConnReq) -> Option<RejectReason> {
        if req.version != super::PROTOCOL_VERSION {
            return Some(RejectReason::VersionMismatch);
        }
        let req_is_udp = req.video_mode != 0;
        if req_is_udp != self.video_mode_is_udp {
            return Some(RejectReason::VideoModeMismatch);
        }
        if req.udp_vrcp_port == 0 {
            return Some(RejectReason::InvalidVrcpPort);
        }
        if req.video_port == 0 {
            return Some(RejectReason::InvalidVideoPort);
        }
        if req.eye_width == 0
            || req.eye_height == 0
            || req.eye_width > MAX_EYE_DIMENSION
            || req.eye_height > MAX_EYE_DIMENSION
        {
            return Some(RejectReason::InvalidEyeSize);
        }
        if req.refresh_rate_num == 0 || req.refresh_rate_den == 0 {
            return Some(RejectReason::InvalidRefreshRate);
        }
        if req.manufacturer_name.is_empty() || req.manufacturer_name.len() > 32 {
            return Some(RejectReason::InvalidManufacturerName);
        }
        if req.system_name.is_empty() || req.system_name.len() > 32 {
            return Some(RejectReason::InvalidSystemName);
        }
        if req.supported_video_codecs.is_empty() {
            return Some(RejectReason::InvalidVideoCodecs);
        }
        if req.ntp_timestamp < crate::rtp::clock::NTP_UNIX_EPOCH_DELTA {
            return Some(RejectReason::InvalidNtpTimestamp);
        }
        None
    }

    fn reject(&mut self, reason: RejectReason, data: u8) -> Result<()> {
        let packet = ConnReject { reason, data };
        let _ = self
            .tcp
            .send_all_with_budget(&packet.encode(), Duration::from_millis(200));
        tracing::info!(?reason, "vrcp: rejecting CONN_REQ");
        self.reset()
    }

    /// Tear the session down and return to `AwaitingConnection`, re-binding
    /// the TCP listen port.
    pub fn reset(&mut self) -> Result<()> {
        self.tcp.close();
        self.tcp = TcpSocket::new();
        self.tcp
            .listen(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.tcp_port))?;
        if self.broadcast_socket.is_none() {
            let broadcast_socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
            broadcast_socket.enable_broadcast()?;
            self.broadcast_socket = Some(broadcast_socket);
        }
        self.vrcp_udp = None;
        self.reassembly = TcpReassembly::default();
        self.peer_udp_addr = None;
        self.chosen_codec = None;
        self.client_specs = None;
        self.client_ntp_timestamp = None;
        self.state = ServerState::AwaitingConnection;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_on_invalid_eye_size_then_back_to_awaiting() {
        let mut server = VrcpServerSocket::new(
            0,
            Duration::from_millis(50),
            vec![],
            vec!["h264".into()],
            true,
        )
        .unwrap();

        let req = ConnReq {
            version: super::super::PROTOCOL_VERSION,
            video_mode: 1,
            udp_vrcp_port: 7001,
            video_port: 7002,
            eye_width: 5000,
            eye_height: 1600,
            refresh_rate_num: 90,
            refresh_rate_den: 1,
            ipd_bits: 0,
            eye_to_head_bits: 0,
            world_width_bits: 0,
            world_height_bits: 0,
            ntp_timestamp: 3_900_000_000,
            manufacturer_name: "Acme".into(),
            system_name: "Widget".into(),
            supported_video_codecs: vec!["h264".into()],
        };
        assert_eq!(
            server.validate(&req),
            Some(RejectReason::InvalidEyeSize)
        );
    }

    #[test]
    fn codec_intersection_prefers_server_order() {
        let server = VrcpServerSocket::new(
            0,
            Duration::from_millis(50),
            vec![],
            vec!["h264".into(), "h265".into()],
            true,
        )
        .unwrap();
        let client_codecs = vec!["h265".to_string(), "h264".to_string()];
        let chosen = server
            .codec_preference
            .iter()
            .find(|c| client_codecs.iter().any(|rc| rc == *c))
            .cloned();
        assert_eq!(chosen, Some("h264".to_string()));
    }

    #[test]
    fn reassembly_skips_malformed_zero_row_packet_instead_of_stalling() {
        let mut reassembly = TcpReassembly::default();
        // A malformed row with n_rows == 0, followed by a well-formed
        // 1-row PING packet (ftype arbitrary, n_rows = 1).
        reassembly.feed(&[0xFF, 0x00, 0x00, 0x00]);
        reassembly.feed(&[0x01, 0x01, 0x00, 0x00]);

        let packet = reassembly.pop_packet().expect("well-formed packet after garbage row");
        assert_eq!(packet, vec![0x01, 0x01, 0x00, 0x00]);
        assert!(reassembly.buf.is_empty());
    }
}
