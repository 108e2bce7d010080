//! VRCP client-side state machine (spec §4.6):
//!
//! ```text
//! AwaitingConnection --(user picks candidate, connect)--> Negotiating
//! Negotiating --(CONN_ACCEPT)--> Connected
//! Negotiating --(CONN_REJECT)--> AwaitingConnection (reset_client)
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::net::tcp::TcpSocket;
use crate::net::udp::UdpSocket;
use crate::rtp::clock::RtpClock;
use crate::types::VrSystemSpecs;

use super::packet::{Advertisement, ConnAccept, ConnReject, ConnReq, Ping, PingReply};
use super::{BaseHeader, FieldType, ROW_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    AwaitingConnection,
    Negotiating,
    Connected,
}

/// One discovered server, deduplicated by address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub addr: std::net::SocketAddr,
    pub last_seen: Instant,
    pub interval: Duration,
}

impl Candidate {
    /// Expired once `now - last_seen > 3 * interval + 1s` (redesign note:
    /// the original's ~10000s margin was a clock-drift workaround; this is
    /// a much smaller, principled value scaled off the advertised interval).
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) > self.interval * 3 + CANDIDATE_EXPIRY_MARGIN
    }
}

/// Additive margin applied to `3 * interval` before a candidate is
/// considered stale (spec §9 open question resolution).
const CANDIDATE_EXPIRY_MARGIN: Duration = Duration::from_secs(1);

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(500);
const CLOCK_ERROR_THRESHOLD_US: i64 = 2_000;

pub struct VrcpClientSocket {
    state: ClientState,
    advertisement_socket: Option<UdpSocket>,
    tcp: TcpSocket,
    udp: Option<UdpSocket>,
    candidates: Vec<Candidate>,
    pub chosen_video_codec: Option<String>,
    pub server_udp_addr: Option<std::net::SocketAddr>,
}

impl VrcpClientSocket {
    pub fn new(advertisement_port: u16) -> Result<Self> {
        let advertisement_socket =
            UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, advertisement_port))?;
        Ok(Self {
            state: ClientState::AwaitingConnection,
            advertisement_socket: Some(advertisement_socket),
            tcp: TcpSocket::new(),
            udp: None,
            candidates: Vec::new(),
            chosen_video_codec: None,
            server_udp_addr: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Poll for advertisement datagrams, updating the deduplicated
    /// candidate list and expiring stale entries.
    pub fn poll_discovery(&mut self) -> Result<()> {
        if self.state != ClientState::AwaitingConnection {
            return Ok(());
        }
        let Some(socket) = &self.advertisement_socket else {
            return Ok(());
        };

        let mut buf = [0u8; 64];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Some(ad) = Advertisement::decode(&buf[..n]) {
                        self.record_candidate(from, ad);
                    }
                }
                Err(Error::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }

        let now = Instant::now();
        self.candidates.retain(|c| !c.is_expired(now));
        Ok(())
    }

    fn record_candidate(&mut self, from: std::net::SocketAddr, ad: Advertisement) {
        let addr = std::net::SocketAddr::new(from.ip(), ad.tcp_port);
        let interval = Duration::from_secs(ad.interval_seconds as u64);
        if let Some(existing) = self.candidates.iter_mut().find(|c| c.addr == addr) {
            existing.last_seen = Instant::now();
            existing.interval = interval;
        } else {
            self.candidates.push(Candidate {
                addr,
                last_seen: Instant::now(),
                interval,
            });
        }
    }

    /// Begin connecting to a chosen candidate's TCP port.
    pub fn connect(&mut self, addr: std::net::SocketAddr) -> Result<()> {
        let std::net::SocketAddr::V4(addr) = addr else {
            return Err(Error::Malformed("vrcp requires an IPv4 address".into()));
        };
        self.tcp.connect(addr)
    }

    /// Binds this client's own VRCP UDP socket if it has not been bound
    /// yet, returning the assigned port. Must happen before
    /// [`send_conn_req`](Self::send_conn_req) so the real (non-zero) port
    /// can be reported to the server — the server rejects `udp_vrcp_port
    /// == 0` (spec §6.1 `INVALID_VRCP_PORT`).
    pub fn bind_udp(&mut self) -> Result<u16> {
        if self.udp.is_none() {
            self.udp = Some(UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?);
        }
        Ok(self
            .udp
            .as_ref()
            .and_then(|u| u.local_addr())
            .map(|a| a.port())
            .unwrap_or(0))
    }

    /// Once TCP is connected, send the `CONN_REQ` describing our own specs
    /// and codec preference and move to `Negotiating`. Call
    /// [`bind_udp`](Self::bind_udp) first.
    pub fn send_conn_req(
        &mut self,
        video_port: u16,
        video_mode_is_udp: bool,
        specs: &VrSystemSpecs,
        ntp_timestamp: u64,
        supported_codecs: Vec<String>,
    ) -> Result<()> {
        let own_udp_vrcp_port = self.bind_udp()?;
        let req = ConnReq {
            version: super::PROTOCOL_VERSION,
            video_mode: video_mode_is_udp as u8,
            udp_vrcp_port: own_udp_vrcp_port,
            video_port,
            eye_width: specs.eye_width,
            eye_height: specs.eye_height,
            refresh_rate_num: specs.refresh_rate_num,
            refresh_rate_den: specs.refresh_rate_den,
            ipd_bits: specs.ipd_meters.to_bits(),
            eye_to_head_bits: specs.eye_to_head_distance.to_bits(),
            world_width_bits: specs.world_bounds_width.to_bits(),
            world_height_bits: specs.world_bounds_height.to_bits(),
            ntp_timestamp,
            manufacturer_name: specs.manufacturer_name.clone(),
            system_name: specs.system_name.clone(),
            supported_video_codecs: supported_codecs,
        };
        self.tcp
            .send_all_with_budget(&req.encode(), Duration::from_millis(200))?;
        self.state = ClientState::Negotiating;
        Ok(())
    }

    /// Poll for `CONN_ACCEPT`/`CONN_REJECT` while negotiating. Returns
    /// `Ok(true)` once `Connected`.
    pub fn poll_negotiation(&mut self) -> Result<bool> {
        if self.state != ClientState::Negotiating {
            return Ok(self.state == ClientState::Connected);
        }

        let mut buf = [0u8; 4096];
        let n = match self.tcp.recv(&mut buf) {
            Ok(n) => n,
            Err(Error::WouldBlock) => return Ok(false),
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(false);
        }
        let (header, len) = match BaseHeader::parse(&buf[..n]) {
            Some(h) => h,
            None => return Ok(false),
        };
        if header.ftype == FieldType::ConnAccept as u8 {
            if let Some(accept) = ConnAccept::decode(&buf[..len]) {
                self.chosen_video_codec = Some(accept.chosen_video_codec);
                let peer_ip = match self.tcp.peer_addr() {
                    Some(std::net::SocketAddr::V4(a)) => *a.ip(),
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                self.server_udp_addr = Some(std::net::SocketAddr::V4(SocketAddrV4::new(
                    peer_ip,
                    accept.udp_vrcp_port,
                )));
                self.bind_udp()?;
                self.advertisement_socket = None;
                self.candidates.clear();
                self.state = ClientState::Connected;
                tracing::info!(codec = %self.chosen_video_codec.as_deref().unwrap_or(""), "vrcp: connected");
                return Ok(true);
            }
        } else if header.ftype == FieldType::ConnReject as u8 {
            if let Some(reject) = ConnReject::decode(&buf[..len]) {
                tracing::info!(?reject.reason, "vrcp: CONN_REQ rejected");
            }
            self.reset_client()?;
        }
        Ok(false)
    }

    /// Tear down and return to `AwaitingConnection`, re-opening discovery.
    pub fn reset_client(&mut self) -> Result<()> {
        self.tcp.close();
        self.tcp = TcpSocket::new();
        self.udp = None;
        self.chosen_video_codec = None;
        self.server_udp_addr = None;
        if self.advertisement_socket.is_none() {
            self.advertisement_socket = Some(UdpSocket::bind(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                super::DEFAULT_ADVERTISEMENT_PORT,
            ))?);
        }
        self.candidates.clear();
        self.state = ClientState::AwaitingConnection;
        Ok(())
    }

    /// Run the clock-sync ping loop: send `ping_count` pings one at a time
    /// over UDP, applying `move_epoch` when the observed clock error
    /// exceeds the threshold, retransmitting lost pings up to `2 *
    /// ping_count` attempts total, then sending `SYNC_FINISHED`. The server
    /// must reply promptly; this loop bounds its own patience with
    /// `DEFAULT_PING_TIMEOUT` per attempt (spec §4.6 "Clock synchronization").
    pub fn run_clock_sync(&mut self, clock: &mut RtpClock, ping_count: u32) -> Result<()> {
        let Some(udp) = &self.udp else {
            return Err(Error::Closed);
        };
        let Some(server_addr) = self.server_udp_addr else {
            return Err(Error::Closed);
        };

        let max_attempts = ping_count * 2;
        let mut successes = 0u32;
        let mut attempts = 0u32;

        while successes < ping_count && attempts < max_attempts {
            attempts += 1;
            let ping_id = attempts as u16;
            let send_time = Instant::now();
            udp.send_to(&Ping { ping_id }.encode(), server_addr)?;

            let deadline = send_time + DEFAULT_PING_TIMEOUT;
            let mut buf = [0u8; 64];
            let reply = loop {
                if Instant::now() >= deadline {
                    break None;
                }
                match udp.recv_from(&mut buf) {
                    Ok((n, from)) if from == server_addr => {
                        if let Some(reply) = PingReply::decode(&buf[..n]) {
                            if reply.ping_id == ping_id {
                                break Some(reply);
                            }
                        }
                    }
                    Ok(_) => continue,
                    Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
                    Err(e) => return Err(e),
                }
            };

            let Some(reply) = reply else {
                continue; // lost ping, retransmit (bounded by max_attempts)
            };

            let now = Instant::now();
            let rtt = now.duration_since(send_time);
            let client_now_ticks = clock.now_rtp_timestamp();
            let half_rtt_ticks =
                (rtt.as_secs_f64() * crate::rtp::clock::RTP_CLOCK_RATE as f64 / 2.0) as i64;
            let expected = client_now_ticks as i64 - half_rtt_ticks;
            let err_ticks = reply.reply_timestamp as i64 - expected;
            let err_us = (err_ticks as f64 * 1_000_000.0 / crate::rtp::clock::RTP_CLOCK_RATE as f64) as i64;

            if err_us.abs() as i64 > CLOCK_ERROR_THRESHOLD_US {
                clock.move_epoch(err_us);
            }
            successes += 1;
        }

        let sync_finished = [FieldType::SyncFinished as u8, 1, 0, 0];
        udp.send_to(&sync_finished, server_addr)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn candidate_expiry_uses_three_times_interval_plus_margin() {
        let now = Instant::now();
        let c = Candidate {
            addr: std::net::SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9000),
            last_seen: now - Duration::from_secs(5),
            interval: Duration::from_secs(1),
        };
        assert!(c.is_expired(now));
        let fresh = Candidate {
            last_seen: now,
            ..c
        };
        assert!(!fresh.is_expired(now));
    }

    #[test]
    fn discover_one_candidate_from_broadcast() {
        let mut client = VrcpClientSocket::new(0).unwrap();
        let advertiser = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let client_addr = client.advertisement_socket.as_ref().unwrap().local_addr().unwrap();

        let ad = Advertisement {
            tcp_port: 9000,
            interval_seconds: 1,
            unix_seconds: 0,
        };
        advertiser.send_to(&ad.encode(), client_addr).unwrap();

        for _ in 0..50 {
            client.poll_discovery().unwrap();
            if !client.candidates().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(client.candidates().len(), 1);
        assert_eq!(client.candidates()[0].addr.port(), 9000);
    }
}
