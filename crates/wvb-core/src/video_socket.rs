//! Video socket wrapper (spec §4.2/§4.6 note): a thin enum-dispatch shim
//! that hides which transport/codec discipline is in play behind one
//! `send_frame`/`receive_packet` surface, so the pipeline worker and the
//! client coordinator don't need to know whether they are talking TCP+raw
//! bytestream or UDP+H.264 RTP.

use crate::error::{Error, Result};
use crate::net::tcp::TcpSocket;
use crate::net::udp::UdpSocket;
use crate::rtp::h264::{H264Depacketizer, H264Packetizer, H264JitterDepacketizer};
use crate::rtp::jitter::JitterBuffer;
use crate::simple::{AssembledFrame, SimpleDepacketizer, SimplePacketizer};

/// One assembled video frame ready for the decoder, regardless of which
/// transport produced it.
pub struct ReceivedFrame {
    pub payload: Vec<u8>,
    pub rtp_sample_timestamp: u32,
    pub rtp_pose_timestamp: u32,
    pub frame_id: u64,
    pub should_save_frame: bool,
    pub end_of_stream: bool,
}

enum Sender {
    Tcp { socket: TcpSocket, packetizer: SimplePacketizer },
    Udp { socket: UdpSocket, packetizer: H264Packetizer, peer: std::net::SocketAddr },
}

enum Receiver {
    Tcp { socket: TcpSocket, depacketizer: SimpleDepacketizer },
    Udp { socket: UdpSocket, depacketizer: H264JitterDepacketizer },
}

/// The sending half of a video socket, chosen once at construction
/// (mirrors the compile-time transport choice described for the video
/// socket wrapper).
pub struct VideoSender(Sender);

impl VideoSender {
    pub fn new_tcp(socket: TcpSocket) -> Self {
        Self(Sender::Tcp {
            socket,
            packetizer: SimplePacketizer,
        })
    }

    pub fn new_udp(socket: UdpSocket, ssrc: u32, peer: std::net::SocketAddr) -> Self {
        Self(Sender::Udp {
            socket,
            packetizer: H264Packetizer::new(ssrc),
            peer,
        })
    }

    /// Send one encoded frame. `payload` is a raw codec bytestream for the
    /// TCP/Simple path (one length-prefixed write) or an Annex-B H.264
    /// access unit for the UDP/RTP path (packetized into one or more RTP
    /// packets, possibly FU-A fragmented).
    pub fn send_frame(
        &mut self,
        payload: &[u8],
        rtp_sample_timestamp: u32,
        rtp_pose_timestamp: u32,
        frame_id: u64,
        should_save_frame: bool,
        end_of_stream: bool,
    ) -> Result<()> {
        match &mut self.0 {
            Sender::Tcp { socket, packetizer } => {
                let framed = packetizer.packetize(
                    payload,
                    rtp_sample_timestamp,
                    rtp_pose_timestamp,
                    frame_id as u32,
                    should_save_frame,
                    end_of_stream,
                );
                socket.send_all_with_budget(&framed, std::time::Duration::from_millis(500))
            }
            Sender::Udp { socket, packetizer, peer } => {
                let packets = packetizer.packetize(
                    payload,
                    rtp_sample_timestamp,
                    rtp_pose_timestamp,
                    frame_id as u32,
                );
                for packet in packets {
                    socket.send_to(&packet, *peer)?;
                }
                Ok(())
            }
        }
    }
}

/// The receiving half of a video socket.
pub struct VideoReceiver(Receiver);

impl VideoReceiver {
    pub fn new_tcp(socket: TcpSocket) -> Self {
        Self(Receiver::Tcp {
            socket,
            depacketizer: SimpleDepacketizer::new(),
        })
    }

    pub fn new_udp(socket: UdpSocket) -> Self {
        Self(Receiver::Udp {
            socket,
            depacketizer: JitterBuffer::new(H264Depacketizer::new()),
        })
    }

    pub fn set_catchup_enabled(&mut self, enabled: bool) {
        if let Receiver::Tcp { depacketizer, .. } = &mut self.0 {
            depacketizer.set_catchup_enabled(enabled);
        }
    }

    /// Pump the underlying socket once and return any frame(s) that became
    /// available as a result. Never blocks; callers loop on
    /// `Err(Error::WouldBlock)`.
    pub fn poll(&mut self) -> Result<Vec<ReceivedFrame>> {
        match &mut self.0 {
            Receiver::Tcp { socket, depacketizer } => {
                let mut buf = [0u8; 65536];
                let n = socket.recv(&mut buf)?;
                depacketizer.add_bytes(&buf[..n]);
                let mut frames = Vec::new();
                while let Some(AssembledFrame { header, payload }) = depacketizer.receive_frame_data() {
                    frames.push(ReceivedFrame {
                        payload,
                        rtp_sample_timestamp: header.rtp_sample_timestamp,
                        rtp_pose_timestamp: header.rtp_pose_timestamp,
                        frame_id: header.frame_id as u64,
                        should_save_frame: header.should_save_frame(),
                        end_of_stream: header.is_end_of_stream(),
                    });
                    depacketizer.release_frame_data();
                }
                Ok(frames)
            }
            Receiver::Udp { socket, depacketizer } => {
                let mut buf = [0u8; crate::rtp::jitter::MTU];
                let n = socket.recv_from(&mut buf).map(|(n, _)| n)?;
                depacketizer.add_raw_packet(&buf[..n]);
                let nals = depacketizer.sink_mut().take_frames();
                if nals.is_empty() {
                    return Ok(Vec::new());
                }
                // Each completed frame here is a fully reassembled Annex-B
                // access unit; header timestamps belong to the RTP layer,
                // not the H.264 payload itself, so callers that need them
                // correlate via the frame-info queue keyed on frame_id.
                Ok(nals
                    .into_iter()
                    .map(|payload| ReceivedFrame {
                        payload,
                        rtp_sample_timestamp: 0,
                        rtp_pose_timestamp: 0,
                        frame_id: 0,
                        should_save_frame: false,
                        end_of_stream: false,
                    })
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn tcp_send_then_receive_one_frame() {
        let mut listener = TcpSocket::new();
        listener
            .listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let mut client = TcpSocket::new();
        loop {
            match client.connect(addr) {
                Ok(()) => break,
                Err(Error::WouldBlock) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("{e:?}"),
            }
        }
        loop {
            match listener.accept() {
                Ok(()) => break,
                Err(Error::WouldBlock) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("{e:?}"),
            }
        }

        let mut sender = VideoSender::new_tcp(client);
        sender
            .send_frame(b"frame-bytes", 1000, 900, 1, false, false)
            .unwrap();

        let mut receiver = VideoReceiver::new_tcp(listener);
        let mut frames = Vec::new();
        for _ in 0..50 {
            match receiver.poll() {
                Ok(f) => {
                    frames.extend(f);
                    if !frames.is_empty() {
                        break;
                    }
                }
                Err(Error::WouldBlock) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("{e:?}"),
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"frame-bytes");
        assert_eq!(frames[0].rtp_sample_timestamp, 1000);
    }
}
