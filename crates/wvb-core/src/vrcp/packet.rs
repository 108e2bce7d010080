//! VRCP packet encode/decode (spec §6.1).

use super::{
    BaseHeader, FieldType, RejectReason, ROW_SIZE, Tlv, push_u16, push_u32, push_u64, read_u16,
    read_u32, read_u64,
};

fn rows_for(len: usize) -> u8 {
    len.div_ceil(ROW_SIZE) as u8
}

/// `SERVER_ADVERTISEMENT` (12 B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub tcp_port: u16,
    pub interval_seconds: u8,
    pub unix_seconds: u32,
}

impl Advertisement {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BaseHeader {
            ftype: FieldType::ServerAdvertisement as u8,
            n_rows: rows_for(12),
        }
        .write()
        .to_vec();
        buf.push(super::ADVERTISEMENT_MAGIC);
        buf.push(super::PROTOCOL_VERSION);
        push_u16(&mut buf, self.tcp_port);
        buf.push(self.interval_seconds);
        buf.push(0);
        push_u32(&mut buf, self.unix_seconds);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (header, len) = BaseHeader::parse(buf)?;
        if header.ftype != FieldType::ServerAdvertisement as u8 || len < 12 {
            return None;
        }
        if buf[4] != super::ADVERTISEMENT_MAGIC || buf[5] != super::PROTOCOL_VERSION {
            return None;
        }
        Some(Self {
            tcp_port: read_u16(buf, 6),
            interval_seconds: buf[8],
            unix_seconds: read_u32(buf, 10),
        })
    }
}

/// `CONN_REQ` (variable length, base + fixed fields + TLVs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnReq {
    pub version: u8,
    /// 0 = TCP video transport, 1 = UDP video transport.
    pub video_mode: u8,
    pub udp_vrcp_port: u16,
    pub video_port: u16,
    pub eye_width: u16,
    pub eye_height: u16,
    pub refresh_rate_num: u16,
    pub refresh_rate_den: u16,
    pub ipd_bits: u32,
    pub eye_to_head_bits: u32,
    pub world_width_bits: u32,
    pub world_height_bits: u32,
    pub ntp_timestamp: u64,
    pub manufacturer_name: String,
    pub system_name: String,
    pub supported_video_codecs: Vec<String>,
}

const CONN_REQ_FIXED_LEN: usize = 1 + 1 + 2 + 2 + 2 + 2 + 2 + 2 + 4 + 4 + 4 + 4 + 8;

impl ConnReq {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(CONN_REQ_FIXED_LEN);
        body.push(self.version);
        body.push(self.video_mode);
        push_u16(&mut body, self.udp_vrcp_port);
        push_u16(&mut body, self.video_port);
        push_u16(&mut body, self.eye_width);
        push_u16(&mut body, self.eye_height);
        push_u16(&mut body, self.refresh_rate_num);
        push_u16(&mut body, self.refresh_rate_den);
        push_u32(&mut body, self.ipd_bits);
        push_u32(&mut body, self.eye_to_head_bits);
        push_u32(&mut body, self.world_width_bits);
        push_u32(&mut body, self.world_height_bits);
        push_u64(&mut body, self.ntp_timestamp);

        body.extend(
            Tlv {
                field_type: FieldType::ManufacturerNameTlv,
                value: self.manufacturer_name.as_bytes().to_vec(),
            }
            .encode(),
        );
        body.extend(
            Tlv {
                field_type: FieldType::SystemNameTlv,
                value: self.system_name.as_bytes().to_vec(),
            }
            .encode(),
        );
        body.extend(
            Tlv {
                field_type: FieldType::SupportedVideoCodecsTlv,
                value: self.supported_video_codecs.join(",").into_bytes(),
            }
            .encode(),
        );

        let mut out = BaseHeader {
            ftype: FieldType::ConnReq as u8,
            n_rows: rows_for(ROW_SIZE + body.len()),
        }
        .write()
        .to_vec();
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (header, len) = BaseHeader::parse(buf)?;
        if header.ftype != FieldType::ConnReq as u8 || len < ROW_SIZE + CONN_REQ_FIXED_LEN {
            return None;
        }
        let b = &buf[ROW_SIZE..len];
        let version = b[0];
        let video_mode = b[1];
        let udp_vrcp_port = read_u16(b, 2);
        let video_port = read_u16(b, 4);
        let eye_width = read_u16(b, 6);
        let eye_height = read_u16(b, 8);
        let refresh_rate_num = read_u16(b, 10);
        let refresh_rate_den = read_u16(b, 12);
        let ipd_bits = read_u32(b, 14);
        let eye_to_head_bits = read_u32(b, 18);
        let world_width_bits = read_u32(b, 22);
        let world_height_bits = read_u32(b, 26);
        let ntp_timestamp = read_u64(b, 30);

        let mut manufacturer_name = String::new();
        let mut system_name = String::new();
        let mut supported_video_codecs = Vec::new();

        let mut off = CONN_REQ_FIXED_LEN;
        while off + 3 <= b.len() {
            match Tlv::parse(&b[off..]) {
                Some((field_type, value, consumed)) => {
                    match field_type {
                        FieldType::ManufacturerNameTlv => {
                            manufacturer_name = String::from_utf8_lossy(&value).into_owned();
                        }
                        FieldType::SystemNameTlv => {
                            system_name = String::from_utf8_lossy(&value).into_owned();
                        }
                        FieldType::SupportedVideoCodecsTlv => {
                            supported_video_codecs = String::from_utf8_lossy(&value)
                                .split(',')
                                .filter(|s| !s.is_empty())
                                .map(String::from)
                                .collect();
                        }
                        _ => {}
                    }
                    off += consumed;
                }
                None => break,
            }
        }

        Some(Self {
            version,
            video_mode,
            udp_vrcp_port,
            video_port,
            eye_width,
            eye_height,
            refresh_rate_num,
            refresh_rate_den,
            ipd_bits,
            eye_to_head_bits,
            world_width_bits,
            world_height_bits,
            ntp_timestamp,
            manufacturer_name,
            system_name,
            supported_video_codecs,
        })
    }
}

/// `CONN_ACCEPT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAccept {
    pub udp_vrcp_port: u16,
    pub video_port: u16,
    pub chosen_video_codec: String,
}

impl ConnAccept {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        push_u16(&mut body, self.udp_vrcp_port);
        push_u16(&mut body, self.video_port);
        body.extend(
            Tlv {
                field_type: FieldType::ChosenVideoCodecTlv,
                value: self.chosen_video_codec.as_bytes().to_vec(),
            }
            .encode(),
        );

        let mut out = BaseHeader {
            ftype: FieldType::ConnAccept as u8,
            n_rows: rows_for(ROW_SIZE + body.len()),
        }
        .write()
        .to_vec();
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (header, len) = BaseHeader::parse(buf)?;
        if header.ftype != FieldType::ConnAccept as u8 || len < ROW_SIZE + 4 {
            return None;
        }
        let b = &buf[ROW_SIZE..len];
        let udp_vrcp_port = read_u16(b, 0);
        let video_port = read_u16(b, 2);
        let (_, value, _) = Tlv::parse(&b[4..])?;
        Some(Self {
            udp_vrcp_port,
            video_port,
            chosen_video_codec: String::from_utf8_lossy(&value).into_owned(),
        })
    }
}

/// `CONN_REJECT` (4 B): reason in byte[2], data in byte[3].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnReject {
    pub reason: RejectReason,
    pub data: u8,
}

impl ConnReject {
    pub fn encode(&self) -> [u8; 4] {
        [FieldType::ConnReject as u8, 1, self.reason as u8, self.data]
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (header, len) = BaseHeader::parse(buf)?;
        if header.ftype != FieldType::ConnReject as u8 || len < 4 {
            return None;
        }
        let reason = match buf[2] {
            1 => RejectReason::GenericError,
            2 => RejectReason::VersionMismatch,
            3 => RejectReason::InvalidVrcpPort,
            4 => RejectReason::InvalidVideoPort,
            5 => RejectReason::InvalidEyeSize,
            6 => RejectReason::InvalidRefreshRate,
            7 => RejectReason::InvalidManufacturerName,
            8 => RejectReason::InvalidSystemName,
            9 => RejectReason::InvalidVideoCodecs,
            10 => RejectReason::NoSupportedVideoCodec,
            11 => RejectReason::VideoModeMismatch,
            12 => RejectReason::InvalidNtpTimestamp,
            _ => RejectReason::GenericError,
        };
        Some(Self {
            reason,
            data: buf[3],
        })
    }
}

/// `PING` (4 B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub ping_id: u16,
}

impl Ping {
    pub fn encode(&self) -> [u8; 4] {
        let mut buf = [FieldType::Ping as u8, 1, 0, 0];
        buf[2..4].copy_from_slice(&self.ping_id.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (header, len) = BaseHeader::parse(buf)?;
        if header.ftype != FieldType::Ping as u8 || len < 4 {
            return None;
        }
        Some(Self {
            ping_id: read_u16(buf, 2),
        })
    }
}

/// `PING_REPLY` (8 B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    pub ping_id: u16,
    pub reply_timestamp: u32,
}

impl PingReply {
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = FieldType::PingReply as u8;
        buf[1] = 2;
        buf[2..4].copy_from_slice(&self.ping_id.to_be_bytes());
        buf[4..8].copy_from_slice(&crate::wire::htonl(self.reply_timestamp));
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (header, len) = BaseHeader::parse(buf)?;
        if header.ftype != FieldType::PingReply as u8 || len < 8 {
            return None;
        }
        Some(Self {
            ping_id: read_u16(buf, 2),
            reply_timestamp: read_u32(buf, 4),
        })
    }
}

/// `TRACKING_DATA` (72 B): full tracking state, client -> server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingDataPacket {
    pub sample_timestamp: u32,
    pub pose_timestamp: u32,
    pub orientation: [f32; 4],
    pub position: [f32; 3],
    /// Per-eye FoV: `[left, right, up, down]`, left eye then right eye.
    pub fov: [[f32; 4]; 2],
}

impl TrackingDataPacket {
    pub fn encode(&self) -> [u8; 72] {
        let mut buf = [0u8; 72];
        buf[0] = FieldType::TrackingData as u8;
        buf[1] = 18;
        buf[4..8].copy_from_slice(&crate::wire::htonl(self.sample_timestamp));
        buf[8..12].copy_from_slice(&crate::wire::htonl(self.pose_timestamp));
        let mut off = 12;
        for v in self.orientation {
            buf[off..off + 4].copy_from_slice(&crate::wire::htonf(v));
            off += 4;
        }
        for v in self.position {
            buf[off..off + 4].copy_from_slice(&crate::wire::htonf(v));
            off += 4;
        }
        for eye in self.fov {
            for v in eye {
                buf[off..off + 4].copy_from_slice(&crate::wire::htonf(v));
                off += 4;
            }
        }
        debug_assert_eq!(off, 72);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (header, len) = BaseHeader::parse(buf)?;
        if header.ftype != FieldType::TrackingData as u8 || len < 72 {
            return None;
        }
        let read_f32 = |off: usize| crate::wire::ntohf([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let sample_timestamp = read_u32(buf, 4);
        let pose_timestamp = read_u32(buf, 8);
        let mut off = 12;
        let mut orientation = [0f32; 4];
        for v in &mut orientation {
            *v = read_f32(off);
            off += 4;
        }
        let mut position = [0f32; 3];
        for v in &mut position {
            *v = read_f32(off);
            off += 4;
        }
        let mut fov = [[0f32; 4]; 2];
        for eye in &mut fov {
            for v in eye {
                *v = read_f32(off);
                off += 4;
            }
        }
        Some(Self {
            sample_timestamp,
            pose_timestamp,
            orientation,
            position,
            fov,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertisement_round_trip() {
        let a = Advertisement {
            tcp_port: 9000,
            interval_seconds: 1,
            unix_seconds: 1_700_000_000,
        };
        let decoded = Advertisement::decode(&a.encode()).unwrap();
        assert_eq!(a, decoded);
    }

    #[test]
    fn conn_req_round_trip_with_tlvs() {
        let req = ConnReq {
            version: 1,
            video_mode: 1,
            udp_vrcp_port: 7000,
            video_port: 7001,
            eye_width: 1832,
            eye_height: 1920,
            refresh_rate_num: 90,
            refresh_rate_den: 1,
            ipd_bits: 0.063f32.to_bits(),
            eye_to_head_bits: 0.01f32.to_bits(),
            world_width_bits: 4.0f32.to_bits(),
            world_height_bits: 4.0f32.to_bits(),
            ntp_timestamp: 3_912_345_678,
            manufacturer_name: "Acme".into(),
            system_name: "Widget HMD".into(),
            supported_video_codecs: vec!["h264".into(), "h265".into()],
        };
        let decoded = ConnReq::decode(&req.encode()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn conn_accept_round_trip() {
        let a = ConnAccept {
            udp_vrcp_port: 7000,
            video_port: 7001,
            chosen_video_codec: "h264".into(),
        };
        assert_eq!(a, ConnAccept::decode(&a.encode()).unwrap());
    }

    #[test]
    fn conn_reject_round_trip() {
        let r = ConnReject {
            reason: RejectReason::InvalidEyeSize,
            data: 0,
        };
        assert_eq!(r, ConnReject::decode(&r.encode()).unwrap());
    }

    #[test]
    fn ping_and_reply_round_trip() {
        let p = Ping { ping_id: 42 };
        assert_eq!(p, Ping::decode(&p.encode()).unwrap());
        let r = PingReply {
            ping_id: 42,
            reply_timestamp: 123456,
        };
        assert_eq!(r, PingReply::decode(&r.encode()).unwrap());
    }

    #[test]
    fn tracking_data_round_trip() {
        let t = TrackingDataPacket {
            sample_timestamp: 111,
            pose_timestamp: 222,
            orientation: [0.0, 0.0, 0.0, 1.0],
            position: [1.5, -2.0, 0.25],
            fov: [[0.1, 0.2, 0.3, 0.4], [0.5, 0.6, 0.7, 0.8]],
        };
        let buf = t.encode();
        assert_eq!(buf.len(), 72);
        let decoded = TrackingDataPacket::decode(&buf).unwrap();
        assert_eq!(t, decoded);
    }
}
