//! H.264 RTP packetizer/depacketizer (RFC 6184): Annex-B NAL scanning and
//! FU-A fragmentation on the send side, reassembly on the receive side
//! built on [`crate::rtp::jitter::JitterBuffer`].

use crate::rtp::header::{PT_H264, RtpHeader, RtpHeaderWriter};
use crate::rtp::jitter::{JitterBuffer, MTU, PacketSink};

/// Margin subtracted from the MTU before a NAL is considered fragmentable,
/// leaving room for the 20-byte RTP header.
const PAYLOAD_BUDGET: usize = MTU - 20;

/// H.264 RTP packetizer (RFC 6184): Annex-B NAL scanning, single-NAL or
/// FU-A fragmentation, marker bit on the last packet of a frame.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeaderWriter,
}

impl H264Packetizer {
    pub fn new(ssrc: u32) -> Self {
        Self {
            header: RtpHeaderWriter::new(PT_H264, ssrc),
        }
    }

    /// Extract NAL units from an Annex-B bytestream, handling both 3-byte
    /// and 4-byte start codes.
    pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
        let mut starts: Vec<(usize, usize)> = Vec::new();
        let mut i = 0usize;
        while i < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
                starts.push((i + 4, 4));
                i += 4;
            } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
                starts.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        let mut units = Vec::with_capacity(starts.len());
        for (idx, &(start, _)) in starts.iter().enumerate() {
            let end = starts
                .get(idx + 1)
                .map(|&(next_start, next_sc_len)| next_start - next_sc_len)
                .unwrap_or(data.len());
            if start < end {
                units.push(&data[start..end]);
            }
        }
        units
    }

    /// Packetize one Annex-B frame into RTP packets, advancing the RTP
    /// timestamp to `timestamp` and setting the marker bit on the final
    /// packet, plus the pose/frame-id application extension fields.
    pub fn packetize(
        &mut self,
        annex_b: &[u8],
        timestamp: u32,
        pose_timestamp_ext: u32,
        frame_id_ext: u32,
    ) -> Vec<Vec<u8>> {
        self.header.set_timestamp(timestamp);
        let nals = Self::extract_nal_units(annex_b);
        let mut out = Vec::new();
        for (i, nal) in nals.iter().enumerate() {
            let is_last = i == nals.len() - 1;
            self.packetize_nal(nal, is_last, pose_timestamp_ext, frame_id_ext, &mut out);
        }
        out
    }

    fn packetize_nal(
        &mut self,
        nal: &[u8],
        is_last_nal: bool,
        pose_ts: u32,
        frame_id: u32,
        out: &mut Vec<Vec<u8>>,
    ) {
        if nal.is_empty() {
            return;
        }

        if nal.len() <= PAYLOAD_BUDGET {
            let header = self.header.next(is_last_nal, pose_ts, frame_id);
            let mut packet = Vec::with_capacity(20 + nal.len());
            packet.extend_from_slice(&header.write());
            packet.extend_from_slice(nal);
            out.push(packet);
            return;
        }

        let nal_header = nal[0];
        let nal_type = nal_header & 0x1f;
        let nri = nal_header & 0x60;
        let fu_indicator = nri | 28;
        let payload = &nal[1..];
        let max_fragment = PAYLOAD_BUDGET - 2;

        let mut offset = 0usize;
        let mut first = true;
        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let last_fragment = remaining <= max_fragment;
            let chunk_size = remaining.min(max_fragment);
            let chunk = &payload[offset..offset + chunk_size];

            let s_bit = if first { 0x80 } else { 0x00 };
            let e_bit = if last_fragment { 0x40 } else { 0x00 };
            let fu_header = s_bit | e_bit | nal_type;

            let marker = is_last_nal && last_fragment;
            let header = self.header.next(marker, pose_ts, frame_id);

            let mut packet = Vec::with_capacity(20 + 2 + chunk.len());
            packet.extend_from_slice(&header.write());
            packet.push(fu_indicator);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            out.push(packet);

            offset += chunk_size;
            first = false;
        }
    }
}

/// Reassembled-NAL sink, collecting complete Annex-B frames from the
/// jitter buffer.
#[derive(Default)]
pub struct H264Depacketizer {
    /// The NAL currently being reassembled (start code + header + payload).
    current_nal: Vec<u8>,
    /// Index into `current_nal` of the NAL header byte, so a later dropped
    /// fragment can toggle its F-bit. Kept as an offset into the owned
    /// `Vec` rather than a raw pointer, since there is only one buffer.
    nal_header_offset: Option<usize>,
    fu_in_progress: bool,
    fu_has_start: bool,
    last_fu_seq: Option<u16>,
    fu_corrupted: bool,
    /// Completed NAL units (without start codes) for the current frame, in
    /// order.
    completed_nals: Vec<Vec<u8>>,
    frames_completed: Vec<Vec<u8>>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain completed Annex-B frames (start-code-prefixed, NALs
    /// concatenated) produced since the last call.
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.frames_completed)
    }

    fn start_code_for(is_first: bool) -> &'static [u8] {
        if is_first { &[0, 0, 0, 1] } else { &[0, 0, 1] }
    }

    fn finish_nal(&mut self) {
        if !self.current_nal.is_empty() {
            self.completed_nals.push(std::mem::take(&mut self.current_nal));
        }
        self.nal_header_offset = None;
    }

    fn abandon_fu(&mut self) {
        self.current_nal.clear();
        self.fu_in_progress = false;
        self.fu_has_start = false;
        self.nal_header_offset = None;
    }
}

impl PacketSink for H264Depacketizer {
    fn process_packet(&mut self, header: &RtpHeader, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }

        let nal_type = payload[0] & 0x1f;

        if nal_type != 28 {
            // Self-contained NAL. If an FU was in progress, it was never
            // completed: mark corruption on its reassembled header.
            if self.fu_in_progress {
                self.fu_corrupted = true;
                if let Some(off) = self.nal_header_offset {
                    self.current_nal[off] |= 0x80; // F-bit
                }
                self.finish_nal();
                self.fu_in_progress = false;
                self.fu_has_start = false;
            }

            let is_first = self.completed_nals.is_empty() && self.current_nal.is_empty();
            self.current_nal
                .extend_from_slice(Self::start_code_for(is_first));
            self.nal_header_offset = Some(self.current_nal.len());
            self.current_nal.extend_from_slice(payload);
            self.finish_nal();
        } else {
            if payload.len() < 2 {
                return;
            }
            let fu_indicator = payload[0];
            let fu_header = payload[1];
            let s_bit = fu_header & 0x80 != 0;
            let e_bit = fu_header & 0x40 != 0;
            let original_type = fu_header & 0x1f;
            let nri = fu_indicator & 0x60;

            if s_bit {
                self.fu_in_progress = true;
                self.fu_has_start = true;
                self.fu_corrupted = false;
                self.last_fu_seq = Some(header.sequence);

                let is_first = self.completed_nals.is_empty() && self.current_nal.is_empty();
                self.current_nal
                    .extend_from_slice(Self::start_code_for(is_first));
                self.nal_header_offset = Some(self.current_nal.len());
                self.current_nal.push(nri | original_type);
                self.current_nal.extend_from_slice(&payload[2..]);
            } else {
                let gap = match self.last_fu_seq {
                    Some(prev) => header.sequence != prev.wrapping_add(1),
                    None => true,
                };

                if !self.fu_has_start || gap {
                    self.fu_corrupted = true;
                    if let Some(off) = self.nal_header_offset {
                        self.current_nal[off] |= 0x80;
                    }
                    // Drop remaining fragments of this unit until E-bit.
                    if e_bit {
                        self.finish_nal();
                        self.fu_in_progress = false;
                        self.fu_has_start = false;
                    } else {
                        self.last_fu_seq = Some(header.sequence);
                    }
                    return;
                }

                self.last_fu_seq = Some(header.sequence);
                self.current_nal.extend_from_slice(&payload[2..]);

                if e_bit {
                    self.finish_nal();
                    self.fu_in_progress = false;
                    self.fu_has_start = false;
                }
            }
        }
    }

    fn on_frame_complete(&mut self) {
        if self.fu_in_progress {
            self.abandon_fu();
        }
        if !self.completed_nals.is_empty() {
            let frame = self.completed_nals.concat();
            self.frames_completed.push(frame);
        }
        self.completed_nals.clear();
    }
}

/// H.264 depacketizer wired to a [`JitterBuffer`], the receive-side
/// counterpart to [`H264Packetizer`].
pub type H264JitterDepacketizer = JitterBuffer<H264Depacketizer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42][..], &[0x68, 0xCE][..]]);
    }

    #[test]
    fn small_nal_single_packet_with_marker() {
        let mut p = H264Packetizer::new(0xAA);
        let frame = [0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0xCC];
        let packets = p.packetize(&frame, 3000, 1, 2);
        assert_eq!(packets.len(), 1);
        let header = RtpHeader::parse(&packets[0]).unwrap();
        assert!(header.marker);
        assert_eq!(header.pose_timestamp_ext, 1);
        assert_eq!(header.frame_id_ext, 2);
    }

    #[test]
    fn large_nal_fragments_with_correct_bits() {
        let mut p = H264Packetizer::new(0xAA);
        let mut nal = vec![0x65u8];
        nal.extend(vec![0xABu8; 3000]);
        let mut frame = vec![0, 0, 0, 1];
        frame.extend_from_slice(&nal);
        let packets = p.packetize(&frame, 3000, 0, 0);
        assert!(packets.len() > 1);

        let first_payload = &packets[0][20..];
        assert_eq!(first_payload[0] & 0x1f, 28); // FU-A
        assert_eq!(first_payload[1] & 0x80, 0x80); // S bit

        let last = packets.last().unwrap();
        let last_payload = &last[20..];
        assert_eq!(last_payload[1] & 0x40, 0x40); // E bit
        let last_header = RtpHeader::parse(last).unwrap();
        assert!(last_header.marker);
    }

    fn pack_and_feed(depack: &mut H264JitterDepacketizer, packets: &[Vec<u8>], drop_index: Option<usize>) {
        for (i, pkt) in packets.iter().enumerate() {
            if Some(i) == drop_index {
                continue;
            }
            let header = RtpHeader::parse(pkt).unwrap();
            depack.add_packet(header, &pkt[20..]);
        }
    }

    #[test]
    fn packetize_then_depacketize_round_trip() {
        let mut p = H264Packetizer::new(0xAA);
        let sps = [0x67u8, 0x42, 0x00, 0x1e];
        let pps = [0x68u8, 0xce, 0x38, 0x80];
        let slice = [0x65u8, 0x88, 0x00];
        let mut frame = Vec::new();
        for nal in [&sps[..], &pps[..], &slice[..]] {
            frame.extend_from_slice(&[0, 0, 0, 1]);
            frame.extend_from_slice(nal);
        }
        let packets = p.packetize(&frame, 3000, 5, 9);

        let mut depack = H264JitterDepacketizer::new(H264Depacketizer::new());
        pack_and_feed(&mut depack, &packets, None);

        let frames = depack.sink_mut().take_frames();
        assert_eq!(frames.len(), 1);
        let reassembled = &frames[0];

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&sps);
        expected.extend_from_slice(&[0, 0, 1]);
        expected.extend_from_slice(&pps);
        expected.extend_from_slice(&[0, 0, 1]);
        expected.extend_from_slice(&slice);
        assert_eq!(reassembled, &expected);
    }

    #[test]
    fn lost_fu_a_fragment_sets_f_bit() {
        let mut p = H264Packetizer::new(0xAA);
        let mut nal = vec![0x65u8];
        nal.extend(vec![0xABu8; 5000]); // forces >=3 fragments
        let mut frame = vec![0, 0, 0, 1];
        frame.extend_from_slice(&nal);
        let packets = p.packetize(&frame, 3000, 0, 0);
        assert!(packets.len() >= 3, "need at least 3 fragments for this test");

        let mut depack = H264JitterDepacketizer::new(H264Depacketizer::new());
        // Drop the middle fragment.
        let drop_idx = packets.len() / 2;
        pack_and_feed(&mut depack, &packets, Some(drop_idx));

        let frames = depack.sink_mut().take_frames();
        assert_eq!(frames.len(), 1);
        let reassembled = &frames[0];
        // F-bit (forbidden zero bit) of the reconstructed NAL header must be set.
        let nal_header_byte = reassembled[4]; // after 4-byte start code
        assert_eq!(nal_header_byte & 0x80, 0x80);
    }

    #[test]
    fn no_loss_f_bit_is_clear() {
        let mut p = H264Packetizer::new(0xAA);
        let mut nal = vec![0x65u8];
        nal.extend(vec![0xABu8; 3000]);
        let mut frame = vec![0, 0, 0, 1];
        frame.extend_from_slice(&nal);
        let packets = p.packetize(&frame, 3000, 0, 0);

        let mut depack = H264JitterDepacketizer::new(H264Depacketizer::new());
        pack_and_feed(&mut depack, &packets, None);

        let frames = depack.sink_mut().take_frames();
        let nal_header_byte = frames[0][4];
        assert_eq!(nal_header_byte & 0x80, 0);
    }
}
