//! Simple (TCP) packetizer/depacketizer: length-prefixed framing for
//! reliable, ordered video transport (spec §4.5, §6.3), as an alternative
//! to the RTP/H.264 path for deployments that pick the TCP video-transport
//! compile-time mode (spec §2 item 11).

use crate::wire::{htonl, ntohl};

/// 20-byte big-endian frame header.
pub const HEADER_SIZE: usize = 20;
/// Number of ring-buffer frame-assembly slots.
pub const FRAMEBUFFER_COUNT: usize = 10;
/// Optional catch-up policy threshold (disabled by default).
pub const CATCHUP_THRESHOLD: usize = 6;

pub const FLAG_END_OF_FRAME: u8 = 0b001;
pub const FLAG_SAVE_FRAME: u8 = 0b010;
pub const FLAG_END_OF_STREAM: u8 = 0b100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleFrameHeader {
    /// Total frame size, header included.
    pub size: u32,
    pub rtp_sample_timestamp: u32,
    pub rtp_pose_timestamp: u32,
    pub frame_id: u32,
    pub flags: u8,
}

impl SimpleFrameHeader {
    pub fn write(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&htonl(self.size));
        buf[4..8].copy_from_slice(&htonl(self.rtp_sample_timestamp));
        buf[8..12].copy_from_slice(&htonl(self.rtp_pose_timestamp));
        buf[12..16].copy_from_slice(&htonl(self.frame_id));
        buf[16] = self.flags;
        buf
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: ntohl([buf[0], buf[1], buf[2], buf[3]]),
            rtp_sample_timestamp: ntohl([buf[4], buf[5], buf[6], buf[7]]),
            rtp_pose_timestamp: ntohl([buf[8], buf[9], buf[10], buf[11]]),
            frame_id: ntohl([buf[12], buf[13], buf[14], buf[15]]),
            flags: buf[16],
        })
    }

    pub fn is_end_of_frame(&self) -> bool {
        self.flags & FLAG_END_OF_FRAME != 0
    }

    pub fn should_save_frame(&self) -> bool {
        self.flags & FLAG_SAVE_FRAME != 0
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & FLAG_END_OF_STREAM != 0
    }
}

/// Packetizer: wraps a codec bytestream frame with the 20-byte header.
#[derive(Debug, Default)]
pub struct SimplePacketizer;

impl SimplePacketizer {
    pub fn packetize(
        &self,
        payload: &[u8],
        rtp_sample_timestamp: u32,
        rtp_pose_timestamp: u32,
        frame_id: u32,
        save_frame: bool,
        end_of_stream: bool,
    ) -> Vec<u8> {
        let mut flags = FLAG_END_OF_FRAME;
        if save_frame {
            flags |= FLAG_SAVE_FRAME;
        }
        if end_of_stream {
            flags |= FLAG_END_OF_STREAM;
        }
        let header = SimpleFrameHeader {
            size: (HEADER_SIZE + payload.len()) as u32,
            rtp_sample_timestamp,
            rtp_pose_timestamp,
            frame_id,
            flags,
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&header.write());
        out.extend_from_slice(payload);
        out
    }
}

/// One frame-assembly slot in the depacketizer's ring buffer.
#[derive(Debug, Clone, Default)]
struct Slot {
    header: Option<SimpleFrameHeader>,
    data: Vec<u8>,
    ready: bool,
    consumed: bool,
}

/// A completed, assembled frame returned to the caller.
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub header: SimpleFrameHeader,
    pub payload: Vec<u8>,
}

/// Depacketizer: reassembles the length-prefixed stream into frames,
/// tolerating TCP's arbitrary segmentation (a single `recv` may deliver
/// less than one frame, exactly one, or several frames' worth of bytes).
///
/// `FRAMEBUFFER_COUNT` mutex-guarded ring slots (here modeled as plain
/// fields behind the depacketizer's own `&mut self`, since locking is
/// this struct's owner's responsibility, not this type's) hold frames
/// in flight; the tail advances as `add_bytes` completes frames, and the
/// head advances as the caller calls `receive_frame_data` /
/// `release_frame_data`. If the tail would overwrite an un-consumed head,
/// the head slot is skipped (oldest dropped).
pub struct SimpleDepacketizer {
    slots: Vec<Slot>,
    tail: usize,
    head: usize,
    count: usize,
    catchup_enabled: bool,
}

impl SimpleDepacketizer {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::default(); FRAMEBUFFER_COUNT],
            tail: 0,
            head: 0,
            count: 0,
            catchup_enabled: false,
        }
    }

    pub fn set_catchup_enabled(&mut self, enabled: bool) {
        self.catchup_enabled = enabled;
    }

    fn advance_tail(&mut self) {
        self.tail = (self.tail + 1) % FRAMEBUFFER_COUNT;
        self.count += 1;
    }

    /// Feed newly-received bytes. May contain a partial frame, exactly one
    /// frame, or the tail of one frame plus the start of the next: the
    /// remainder beyond the current frame's `size` is recursed into the
    /// next slot.
    pub fn add_bytes(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            // The tail has wrapped all the way around onto a slot that
            // still holds a completed, un-consumed frame: the ring is
            // full. Drop that oldest frame (always the head, which
            // coincides with the tail here) before writing into its slot,
            // rather than clobbering it and leaving `count` stale.
            if self.slots[self.tail].ready && self.count == FRAMEBUFFER_COUNT {
                tracing::warn!("simple depacketizer ring full, dropped oldest frame");
                self.drop_oldest_unconsumed();
            }

            let slot = &mut self.slots[self.tail];

            if slot.header.is_none() {
                let have = slot.data.len();
                let need = HEADER_SIZE - have;
                let take = need.min(bytes.len());
                slot.data.extend_from_slice(&bytes[..take]);
                bytes = &bytes[take..];
                if slot.data.len() == HEADER_SIZE {
                    let header = SimpleFrameHeader::parse(&slot.data).expect("20 bytes buffered");
                    slot.header = Some(header);
                }
                continue;
            }

            let header = slot.header.unwrap();
            let target_size = header.size as usize;
            let have = slot.data.len();
            let need = target_size.saturating_sub(have);
            let take = need.min(bytes.len());
            slot.data.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if slot.data.len() >= target_size {
                slot.ready = true;
                self.advance_tail();
            }

            if self.catchup_enabled && self.count > CATCHUP_THRESHOLD {
                self.drop_oldest_unconsumed();
            }
        }
    }

    fn drop_oldest_unconsumed(&mut self) {
        if self.count > 0 {
            self.slots[self.head] = Slot::default();
            self.head = (self.head + 1) % FRAMEBUFFER_COUNT;
            self.count -= 1;
            tracing::debug!("catch-up policy dropped oldest queued frame");
        }
    }

    /// Returns a reference into the head slot if it holds a ready,
    /// unconsumed frame (the real API hands back a raw pointer the caller
    /// must release; here the slot is simply borrowed until
    /// [`release_frame_data`](Self::release_frame_data) is called).
    pub fn receive_frame_data(&self) -> Option<AssembledFrame> {
        if self.count == 0 {
            return None;
        }
        let slot = &self.slots[self.head];
        if slot.ready && !slot.consumed {
            Some(AssembledFrame {
                header: slot.header.unwrap(),
                payload: slot.data[HEADER_SIZE..].to_vec(),
            })
        } else {
            None
        }
    }

    /// Release the head slot, advancing past it.
    pub fn release_frame_data(&mut self) {
        if self.count == 0 {
            return;
        }
        self.slots[self.head] = Slot::default();
        self.head = (self.head + 1) % FRAMEBUFFER_COUNT;
        self.count -= 1;
    }

    pub fn queued_frames(&self) -> usize {
        self.count
    }
}

impl Default for SimpleDepacketizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_whole_write() {
        let p = SimplePacketizer::default();
        let bytes = p.packetize(b"payload", 100, 50, 1, false, false);

        let mut d = SimpleDepacketizer::new();
        d.add_bytes(&bytes);

        let frame = d.receive_frame_data().unwrap();
        assert_eq!(frame.payload, b"payload");
        assert_eq!(frame.header.frame_id, 1);
        assert!(frame.header.is_end_of_frame());
    }

    #[test]
    fn split_across_many_small_segments() {
        let p = SimplePacketizer::default();
        let bytes = p.packetize(&vec![0xABu8; 500], 10, 20, 3, true, false);

        let mut d = SimpleDepacketizer::new();
        for chunk in bytes.chunks(7) {
            d.add_bytes(chunk);
        }

        let frame = d.receive_frame_data().unwrap();
        assert_eq!(frame.payload.len(), 500);
        assert!(frame.header.should_save_frame());
    }

    #[test]
    fn multiple_frames_in_one_recv_are_all_assembled() {
        let p = SimplePacketizer::default();
        let mut bytes = Vec::new();
        for id in 0..3u32 {
            bytes.extend_from_slice(&p.packetize(b"x", id, id, id, false, false));
        }

        let mut d = SimpleDepacketizer::new();
        d.add_bytes(&bytes);
        assert_eq!(d.queued_frames(), 3);

        for id in 0..3u32 {
            let frame = d.receive_frame_data().unwrap();
            assert_eq!(frame.header.frame_id, id);
            d.release_frame_data();
        }
        assert_eq!(d.queued_frames(), 0);
    }

    #[test]
    fn ring_full_drops_oldest_unconsumed() {
        let p = SimplePacketizer::default();
        let mut d = SimpleDepacketizer::new();
        for id in 0..(FRAMEBUFFER_COUNT as u32 + 2) {
            let bytes = p.packetize(b"x", id, id, id, false, false);
            d.add_bytes(&bytes);
        }
        assert_eq!(d.queued_frames(), FRAMEBUFFER_COUNT);
        // Oldest two (0, 1) were dropped; head should now be frame 2.
        let frame = d.receive_frame_data().unwrap();
        assert_eq!(frame.header.frame_id, 2);
    }

    #[test]
    fn catchup_policy_drops_when_enabled_and_over_threshold() {
        let p = SimplePacketizer::default();
        let mut d = SimpleDepacketizer::new();
        d.set_catchup_enabled(true);
        for id in 0..(CATCHUP_THRESHOLD as u32 + 3) {
            let bytes = p.packetize(b"x", id, id, id, false, false);
            d.add_bytes(&bytes);
        }
        assert!(d.queued_frames() <= CATCHUP_THRESHOLD);
    }
}
