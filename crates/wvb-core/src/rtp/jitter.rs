//! Shared reorder buffer and jitter tolerance window, generalized over any
//! codec via [`PacketSink`].
//!
//! This is the receive-side counterpart to a send-only RTP packetizer:
//! reassembly of incoming, possibly-reordered RTP into ordered per-frame
//! payloads, built on RFC 3550/6184 vocabulary.

use crate::rtp::clock::compare_rtp_timestamps;
use crate::rtp::header::{HEADER_SIZE, RtpHeader};

/// Number of reorder slots tolerated before the oldest pending packet is
/// forcibly retired.
pub const WVB_EARLY_FRAME_TOLERANCE: usize = 128;

/// Typical network MTU; also the jitter buffer's per-slot capacity.
pub const MTU: usize = 1500;

/// Sink codec-specific depacketizers implement to consume reassembled
/// packets in sequence order.
pub trait PacketSink {
    /// Called once per packet, in sequence order, after jitter-buffer
    /// reordering has placed it in its slot.
    fn process_packet(&mut self, header: &RtpHeader, payload: &[u8]);

    /// Called when the RTP marker bit signals the end of a logical frame,
    /// or when a timestamp change forces an implicit flush.
    fn on_frame_complete(&mut self);
}

#[derive(Clone, Copy, Default)]
struct PacketView {
    slot_index: usize,
    size: usize,
    valid: bool,
}

struct Slot {
    buf: [u8; MTU],
    header: Option<RtpHeader>,
    len: usize,
}

impl Slot {
    fn empty() -> Self {
        Self {
            buf: [0u8; MTU],
            header: None,
            len: 0,
        }
    }
}

/// Jitter-tolerant RTP depacketizer framework: a 128-slot reorder buffer
/// feeding a codec-specific [`PacketSink`] in strict sequence order.
pub struct JitterBuffer<S: PacketSink> {
    slots: Vec<Slot>,
    views: [PacketView; WVB_EARLY_FRAME_TOLERANCE],
    head: usize,
    desired_seq: u16,
    current_timestamp: u32,
    initialized: bool,
    frame_complete: bool,
    sink: S,
}

impl<S: PacketSink> JitterBuffer<S> {
    pub fn new(sink: S) -> Self {
        let slots = (0..WVB_EARLY_FRAME_TOLERANCE).map(|_| Slot::empty()).collect();
        Self {
            slots,
            views: [PacketView::default(); WVB_EARLY_FRAME_TOLERANCE],
            head: 0,
            desired_seq: 0,
            current_timestamp: 0,
            initialized: false,
            frame_complete: false,
            sink,
        }
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn slot_at(&self, distance: usize) -> usize {
        (self.head + distance) % WVB_EARLY_FRAME_TOLERANCE
    }

    /// Feed one RTP packet (header + payload already separated from the
    /// raw datagram). Implements a seven-step reorder/dispatch algorithm.
    pub fn add_packet(&mut self, header: RtpHeader, payload: &[u8]) {
        // Step 1: size/version validation happens before this call, at the
        // raw-datagram layer (see `add_raw_packet`).
        if payload.len() > MTU {
            tracing::warn!(len = payload.len(), "dropping oversized RTP payload");
            return;
        }

        // Step 2: previous frame already signalled complete -> start fresh.
        if self.frame_complete {
            self.frame_complete = false;
        }

        // Step 3: initialize on the very first packet seen.
        if !self.initialized {
            self.desired_seq = header.sequence;
            self.current_timestamp = header.timestamp;
            self.initialized = true;
        }

        // Timestamp change mid-stream with accumulated data: flush as
        // complete (marker assumed lost).
        if header.timestamp != self.current_timestamp
            && compare_rtp_timestamps(self.current_timestamp, header.timestamp)
        {
            self.flush_current_frame();
            self.current_timestamp = header.timestamp;
        }

        // Step 4: drop packets strictly older than the current position.
        if compare_rtp_timestamps(header.timestamp, self.current_timestamp)
            || (header.timestamp == self.current_timestamp
                && seq_is_older(header.sequence, self.desired_seq))
        {
            tracing::trace!(seq = header.sequence, "dropping late RTP packet");
            return;
        }

        // Step 5: bound reordering tolerance.
        let mut d = seq_distance_forward(self.desired_seq, header.sequence);
        while d >= WVB_EARLY_FRAME_TOLERANCE {
            self.advance_head();
            d = seq_distance_forward(self.desired_seq, header.sequence);
        }

        if d == 0 {
            // Step 6: this is the expected packet.
            self.dispatch(&header, payload);
            self.advance_head();
            self.drain_contiguous();
        } else if header.marker {
            // The marker bit ends this frame: no later packet can still
            // resolve a gap before it, so advance past any missing slots
            // now instead of waiting for future traffic to shrink the
            // window. Already-buffered interior packets are dispatched in
            // order as the head passes over them.
            for _ in 0..d {
                self.advance_head();
            }
            self.dispatch(&header, payload);
            self.advance_head();
            self.drain_contiguous();
        } else {
            // Step 7: buffer it for later.
            let slot_idx = self.slot_at(d);
            self.slots[slot_idx].header = Some(header);
            self.slots[slot_idx].buf[..payload.len()].copy_from_slice(payload);
            self.slots[slot_idx].len = payload.len();
            self.views[slot_idx] = PacketView {
                slot_index: slot_idx,
                size: payload.len(),
                valid: true,
            };
        }
    }

    fn dispatch(&mut self, header: &RtpHeader, payload: &[u8]) {
        self.sink.process_packet(header, payload);
        if header.marker {
            self.frame_complete = true;
            self.sink.on_frame_complete();
        }
    }

    fn flush_current_frame(&mut self) {
        if !self.frame_complete {
            self.frame_complete = true;
            self.sink.on_frame_complete();
        }
    }

    /// Advance the head slot by one: process it if buffered, else simply
    /// move the desired-sequence pointer forward.
    fn advance_head(&mut self) {
        let head = self.head;
        if self.views[head].valid {
            let header = self.slots[head].header.take().unwrap();
            let len = self.slots[head].len;
            let mut payload = [0u8; MTU];
            payload[..len].copy_from_slice(&self.slots[head].buf[..len]);
            self.views[head] = PacketView::default();
            self.dispatch(&header, &payload[..len]);
        }
        self.head = (self.head + 1) % WVB_EARLY_FRAME_TOLERANCE;
        self.desired_seq = self.desired_seq.wrapping_add(1);
    }

    /// After processing the expected packet, drain any already-buffered
    /// contiguous successors.
    fn drain_contiguous(&mut self) {
        while self.views[self.head].valid {
            let header = self.slots[self.head].header.take().unwrap();
            let len = self.slots[self.head].len;
            let mut payload = [0u8; MTU];
            payload[..len].copy_from_slice(&self.slots[self.head].buf[..len]);
            self.views[self.head] = PacketView::default();
            self.dispatch(&header, &payload[..len]);
            self.head = (self.head + 1) % WVB_EARLY_FRAME_TOLERANCE;
            self.desired_seq = self.desired_seq.wrapping_add(1);
        }
    }

    /// Validate and parse a raw datagram, rejecting anything too short or
    /// over MTU, then feed it to [`add_packet`](Self::add_packet).
    pub fn add_raw_packet(&mut self, datagram: &[u8]) {
        if datagram.len() < HEADER_SIZE + 2 || datagram.len() >= MTU {
            tracing::trace!(len = datagram.len(), "rejecting malformed RTP datagram");
            return;
        }
        match RtpHeader::parse(datagram) {
            Some(header) => self.add_packet(header, &datagram[HEADER_SIZE..]),
            None => tracing::trace!("rejecting RTP datagram with bad version byte"),
        }
    }
}

/// Forward circular distance from `desired` to `incoming`.
fn seq_distance_forward(desired: u16, incoming: u16) -> usize {
    incoming.wrapping_sub(desired) as usize
}

/// Whether `seq` is strictly behind `reference` in sequence-number space
/// (small forward distance considered "ahead", large one "behind").
fn seq_is_older(seq: u16, reference: u16) -> bool {
    let fwd = seq_distance_forward(reference, seq);
    fwd > (u16::MAX as usize / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingSink {
        payloads: Vec<Vec<u8>>,
        frames: usize,
    }

    impl PacketSink for Rc<RefCell<RecordingSink>> {
        fn process_packet(&mut self, _header: &RtpHeader, payload: &[u8]) {
            self.borrow_mut().payloads.push(payload.to_vec());
        }

        fn on_frame_complete(&mut self) {
            self.borrow_mut().frames += 1;
        }
    }

    fn header(seq: u16, ts: u32, marker: bool) -> RtpHeader {
        RtpHeader {
            marker,
            payload_type: 97,
            sequence: seq,
            timestamp: ts,
            ssrc: 1,
            pose_timestamp_ext: 0,
            frame_id_ext: 0,
        }
    }

    #[test]
    fn in_order_delivery() {
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let mut jb = JitterBuffer::new(sink.clone());
        jb.add_packet(header(0, 100, false), b"a");
        jb.add_packet(header(1, 100, true), b"b");
        assert_eq!(sink.borrow().payloads, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(sink.borrow().frames, 1);
    }

    #[test]
    fn reordered_within_tolerance_is_reassembled_in_order() {
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let mut jb = JitterBuffer::new(sink.clone());
        jb.add_packet(header(0, 100, false), b"a");
        jb.add_packet(header(2, 100, false), b"c");
        jb.add_packet(header(1, 100, true), b"b");
        assert_eq!(
            sink.borrow().payloads,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn late_packet_is_dropped() {
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let mut jb = JitterBuffer::new(sink.clone());
        jb.add_packet(header(5, 100, false), b"a");
        jb.add_packet(header(2, 100, false), b"stale");
        assert_eq!(sink.borrow().payloads, vec![b"a".to_vec()]);
    }

    #[test]
    fn far_future_packet_is_buffered_after_window_shrinks() {
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let mut jb = JitterBuffer::new(sink.clone());
        jb.add_packet(header(0, 100, false), b"a");
        // Jump far ahead: beyond tolerance, no marker. The packet cannot be
        // dispatched immediately (distance from the desired sequence still
        // nonzero after shrinking) but must not be dropped or panic either.
        jb.add_packet(header(200, 100, false), b"z");
        assert_eq!(sink.borrow().payloads, vec![b"a".to_vec()]);
        assert_eq!(sink.borrow().frames, 0);

        // Walking the desired sequence forward with exactly-matching filler
        // packets must eventually reach and dispatch the buffered packet,
        // one slot per dispatch.
        let mut seq = jb.desired_seq;
        for _ in 0..WVB_EARLY_FRAME_TOLERANCE {
            jb.add_packet(header(seq, 100, false), b"f");
            seq = seq.wrapping_add(1);
        }
        assert_eq!(sink.borrow().payloads.last().unwrap(), b"z");
        assert_eq!(sink.borrow().frames, 0);
    }

    #[test]
    fn timestamp_change_flushes_previous_frame() {
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let mut jb = JitterBuffer::new(sink.clone());
        jb.add_packet(header(0, 100, false), b"a"); // no marker: frame left open
        jb.add_packet(header(1, 200, false), b"b"); // new timestamp -> implicit flush
        assert_eq!(sink.borrow().frames, 1);
    }
}
