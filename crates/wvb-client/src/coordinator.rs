//! Client render/decode coordinator (spec §4.9): frame-info queue, pose
//! cache and the accumulated-delay / queue-size catch-up rules that keep
//! the presentation thread fed from a decoder that runs one frame (or
//! more) behind the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use wvb_core::telemetry::{ClientFrameTimeMeasurement, ClientMeasurementBucket};
use wvb_core::types::{FrameInfo, FrameInfoQueue, PoseCache, TrackingState};

/// One decoded picture ready for compositor submission. The decoder
/// backend itself is out of scope (spec §1); this is the shape the
/// coordinator expects back from it.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Decoder backend seam (out of scope per spec §1).
pub trait FrameDecoder: Send {
    fn push_packet(&mut self, bytes: &[u8], end_of_stream: bool);
    /// Pull the next decoded picture, if one is ready. May return `None`
    /// even when packets have been pushed (decoder pipeline delay).
    fn pull_decoded_frame(&mut self) -> Option<DecodedFrame>;
}

/// OpenXR/compositor submission seam (out of scope per spec §1).
pub trait Compositor: Send {
    fn submit(&mut self, frame: &DecodedFrame, pose: TrackingState, predicted_display_time: u32);
}

/// Default queue-size catch-up threshold: pull an extra frame once more
/// than this many `FrameInfo` entries are queued.
pub const DEFAULT_QUEUE_CATCHUP_THRESHOLD: usize = 3;

/// Outcome of one [`RenderCoordinator::render_frame`] call, used by tests
/// to drive the state machine deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// A freshly decoded frame was submitted.
    Submitted,
    /// No new frame was available; the previous frame was reused and
    /// the bucket's dropped-frame counter was incremented.
    Reused,
    /// Nothing has ever been decoded; there is nothing to submit.
    Nothing,
}

pub struct RenderCoordinator {
    decoder: Box<dyn FrameDecoder>,
    compositor: Box<dyn Compositor>,
    frame_info_queue: FrameInfoQueue,
    pose_cache: PoseCache,
    /// Most recently inserted pose, used as the "approximate pose at
    /// predicted display time" fallback (spec §4.9 step 6) when the exact
    /// `pose_timestamp` has already scrolled out of the ring.
    last_known_pose: Option<TrackingState>,
    last_frame: Option<DecodedFrame>,
    last_frame_info: Option<FrameInfo>,
    accumulated_delay: u32,
    queue_catchup_threshold: usize,
    /// Runtime-toggleable catch-up gate (spec §9 Open Questions: runtime
    /// on the client, compile-time on the server).
    frame_drop_catchup_enabled: AtomicBool,
    bucket: Arc<Mutex<ClientMeasurementBucket>>,
}

impl RenderCoordinator {
    pub fn new(
        decoder: Box<dyn FrameDecoder>,
        compositor: Box<dyn Compositor>,
        bucket: Arc<Mutex<ClientMeasurementBucket>>,
    ) -> Self {
        Self {
            decoder,
            compositor,
            frame_info_queue: FrameInfoQueue::default(),
            pose_cache: PoseCache::new(),
            last_known_pose: None,
            last_frame: None,
            last_frame_info: None,
            accumulated_delay: 0,
            queue_catchup_threshold: DEFAULT_QUEUE_CATCHUP_THRESHOLD,
            frame_drop_catchup_enabled: AtomicBool::new(true),
            bucket,
        }
    }

    pub fn set_queue_catchup_threshold(&mut self, threshold: usize) {
        self.queue_catchup_threshold = threshold;
    }

    pub fn set_frame_drop_catchup_enabled(&self, enabled: bool) {
        self.frame_drop_catchup_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn frame_drop_catchup_enabled(&self) -> bool {
        self.frame_drop_catchup_enabled.load(Ordering::Relaxed)
    }

    pub fn accumulated_delay(&self) -> u32 {
        self.accumulated_delay
    }

    pub fn frame_info_queue_len(&self) -> usize {
        self.frame_info_queue.len()
    }

    /// Push path (spec §4.9, runs on the video-receive thread): a packet
    /// came off the wire, hand it to the decoder and enqueue its metadata.
    pub fn on_packet_received(
        &mut self,
        bytes: &[u8],
        end_of_stream: bool,
        frame_id: u64,
        pose_timestamp: u32,
        push_timestamp: u32,
        last_packet_received_timestamp: u32,
        should_save_frame: bool,
    ) {
        self.decoder.push_packet(bytes, end_of_stream);
        self.bucket.lock().add_decoder_pushed_frame();
        self.frame_info_queue.push(FrameInfo {
            frame_id,
            end_of_stream,
            pose_timestamp,
            push_timestamp,
            last_packet_received_timestamp,
            frame_size: bytes.len() as u32,
            should_save_frame,
        });
    }

    /// Record a pose sample in the ring under the `pose_timestamp` it was
    /// emitted with, so a later frame generated from it can be recovered
    /// (spec §4.9 step 6, §3 "Pose cache").
    pub fn record_emitted_pose(&mut self, pose_timestamp: u32, state: TrackingState) {
        self.pose_cache.insert(pose_timestamp, state);
        self.last_known_pose = Some(state);
    }

    fn try_pull_and_associate(&mut self) -> Option<(DecodedFrame, FrameInfo)> {
        let frame = self.decoder.pull_decoded_frame()?;
        self.bucket.lock().add_decoder_pulled_frame();
        let info = self.frame_info_queue.pop().unwrap_or(FrameInfo {
            frame_id: 0,
            end_of_stream: false,
            pose_timestamp: 0,
            push_timestamp: 0,
            last_packet_received_timestamp: 0,
            frame_size: 0,
            should_save_frame: false,
        });
        Some((frame, info))
    }

    /// One presentation-thread iteration (spec §4.9 steps 1-7). Step 1
    /// (waiting for the next display time) is the XR runtime's job and
    /// happens before the caller invokes this; `predicted_display_time` is
    /// that already-determined RTP-domain display time.
    pub fn render_frame(&mut self, predicted_display_time: u32) -> RenderOutcome {
        let mut pulled = self.try_pull_and_associate();

        if pulled.is_some() && self.accumulated_delay > 0 {
            if let Some(extra) = self.try_pull_and_associate() {
                pulled = Some(extra);
                self.accumulated_delay -= 1;
            }
        }

        if pulled.is_some()
            && self.frame_drop_catchup_enabled()
            && self.frame_info_queue.len() > self.queue_catchup_threshold
        {
            if let Some(extra) = self.try_pull_and_associate() {
                pulled = Some(extra);
                self.bucket.lock().add_catched_up_frame();
            }
        }

        let (frame, info, outcome) = match pulled {
            Some((frame, info)) => {
                self.last_frame = Some(frame.clone());
                self.last_frame_info = Some(info);
                (frame, info, RenderOutcome::Submitted)
            }
            None => {
                let (Some(frame), Some(info)) = (self.last_frame.clone(), self.last_frame_info)
                else {
                    return RenderOutcome::Nothing;
                };
                self.accumulated_delay += 1;
                self.bucket.lock().add_dropped_frames(1);
                (frame, info, RenderOutcome::Reused)
            }
        };

        let pose = self
            .pose_cache
            .find(info.pose_timestamp)
            .or(self.last_known_pose)
            .unwrap_or_default();

        self.compositor.submit(&frame, pose, predicted_display_time);

        self.bucket.lock().add_frame_time_measurement(ClientFrameTimeMeasurement {
            frame_id: info.frame_id as u32,
            pose_timestamp: info.pose_timestamp,
            last_packet_received_timestamp: info.last_packet_received_timestamp,
            pushed_to_decoder_timestamp: info.push_timestamp,
            predicted_present_timestamp: predicted_display_time,
            frame_delay: self.accumulated_delay,
            ..Default::default()
        });

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wvb_core::rtp::clock::RtpClock;

    struct CountingDecoder {
        pending: std::collections::VecDeque<DecodedFrame>,
    }

    impl FrameDecoder for CountingDecoder {
        fn push_packet(&mut self, bytes: &[u8], _end_of_stream: bool) {
            self.pending.push_back(DecodedFrame {
                width: 1,
                height: 1,
                data: bytes.to_vec(),
            });
        }

        fn pull_decoded_frame(&mut self) -> Option<DecodedFrame> {
            self.pending.pop_front()
        }
    }

    struct RecordingCompositor {
        submitted: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl Compositor for RecordingCompositor {
        fn submit(&mut self, _frame: &DecodedFrame, pose: TrackingState, display_time: u32) {
            self.submitted
                .lock()
                .push((pose.pose_timestamp, display_time));
        }
    }

    fn make_bucket() -> Arc<Mutex<ClientMeasurementBucket>> {
        let mut bucket = ClientMeasurementBucket::new();
        bucket.sockets_mut().bucket_mut().set_clock(Arc::new(RtpClock::new()));
        bucket.sockets_mut().bucket_mut().set_as_accept_all();
        Arc::new(Mutex::new(bucket))
    }

    #[test]
    fn submits_a_fresh_frame_with_its_associated_pose() {
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let bucket = make_bucket();
        let mut coord = RenderCoordinator::new(
            Box::new(CountingDecoder { pending: Default::default() }),
            Box::new(RecordingCompositor { submitted: submitted.clone() }),
            bucket,
        );
        coord.record_emitted_pose(1000, TrackingState { pose_timestamp: 1000, ..Default::default() });
        coord.on_packet_received(b"frame", true, 1, 1000, 1000, 1000, false);

        assert_eq!(coord.render_frame(1050), RenderOutcome::Submitted);
        assert_eq!(submitted.lock()[0].0, 1000);
    }

    #[test]
    fn reuses_last_frame_and_increments_accumulated_delay_when_nothing_decoded() {
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let bucket = make_bucket();
        let mut coord = RenderCoordinator::new(
            Box::new(CountingDecoder { pending: Default::default() }),
            Box::new(RecordingCompositor { submitted: submitted.clone() }),
            bucket,
        );
        assert_eq!(coord.render_frame(10), RenderOutcome::Nothing);

        coord.on_packet_received(b"frame", true, 1, 500, 500, 500, false);
        assert_eq!(coord.render_frame(20), RenderOutcome::Submitted);
        assert_eq!(coord.accumulated_delay(), 0);

        assert_eq!(coord.render_frame(30), RenderOutcome::Reused);
        assert_eq!(coord.accumulated_delay(), 1);
        assert_eq!(submitted.lock().len(), 3);
    }

    #[test]
    fn decoder_frame_delay_tracks_pushed_minus_pulled() {
        let bucket = make_bucket();
        let mut coord = RenderCoordinator::new(
            Box::new(CountingDecoder { pending: Default::default() }),
            Box::new(RecordingCompositor { submitted: Arc::new(Mutex::new(Vec::new())) }),
            bucket.clone(),
        );
        assert_eq!(bucket.lock().decoder_frame_delay(), 0);
        coord.on_packet_received(b"a", false, 1, 0, 0, 0, false);
        coord.on_packet_received(b"b", false, 2, 0, 0, 0, false);
        assert_eq!(bucket.lock().decoder_frame_delay(), 2);
        coord.render_frame(0);
        assert_eq!(bucket.lock().decoder_frame_delay(), 1);
    }

    #[test]
    fn queue_size_catchup_pulls_an_extra_frame_when_backlog_builds() {
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let bucket = make_bucket();
        let mut coord = RenderCoordinator::new(
            Box::new(CountingDecoder { pending: Default::default() }),
            Box::new(RecordingCompositor { submitted }),
            bucket.clone(),
        );
        coord.set_queue_catchup_threshold(1);
        for i in 0..4u64 {
            coord.on_packet_received(b"f", false, i, i as u32, i as u32, i as u32, false);
        }
        // frame_info_queue now has 4 entries; one pull happens normally,
        // a second because the backlog exceeds the threshold of 1.
        coord.render_frame(0);
        assert_eq!(bucket.lock().decoder_frame_delay(), 2);
    }
}
