//! Measurement bucket: time-windowed collection of benchmark samples from
//! across the pipeline, gated by a phase predicate derived from a shared
//! [`RtpClock`](crate::rtp::clock::RtpClock).
//!
//! Composition takes the place of the virtual-inheritance chain a C++
//! rewrite would reach for: [`SocketMeasurementBucket`] wraps a
//! [`MeasurementBucket`], and [`ClientMeasurementBucket`] wraps a
//! [`SocketMeasurementBucket`] in turn.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::rtp::clock::{RtpClock, compare_rtp_timestamps};

/// Timing/tracking sample capacity, reserved up front to avoid reallocation
/// during a measurement pass.
pub const TIMING_PHASE_CAPACITY: usize = 2000;
/// Image-quality sample capacity (fewer frames are saved for PSNR/size
/// comparison than are timed).
pub const IMAGE_QUALITY_PHASE_CAPACITY: usize = 500;

fn rtp_lt(a: u32, b: u32) -> bool {
    a != b && compare_rtp_timestamps(a, b)
}

fn rtp_le(a: u32, b: u32) -> bool {
    a == b || compare_rtp_timestamps(a, b)
}

fn rtp_ge(a: u32, b: u32) -> bool {
    a == b || compare_rtp_timestamps(b, a)
}

/// Returns the median of `values`, sorting in place. Truncating integer
/// mean for even-length inputs; zero for an empty slice.
pub fn compute_median_u32(values: &mut [u32]) -> u32 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let n = values.len();
    if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2
    } else {
        values[n / 2]
    }
}

/// Sorting copy of [`compute_median_u32`] for signed samples (clock error).
pub fn compute_median_i32(values: &mut [i32]) -> i32 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let n = values.len();
    if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2
    } else {
        values[n / 2]
    }
}

/// The four RTP-clock boundaries delimiting a measurement pass.
///
/// `start_timing_phase < start_image_quality_phase < end_measurements <=
/// end`. The timing phase runs first (cheap counters only); the image
/// quality phase is a narrower tail window where a handful of frames are
/// also read back for PSNR/size comparison. `end` leaves a margin past
/// `end_measurements` before results are sent back, absorbing residual
/// clock sync imprecision between peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeasurementWindow {
    pub start_timing_phase: u32,
    pub start_image_quality_phase: u32,
    pub end_measurements: u32,
    pub end: u32,
}

impl MeasurementWindow {
    pub fn is_valid(&self) -> bool {
        rtp_lt(self.start_timing_phase, self.start_image_quality_phase)
            && rtp_lt(self.start_image_quality_phase, self.end_measurements)
            && rtp_le(self.end_measurements, self.end)
    }

    pub fn is_in_timing_phase(&self, time: u32) -> bool {
        rtp_ge(time, self.start_timing_phase) && rtp_le(time, self.start_image_quality_phase)
    }

    pub fn is_in_image_quality_phase(&self, time: u32) -> bool {
        rtp_ge(time, self.start_image_quality_phase) && rtp_le(time, self.end_measurements)
    }

    pub fn is_in_window(&self, time: u32) -> bool {
        rtp_ge(time, self.start_timing_phase) && rtp_le(time, self.end)
    }

    /// True once measurements are over and can be exported/sent.
    pub fn is_after_window(&self, time: u32) -> bool {
        rtp_lt(self.end, time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketMode {
    /// Only accept measurements when the clock is inside the configured
    /// window.
    Window,
    /// Accept all measurements regardless of window, for ad-hoc or
    /// always-on counters.
    AcceptAll,
    /// Refuse everything; the measurement period is over.
    Finished,
}

impl Default for BucketMode {
    fn default() -> Self {
        BucketMode::Window
    }
}

/// Shared window/phase-gating state, composed into every concrete bucket
/// type below rather than inherited.
#[derive(Debug, Default)]
pub struct MeasurementBucket {
    clock: Option<Arc<RtpClock>>,
    window: MeasurementWindow,
    mode: BucketMode,
}

impl MeasurementBucket {
    pub fn reset(&mut self) {
        self.mode = BucketMode::Window;
        self.window = MeasurementWindow::default();
    }

    pub fn measurements_complete(&self) -> bool {
        let Some(clock) = &self.clock else {
            return false;
        };
        let now = clock.now_rtp_timestamp();
        (self.mode == BucketMode::Window && self.window.is_valid() && self.window.is_after_window(now))
            || self.mode == BucketMode::Finished
    }

    pub fn is_in_timing_phase(&self) -> bool {
        if self.mode == BucketMode::AcceptAll {
            return true;
        }
        let Some(clock) = &self.clock else {
            return false;
        };
        self.mode == BucketMode::Window
            && self.window.is_valid()
            && self.window.is_in_timing_phase(clock.now_rtp_timestamp())
    }

    pub fn is_in_image_quality_phase(&self) -> bool {
        if self.mode == BucketMode::AcceptAll {
            return true;
        }
        let Some(clock) = &self.clock else {
            return false;
        };
        self.mode == BucketMode::Window
            && self.window.is_valid()
            && self.window.is_in_image_quality_phase(clock.now_rtp_timestamp())
    }

    pub fn has_window(&self) -> bool {
        self.window.is_valid()
    }

    /// Resets the window so that measurements stop early if one was in
    /// progress.
    pub fn reset_window(&mut self) {
        self.window = MeasurementWindow::default();
    }

    pub fn set_as_accept_all(&mut self) {
        self.mode = BucketMode::AcceptAll;
    }

    pub fn set_as_finished(&mut self) {
        self.mode = BucketMode::Finished;
    }

    pub fn set_clock(&mut self, clock: Arc<RtpClock>) {
        self.clock = Some(clock);
    }

    pub fn set_window(&mut self, window: MeasurementWindow) {
        self.window = window;
    }
}

/// Which logical socket a [`SocketMeasurements`] row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketId {
    Unknown,
    Video,
    VrcpTcp,
    VrcpUdp,
    VrcpBroadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Tcp,
    Udp,
}

/// Per-socket byte/packet counters for one measurement pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketMeasurements {
    pub socket_id: Option<SocketId>,
    pub socket_type: Option<SocketType>,
    pub bytes_sent: u32,
    pub bytes_received: u32,
    pub packets_sent: u32,
    pub packets_received: u32,
}

impl SocketMeasurements {
    fn new(socket_id: SocketId, socket_type: SocketType) -> Self {
        Self {
            socket_id: Some(socket_id),
            socket_type: Some(socket_type),
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.socket_type.is_some()
    }
}

/// A [`MeasurementBucket`] plus one [`SocketMeasurements`] row per
/// registered socket, keyed by a small integer storage id handed back from
/// [`register_socket`](Self::register_socket).
#[derive(Debug, Default)]
pub struct SocketMeasurementBucket {
    bucket: MeasurementBucket,
    socket_measurements: Vec<SocketMeasurements>,
}

impl SocketMeasurementBucket {
    pub fn reset(&mut self) {
        self.bucket.reset();
        for s in &mut self.socket_measurements {
            s.bytes_received = 0;
            s.bytes_sent = 0;
            s.packets_received = 0;
            s.packets_sent = 0;
        }
    }

    /// Registers a new socket measurement slot, returning its storage id.
    pub fn register_socket(&mut self, socket_id: SocketId, socket_type: SocketType) -> u32 {
        self.socket_measurements
            .push(SocketMeasurements::new(socket_id, socket_type));
        (self.socket_measurements.len() - 1) as u32
    }

    pub fn add_bytes_sent(&mut self, storage_id: u32, bytes_sent: u32) {
        if self.bucket.is_in_timing_phase() {
            self.socket_measurements[storage_id as usize].bytes_sent += bytes_sent;
        }
    }

    pub fn add_bytes_received(&mut self, storage_id: u32, bytes_received: u32) {
        if self.bucket.is_in_timing_phase() {
            self.socket_measurements[storage_id as usize].bytes_received += bytes_received;
        }
    }

    pub fn add_packets_sent(&mut self, storage_id: u32, packets_sent: u32) {
        if self.bucket.is_in_timing_phase() {
            self.socket_measurements[storage_id as usize].packets_sent += packets_sent;
        }
    }

    pub fn add_packets_received(&mut self, storage_id: u32, packets_received: u32) {
        if self.bucket.is_in_timing_phase() {
            self.socket_measurements[storage_id as usize].packets_received += packets_received;
        }
    }

    pub fn get_socket_measurements(&self) -> &[SocketMeasurements] {
        &self.socket_measurements
    }

    pub fn bucket(&self) -> &MeasurementBucket {
        &self.bucket
    }

    pub fn bucket_mut(&mut self) -> &mut MeasurementBucket {
        &mut self.bucket
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientFrameTimeMeasurement {
    pub frame_index: u32,
    pub frame_id: u32,
    pub tracking_timestamp: u32,
    pub last_packet_received_timestamp: u32,
    pub pushed_to_decoder_timestamp: u32,
    pub begin_wait_frame_timestamp: u32,
    pub begin_frame_timestamp: u32,
    pub after_wait_swapchain_timestamp: u32,
    pub after_render_timestamp: u32,
    pub end_frame_timestamp: u32,
    pub predicted_present_timestamp: u32,
    pub pose_timestamp: u32,
    pub frame_delay: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingTimeMeasurement {
    pub pose_timestamp: u32,
    pub tracking_received_timestamp: u32,
    pub tracking_processed_timestamp: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageQualityMeasurement {
    pub frame_id: u32,
    pub codestream_size: u32,
    pub raw_size: u32,
    pub psnr: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkMeasurement {
    pub rtt_us: u32,
    pub clock_error_us: i32,
}

/// Client-side measurement collection: frame timing, tracking latency,
/// image quality samples, RTT/clock-error network samples, plus decoder
/// push/pull and drop/catch-up counters.
#[derive(Debug, Default)]
pub struct ClientMeasurementBucket {
    sockets: SocketMeasurementBucket,
    frame_measurements: Vec<ClientFrameTimeMeasurement>,
    tracking_measurements: Vec<TrackingTimeMeasurement>,
    image_quality_measurements: Vec<ImageQualityMeasurement>,
    network_measurements: Vec<NetworkMeasurement>,
    decoder_frames_pushed: u64,
    decoder_frames_pulled: u64,
    saved_frames: u32,
    dropped_frames: u32,
    catched_up_frames: u32,
}

impl ClientMeasurementBucket {
    pub fn new() -> Self {
        let mut b = Self::default();
        b.frame_measurements.reserve(TIMING_PHASE_CAPACITY);
        b.tracking_measurements.reserve(TIMING_PHASE_CAPACITY);
        b.image_quality_measurements
            .reserve(IMAGE_QUALITY_PHASE_CAPACITY);
        b.network_measurements.reserve(20);
        b
    }

    pub fn reset(&mut self) {
        self.sockets.reset();
        self.frame_measurements.clear();
        self.tracking_measurements.clear();
        self.image_quality_measurements.clear();
        self.network_measurements.clear();
        self.decoder_frames_pushed = 0;
        self.decoder_frames_pulled = 0;
        self.saved_frames = 0;
        self.dropped_frames = 0;
    }

    pub fn sockets(&self) -> &SocketMeasurementBucket {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut SocketMeasurementBucket {
        &mut self.sockets
    }

    pub fn add_frame_time_measurement(&mut self, m: ClientFrameTimeMeasurement) {
        if self.sockets.bucket().is_in_timing_phase() {
            self.frame_measurements.push(m);
        }
    }

    pub fn add_tracking_time_measurement(&mut self, m: TrackingTimeMeasurement) {
        if self.sockets.bucket().is_in_timing_phase() {
            self.tracking_measurements.push(m);
        }
    }

    pub fn add_image_quality_measurement(&mut self, m: ImageQualityMeasurement) {
        if self.sockets.bucket().is_in_image_quality_phase() {
            self.image_quality_measurements.push(m);
        }
    }

    pub fn add_network_measurement(&mut self, m: NetworkMeasurement) {
        self.network_measurements.push(m);
    }

    pub fn add_decoder_pushed_frame(&mut self) {
        self.decoder_frames_pushed += 1;
    }

    pub fn add_decoder_pulled_frame(&mut self) {
        self.decoder_frames_pulled += 1;
    }

    /// `get_decoder_frame_delay()` (spec §9 Open Question resolution):
    /// pushed minus pulled, tracked as two distinct counters rather than
    /// the source's single field a setter could alias into by mistake.
    pub fn decoder_frame_delay(&self) -> u64 {
        self.decoder_frames_pushed
            .saturating_sub(self.decoder_frames_pulled)
    }

    pub fn add_saved_frame(&mut self) {
        self.saved_frames += 1;
    }

    pub fn has_saved_frames(&self) -> bool {
        self.saved_frames == 10
    }

    pub fn add_dropped_frames(&mut self, n: u32) {
        if self.sockets.bucket().is_in_timing_phase() {
            self.dropped_frames += n;
        }
    }

    pub fn add_catched_up_frame(&mut self) {
        if self.sockets.bucket().is_in_timing_phase() {
            self.catched_up_frames += 1;
        }
    }

    pub fn dropped_frames(&self) -> u32 {
        self.dropped_frames
    }

    pub fn catched_up_frames(&self) -> u32 {
        self.catched_up_frames
    }

    pub fn frame_time_measurements(&self) -> &[ClientFrameTimeMeasurement] {
        &self.frame_measurements
    }

    pub fn tracking_measurements(&self) -> &[TrackingTimeMeasurement] {
        &self.tracking_measurements
    }

    pub fn image_quality_measurements(&self) -> &[ImageQualityMeasurement] {
        &self.image_quality_measurements
    }

    pub fn network_measurements(&self) -> &[NetworkMeasurement] {
        &self.network_measurements
    }

    /// `(min, max, avg, median)` round-trip time in microseconds across all
    /// collected network samples.
    pub fn rtt_stats(&self) -> (u32, u32, u32, u32) {
        if self.network_measurements.is_empty() {
            return (0, 0, 0, 0);
        }
        let mut values: Vec<u32> = self.network_measurements.iter().map(|m| m.rtt_us).collect();
        let min = *values.iter().min().unwrap();
        let max = *values.iter().max().unwrap();
        let sum: u64 = values.iter().map(|&v| v as u64).sum();
        let avg = (sum / values.len() as u64) as u32;
        let median = compute_median_u32(&mut values);
        (min, max, avg, median)
    }

    /// `(min, max, median)` clock error in microseconds across all
    /// collected network samples.
    pub fn clock_error_stats(&self) -> (i32, i32, i32) {
        if self.network_measurements.is_empty() {
            return (0, 0, 0);
        }
        let mut values: Vec<i32> = self
            .network_measurements
            .iter()
            .map(|m| m.clock_error_us)
            .collect();
        let min = *values.iter().min().unwrap();
        let max = *values.iter().max().unwrap();
        let median = compute_median_i32(&mut values);
        (min, max, median)
    }
}

/// Uniform registration seam: anything that produces socket byte/packet
/// counters (a transport socket) or decoder push/pull counters (the client
/// coordinator) implements this to attach itself to a shared bucket.
pub trait RegistersWithBucket {
    fn register_with(&mut self, bucket: Arc<Mutex<SocketMeasurementBucket>>, socket_id: SocketId, socket_type: SocketType);
}

/// A lightweight handle a socket holds onto after registering with a
/// shared [`SocketMeasurementBucket`], letting it record traffic without
/// re-acquiring its own storage id lookup on every call.
#[derive(Clone)]
pub struct SocketBucketHandle {
    bucket: Arc<Mutex<SocketMeasurementBucket>>,
    storage_id: u32,
}

impl SocketBucketHandle {
    pub fn register(
        bucket: Arc<Mutex<SocketMeasurementBucket>>,
        socket_id: SocketId,
        socket_type: SocketType,
    ) -> Self {
        let storage_id = bucket.lock().register_socket(socket_id, socket_type);
        Self { bucket, storage_id }
    }

    pub fn record_sent(&self, bytes: usize) {
        let mut b = self.bucket.lock();
        b.add_bytes_sent(self.storage_id, bytes as u32);
        b.add_packets_sent(self.storage_id, 1);
    }

    pub fn record_received(&self, bytes: usize) {
        let mut b = self.bucket.lock();
        b.add_bytes_received(self.storage_id, bytes as u32);
        b.add_packets_received(self.storage_id, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_median_empty_is_zero() {
        let mut v: Vec<u32> = vec![];
        assert_eq!(compute_median_u32(&mut v), 0);
    }

    #[test]
    fn compute_median_odd_and_even() {
        let mut odd = vec![5, 1, 3];
        assert_eq!(compute_median_u32(&mut odd), 3);
        let mut even = vec![10, 20, 30, 40];
        assert_eq!(compute_median_u32(&mut even), 25);
    }

    #[test]
    fn window_valid_requires_strictly_increasing_phases() {
        let w = MeasurementWindow {
            start_timing_phase: 0,
            start_image_quality_phase: 100,
            end_measurements: 200,
            end: 200,
        };
        assert!(w.is_valid());

        let invalid = MeasurementWindow {
            start_timing_phase: 100,
            start_image_quality_phase: 100,
            end_measurements: 200,
            end: 200,
        };
        assert!(!invalid.is_valid());
    }

    #[test]
    fn bucket_rejects_measurements_outside_phase_without_clock() {
        let mut bucket = SocketMeasurementBucket::default();
        let id = bucket.register_socket(SocketId::Video, SocketType::Udp);
        // No clock attached: is_in_timing_phase() is always false (Window mode).
        bucket.add_bytes_sent(id, 100);
        assert_eq!(bucket.get_socket_measurements()[id as usize].bytes_sent, 0);
    }

    #[test]
    fn bucket_accept_all_bypasses_window() {
        let mut bucket = SocketMeasurementBucket::default();
        bucket.bucket_mut().set_as_accept_all();
        let id = bucket.register_socket(SocketId::VrcpTcp, SocketType::Tcp);
        bucket.add_bytes_sent(id, 42);
        assert_eq!(bucket.get_socket_measurements()[id as usize].bytes_sent, 42);
    }

    #[test]
    fn client_bucket_reset_clears_everything() {
        let mut bucket = ClientMeasurementBucket::new();
        bucket.sockets_mut().bucket_mut().set_as_accept_all();
        bucket.add_decoder_pushed_frame();
        bucket.add_saved_frame();
        bucket.add_network_measurement(NetworkMeasurement {
            rtt_us: 1000,
            clock_error_us: -5,
        });
        bucket.reset();
        assert_eq!(bucket.decoder_frames_pushed, 0);
        assert_eq!(bucket.saved_frames, 0);
        assert!(bucket.network_measurements().is_empty());
    }

    #[test]
    fn rtt_stats_on_empty_is_zero() {
        let bucket = ClientMeasurementBucket::new();
        assert_eq!(bucket.rtt_stats(), (0, 0, 0, 0));
    }

    #[test]
    fn rtt_stats_computes_min_max_avg_median() {
        let mut bucket = ClientMeasurementBucket::new();
        for rtt in [10u32, 20, 30] {
            bucket.add_network_measurement(NetworkMeasurement {
                rtt_us: rtt,
                clock_error_us: 0,
            });
        }
        assert_eq!(bucket.rtt_stats(), (10, 30, 20, 20));
    }
}
