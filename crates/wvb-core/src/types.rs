//! Shared data-model types carried across the VRCP/RTP boundary (spec §3).

/// Immutable-per-session VR system description, exchanged during the
/// handshake. Manufacturer/system name are each capped at 32 UTF-8 bytes on
/// the wire (enforced by [`crate::wire::pack_fixed_str`] at the TLV layer).
#[derive(Debug, Clone, PartialEq)]
pub struct VrSystemSpecs {
    pub eye_width: u16,
    pub eye_height: u16,
    pub refresh_rate_num: u16,
    pub refresh_rate_den: u16,
    pub ipd_meters: f32,
    pub eye_to_head_distance: f32,
    pub world_bounds_width: f32,
    pub world_bounds_height: f32,
    pub manufacturer_name: String,
    pub system_name: String,
}

impl VrSystemSpecs {
    pub fn refresh_rate_hz(&self) -> f64 {
        self.refresh_rate_num as f64 / self.refresh_rate_den.max(1) as f64
    }
}

/// Head pose: orientation quaternion + position vector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub orientation: [f32; 4],
    pub position: [f32; 3],
}

/// Per-eye field of view angles, radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FieldOfView {
    pub left: f32,
    pub right: f32,
    pub up: f32,
    pub down: f32,
}

/// Full tracking state sampled on the client and forwarded to the driver
/// through the server.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackingState {
    pub pose_timestamp: u32,
    pub sample_timestamp: u32,
    pub head_pose: Pose,
    pub eye_fov: [FieldOfView; 2],
}

/// Driver -> server record of one rendered frame (spec §3 "Present info").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresentInfo {
    pub shared_texture_handle: u64,
    pub frame_id: u64,
    pub vsync_time_seconds: f64,
    pub sample_timestamp: u32,
    pub pose_timestamp: u32,
}

/// Client-side frame-info queue entry (spec §3 "Frame-info queue"). One
/// enqueue per decoder push, one dequeue per successful decoder pull.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub frame_id: u64,
    pub end_of_stream: bool,
    pub pose_timestamp: u32,
    pub push_timestamp: u32,
    pub last_packet_received_timestamp: u32,
    pub frame_size: u32,
    pub should_save_frame: bool,
}

/// Fixed-capacity FIFO of [`FrameInfo`], oldest-first.
#[derive(Debug, Default)]
pub struct FrameInfoQueue {
    entries: std::collections::VecDeque<FrameInfo>,
}

impl FrameInfoQueue {
    pub fn push(&mut self, info: FrameInfo) {
        self.entries.push_back(info);
    }

    pub fn pop(&mut self) -> Option<FrameInfo> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Number of entries in the client pose cache ring (spec §3).
pub const TRACKING_STATE_CACHE_SIZE: usize = 100;

/// Ring buffer of recently-emitted poses, keyed by the `pose_timestamp`
/// under which each was sent, so the client can recover the pose that was
/// in effect when an incoming frame was generated (spec §4.9 step 6).
#[derive(Debug)]
pub struct PoseCache {
    entries: Vec<Option<(u32, TrackingState)>>,
    next: usize,
}

impl PoseCache {
    pub fn new() -> Self {
        Self {
            entries: vec![None; TRACKING_STATE_CACHE_SIZE],
            next: 0,
        }
    }

    pub fn insert(&mut self, pose_timestamp: u32, state: TrackingState) {
        self.entries[self.next] = Some((pose_timestamp, state));
        self.next = (self.next + 1) % TRACKING_STATE_CACHE_SIZE;
    }

    /// Looks up the pose that was emitted under `pose_timestamp`, if it is
    /// still within the ring's retention window.
    pub fn find(&self, pose_timestamp: u32) -> Option<TrackingState> {
        self.entries
            .iter()
            .flatten()
            .find(|(ts, _)| *ts == pose_timestamp)
            .map(|(_, state)| *state)
    }
}

impl Default for PoseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_cache_finds_inserted_entry() {
        let mut cache = PoseCache::new();
        let state = TrackingState {
            pose_timestamp: 42,
            ..Default::default()
        };
        cache.insert(42, state);
        assert_eq!(cache.find(42), Some(state));
        assert_eq!(cache.find(999), None);
    }

    #[test]
    fn pose_cache_wraps_after_capacity() {
        let mut cache = PoseCache::new();
        for i in 0..(TRACKING_STATE_CACHE_SIZE as u32 + 5) {
            cache.insert(i, TrackingState {
                pose_timestamp: i,
                ..Default::default()
            });
        }
        // The first 5 entries should have been overwritten.
        assert_eq!(cache.find(0), None);
        assert!(cache.find(TRACKING_STATE_CACHE_SIZE as u32 + 4).is_some());
    }

    #[test]
    fn frame_info_queue_is_fifo() {
        let mut q = FrameInfoQueue::default();
        let mk = |id| FrameInfo {
            frame_id: id,
            end_of_stream: false,
            pose_timestamp: 0,
            push_timestamp: 0,
            last_packet_received_timestamp: 0,
            frame_size: 0,
            should_save_frame: false,
        };
        q.push(mk(1));
        q.push(mk(2));
        assert_eq!(q.pop().unwrap().frame_id, 1);
        assert_eq!(q.pop().unwrap().frame_id, 2);
        assert!(q.pop().is_none());
    }
}
