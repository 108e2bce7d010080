//! Headset-side CLI surface. `spec.md §6.5` only specifies the server's
//! flags; this binary's own flags follow the same `clap`-derive pattern
//! for the handful of values a real headset would otherwise read from its
//! OpenXR runtime (out of scope per spec §1).

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "wvb-client", about = "Wireless VR bridge headset client")]
pub struct Args {
    /// UDP port to listen for `SERVER_ADVERTISEMENT` broadcasts on.
    #[arg(long, default_value_t = wvb_core::vrcp::DEFAULT_ADVERTISEMENT_PORT)]
    pub advertisement_port: u16,

    /// Local port the video socket binds to (TCP listen or UDP bind,
    /// depending on `--video-mode-udp`).
    #[arg(long, default_value_t = 7673)]
    pub video_port: u16,

    /// Use UDP+RTP+H.264 for video instead of the TCP length-prefixed
    /// framing (spec §2 item 11 "compile-time choice" — exposed here as a
    /// runtime flag since this workspace builds a single binary for both).
    #[arg(long, default_value_t = true)]
    pub video_mode_udp: bool,

    /// Comma-separated codec ids this headset can decode, most preferred
    /// first.
    #[arg(long, default_value = "h264")]
    pub supported_codecs: String,

    #[arg(long, default_value = "wvb")]
    pub manufacturer: String,

    #[arg(long, default_value = "wvb-headset")]
    pub system_name: String,

    #[arg(long, default_value_t = 1832)]
    pub eye_width: u16,
    #[arg(long, default_value_t = 1920)]
    pub eye_height: u16,
    #[arg(long, default_value_t = 90)]
    pub refresh_rate_num: u16,
    #[arg(long, default_value_t = 1)]
    pub refresh_rate_den: u16,
    #[arg(long, default_value_t = 0.063)]
    pub ipd: f32,
    #[arg(long, default_value_t = 0.10)]
    pub eye_to_head_distance: f32,
    #[arg(long, default_value_t = 2.0)]
    pub world_width: f32,
    #[arg(long, default_value_t = 2.0)]
    pub world_height: f32,

    /// Number of successful clock-sync pings to collect before sending
    /// `SYNC_FINISHED` (spec §4.6 "Clock synchronization").
    #[arg(long, default_value_t = 20)]
    pub ping_count: u32,

    /// Runtime gate on the queue-size catch-up rule (spec §9 Open
    /// Questions: runtime on the client, compile-time on the server).
    #[arg(long, default_value_t = true)]
    pub enable_frame_drop_catchup: bool,
}

impl Args {
    pub fn codecs(&self) -> Vec<String> {
        self.supported_codecs
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
