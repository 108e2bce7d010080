//! RTP transport: clock, header/timestamp arithmetic, jitter-tolerant
//! reassembly framework, and the H.264 packetizer/depacketizer built on it.

pub mod clock;
pub mod h264;
pub mod header;
pub mod jitter;

pub use clock::{RtpClock, RtpTimePoint, compare_rtp_timestamps, rtp_seq_distance};
pub use header::{RtpHeader, RtpHeaderWriter};
pub use jitter::{JitterBuffer, PacketSink};
