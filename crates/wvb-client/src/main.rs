//! Headset-side client binary: discover a server via VRCP advertisement,
//! handshake, synchronize clocks, then pump the video receive path into
//! the render/decode coordinator.

mod config;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use parking_lot::Mutex;

use wvb_core::error::Error;
use wvb_core::rtp::clock::{NTP_UNIX_EPOCH_DELTA, RtpClock};
use wvb_core::telemetry::ClientMeasurementBucket;
use wvb_core::types::{FieldOfView, Pose, TrackingState, VrSystemSpecs};
use wvb_core::video_socket::VideoReceiver;
use wvb_core::vrcp::client::{ClientState, VrcpClientSocket};

use config::Args;
use wvb_client::coordinator::{Compositor, DecodedFrame, FrameDecoder, RenderCoordinator};

/// Trivial decoder stand-in: the real H.264/H.265/AV1/VP9 decoder backend
/// is out of scope (spec §1); this echoes pushed bytes back as "decoded"
/// so the coordinator's catch-up/pose logic can be exercised end to end.
#[derive(Default)]
struct PassthroughDecoder {
    pending: std::collections::VecDeque<DecodedFrame>,
}

impl FrameDecoder for PassthroughDecoder {
    fn push_packet(&mut self, bytes: &[u8], _end_of_stream: bool) {
        self.pending.push_back(DecodedFrame {
            width: 0,
            height: 0,
            data: bytes.to_vec(),
        });
    }

    fn pull_decoded_frame(&mut self) -> Option<DecodedFrame> {
        self.pending.pop_front()
    }
}

/// Logs instead of submitting to a real OpenXR swapchain (out of scope per
/// spec §1).
struct LoggingCompositor;

impl Compositor for LoggingCompositor {
    fn submit(&mut self, frame: &DecodedFrame, pose: TrackingState, predicted_display_time: u32) {
        tracing::debug!(
            bytes = frame.data.len(),
            pose_timestamp = pose.pose_timestamp,
            predicted_display_time,
            "submitted frame to compositor"
        );
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let specs = VrSystemSpecs {
        eye_width: args.eye_width,
        eye_height: args.eye_height,
        refresh_rate_num: args.refresh_rate_num,
        refresh_rate_den: args.refresh_rate_den,
        ipd_meters: args.ipd,
        eye_to_head_distance: args.eye_to_head_distance,
        world_bounds_width: args.world_width,
        world_bounds_height: args.world_height,
        manufacturer_name: args.manufacturer.clone(),
        system_name: args.system_name.clone(),
    };

    let mut client = match VrcpClientSocket::new(args.advertisement_port) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to open discovery socket: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("discovering servers...");
    let candidate = loop {
        if let Err(e) = client.poll_discovery() {
            tracing::warn!(error = %e, "discovery poll error");
        }
        if let Some(c) = client.candidates().first() {
            break *c;
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    tracing::info!(addr = %candidate.addr, "connecting to server");

    loop {
        match client.connect(candidate.addr) {
            Ok(()) => break,
            Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                eprintln!("connect failed: {e}");
                std::process::exit(1);
            }
        }
    }

    let ntp_timestamp = unix_now_secs() + NTP_UNIX_EPOCH_DELTA;
    if let Err(e) = client.send_conn_req(
        args.video_port,
        args.video_mode_udp,
        &specs,
        ntp_timestamp,
        args.codecs(),
    ) {
        eprintln!("failed to send CONN_REQ: {e}");
        std::process::exit(1);
    }

    loop {
        match client.poll_negotiation() {
            Ok(true) => break,
            Ok(false) => {
                if client.state() == ClientState::AwaitingConnection {
                    eprintln!("handshake rejected, exiting");
                    std::process::exit(1);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                eprintln!("negotiation error: {e}");
                std::process::exit(1);
            }
        }
    }
    tracing::info!(codec = ?client.chosen_video_codec, "connected");

    let mut clock = RtpClock::new();
    if let Err(e) = client.run_clock_sync(&mut clock, args.ping_count) {
        tracing::warn!(error = %e, "clock sync did not fully converge");
    }
    let clock = Arc::new(clock);

    let bucket = Arc::new(Mutex::new(ClientMeasurementBucket::new()));
    bucket.lock().sockets_mut().bucket_mut().set_clock(clock.clone());
    bucket.lock().sockets_mut().bucket_mut().set_as_accept_all();

    let mut coordinator = RenderCoordinator::new(
        Box::new(PassthroughDecoder::default()),
        Box::new(LoggingCompositor),
        bucket.clone(),
    );
    coordinator.set_frame_drop_catchup_enabled(args.enable_frame_drop_catchup);

    let mut video_receiver = if args.video_mode_udp {
        let socket =
            wvb_core::net::udp::UdpSocket::bind(std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, args.video_port))
                .unwrap_or_else(|e| {
                    eprintln!("failed to bind video socket: {e}");
                    std::process::exit(1);
                });
        VideoReceiver::new_udp(socket)
    } else {
        let mut socket = wvb_core::net::tcp::TcpSocket::new();
        socket
            .listen(std::net::SocketAddrV4::new(
                std::net::Ipv4Addr::UNSPECIFIED,
                args.video_port,
            ))
            .ok();
        loop {
            match socket.accept() {
                Ok(()) => break,
                Err(Error::WouldBlock) => std::thread::sleep(Duration::from_millis(20)),
                Err(e) => {
                    eprintln!("video accept failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        VideoReceiver::new_tcp(socket)
    };

    // Stub pose sampler: a real client reads this from the OpenXR runtime
    // (out of scope per spec §1). A fixed identity pose lets the loop
    // below exercise the full wire path end to end.
    let sample_pose = || TrackingState {
        pose_timestamp: clock.now_rtp_timestamp(),
        sample_timestamp: clock.now_rtp_timestamp(),
        head_pose: Pose::default(),
        eye_fov: [FieldOfView::default(), FieldOfView::default()],
    };

    loop {
        let tracking = sample_pose();
        coordinator.record_emitted_pose(tracking.pose_timestamp, tracking);

        match video_receiver.poll() {
            Ok(frames) => {
                for frame in frames {
                    coordinator.on_packet_received(
                        &frame.payload,
                        frame.end_of_stream,
                        frame.frame_id,
                        frame.rtp_pose_timestamp,
                        clock.now_rtp_timestamp(),
                        clock.now_rtp_timestamp(),
                        frame.should_save_frame,
                    );
                }
            }
            Err(Error::WouldBlock) => {}
            Err(e) => tracing::warn!(error = %e, "video receive error"),
        }

        coordinator.render_frame(clock.now_rtp_timestamp());
        std::thread::sleep(Duration::from_millis(11));
    }
}
