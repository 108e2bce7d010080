mod config;
mod pipeline;

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use wvb_core::net::udp::UdpSocket;
use wvb_core::rtp::clock::RtpClock;
use wvb_core::telemetry::MeasurementBucket;
use wvb_core::video_socket::VideoSender;
use wvb_core::vrcp::server::VrcpServerSocket;
use wvb_driver::DriverServerIpc;

use config::Args;
use pipeline::{NullEncoder, NullFrameSource, VideoWorker};

const VRCP_TCP_PORT: u16 = 7671;
const ADVERTISEMENT_INTERVAL: Duration = Duration::from_secs(1);

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if let Some(pass) = args.benchmark.first() {
        tracing::info!(codec = %pass.codec_id, "benchmark pass configured");
    }

    let codec_preference = vec![args.codec.clone(), "h264".to_string()];
    let mut vrcp = match VrcpServerSocket::new(
        VRCP_TCP_PORT,
        ADVERTISEMENT_INTERVAL,
        vec![], // broadcast targets discovered per-subnet at deploy time
        codec_preference,
        true,
    ) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to start VRCP server: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(port = vrcp.tcp_port(), "wvb-server listening");

    let ipc = Arc::new(DriverServerIpc::new());
    let clock = Arc::new(RtpClock::new());
    let mut bucket = MeasurementBucket::default();
    bucket.set_clock(clock.clone());
    bucket.set_as_accept_all();
    let bucket = Arc::new(bucket);

    let mut worker_handle = None;
    let run_interval = args.run_interval();

    loop {
        if let Err(e) = vrcp.poll() {
            tracing::warn!(error = %e, "vrcp poll error");
        }

        if vrcp.state() == wvb_core::vrcp::server::ServerState::Connected && worker_handle.is_none() {
            let Some(peer) = vrcp.peer_udp_addr else {
                continue;
            };
            let socket = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to bind video socket");
                    continue;
                }
            };
            let video_sender = VideoSender::new_udp(socket, rand::random(), peer);
            let worker = VideoWorker::new(
                ipc.clone(),
                clock.clone(),
                Box::new(NullFrameSource {
                    width: 1832,
                    height: 1920,
                }),
                Box::new(NullEncoder::default()),
                video_sender,
                None,
                bucket.clone(),
                Duration::from_millis(11), // ~90 Hz frame budget
            );
            worker_handle = Some(worker.spawn());
            tracing::info!("video pipeline worker started");
        }

        if vrcp.state() != wvb_core::vrcp::server::ServerState::Connected {
            if let Some(handle) = worker_handle.take() {
                // the worker thread checks should_kill on its own; here we
                // only drop our handle once the session has ended.
                drop(handle);
            }
        }

        std::thread::sleep(run_interval);

        // A real deployment runs until signaled; this CLI stops on a blank
        // line on stdin for interactive use.
        if poll_stdin_for_stop() {
            break;
        }
    }

    tracing::info!("wvb-server shutting down");
}

/// Non-blocking-ish stop check: this binary is driven by `run_interval`
/// polling already, so rather than spawn a dedicated stdin reader thread we
/// just check once per loop whether stdin has a line ready. Keeping this
/// simple avoids pulling in an async runtime for a CLI nicety.
fn poll_stdin_for_stop() -> bool {
    use std::io::BufRead;
    // This is a best-effort check; real shutdown should come from a signal
    // handler, which is out of scope here.
    let stdin = io::stdin();
    if let Ok(n) = stdin.lock().fill_buf().map(|b| b.len()) {
        if n > 0 {
            let mut line = String::new();
            let _ = stdin.lock().read_line(&mut line);
            return true;
        }
    }
    false
}
