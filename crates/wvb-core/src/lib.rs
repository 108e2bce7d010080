//! # wvb-core — wire protocol and media transport for the VR streaming bridge
//!
//! A Rust library implementing the wireless VR bridge's shared core: the
//! VRCP control channel, RTP-clocked video transport, and the IPC
//! primitives the driver and server sides build on.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP | Packet header format, sequence/timestamp wraparound, clock rate |
//! | [RFC 6184](https://tools.ietf.org/html/rfc6184) | H.264 RTP payload | NAL unit packetization, FU-A fragmentation |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  video_socket   — Tcp/Udp dispatch shim   │
//! ├──────────────────────────────────────────┤
//! │  vrcp           — handshake/control state │
//! │  telemetry      — benchmark measurement   │
//! ├──────────────────────────────────────────┤
//! │  rtp            — clock, header, jitter,  │
//! │                    H.264 packetization     │
//! │  simple         — length-prefixed framing │
//! ├──────────────────────────────────────────┤
//! │  net            — non-blocking TCP/UDP    │
//! │  ipc            — shared region + events  │
//! │  wire           — byte-order primitives   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Crate layout
//!
//! - [`error`] — [`Error`] enum and [`Result`] alias shared by every layer.
//! - [`wire`] — network byte-order helpers and fixed-width string packing.
//! - [`rtp`] — RTP clock, header, jitter buffer, H.264 packetization.
//! - [`simple`] — length-prefixed TCP video framing.
//! - [`net`] — non-blocking TCP/UDP socket wrappers.
//! - [`ipc`] — in-process stand-in for the driver/server shared-memory
//!   region and named events.
//! - [`vrcp`] — discovery, handshake and control protocol state machines.
//! - [`telemetry`] — benchmark measurement buckets.
//! - [`types`] — shared data model (poses, tracking state, frame info).
//! - [`video_socket`] — transport-agnostic send/receive shim.

pub mod error;
pub mod ipc;
pub mod net;
pub mod rtp;
pub mod simple;
pub mod telemetry;
pub mod types;
pub mod video_socket;
pub mod vrcp;
pub mod wire;

pub use error::{Error, Result};
