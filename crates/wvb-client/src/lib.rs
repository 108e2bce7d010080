//! # wvb-client — headset-side process for the wireless VR bridge
//!
//! Drives the [`wvb_core::vrcp::VrcpClientSocket`] discovery/handshake
//! state machine, the clock-sync ping loop, and the render/decode
//! coordinator (spec §4.9) that turns received video packets into
//! compositor submissions.

pub mod coordinator;
