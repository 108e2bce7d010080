//! Error types shared by every layer of the VR bridge core.

/// Errors that can occur anywhere in the wire/transport/protocol stack.
///
/// Variants map to the error domains in the design notes:
///
/// - **Transport**: [`Io`](Self::Io), [`WouldBlock`](Self::WouldBlock),
///   [`Timeout`](Self::Timeout), [`Closed`](Self::Closed) — expected on
///   non-blocking sockets and IPC waits, always handled locally.
/// - **Protocol**: [`Malformed`](Self::Malformed),
///   [`HandshakeRejected`](Self::HandshakeRejected) — reported on the wire
///   or by dropping the offending packet.
/// - **Resource**: [`BufferExhausted`](Self::BufferExhausted),
///   [`ResourceUnavailable`](Self::ResourceUnavailable).
/// - **Application**: [`ClockSkew`](Self::ClockSkew),
///   [`DeadlineMissed`](Self::DeadlineMissed).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A non-blocking operation has no data/space available yet.
    #[error("would block")]
    WouldBlock,

    /// A blocking-with-timeout wait (IPC event, ping reply) expired.
    #[error("timed out")]
    Timeout,

    /// The peer closed the connection (TCP FIN/RST, or VRCP socket torn down).
    #[error("connection closed")]
    Closed,

    /// A packet failed size/magic/field validation and was dropped.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A VRCP handshake request (CONN_REQ) was rejected.
    #[error("handshake rejected: {reason:?} (data={data})")]
    HandshakeRejected {
        reason: crate::vrcp::RejectReason,
        data: u8,
    },

    /// The jitter buffer ran out of slots even after growing once.
    #[error("jitter buffer exhausted")]
    BufferExhausted,

    /// Clock synchronization ended with residual error after the bounded
    /// number of ping attempts.
    #[error("clock sync did not converge")]
    ClockSkew,

    /// Creating a shared-memory region or named event failed at startup.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A frame arrived (or was due) too late to meet its presentation
    /// deadline and was dropped.
    #[error("deadline missed")]
    DeadlineMissed,

    /// An NTP epoch offered by a peer predates the Unix epoch in NTP form.
    #[error("invalid NTP epoch: {0}")]
    InvalidEpoch(u64),
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
