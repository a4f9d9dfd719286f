//! Channel error taxonomy.
//!
//! Transient transport loss is recovered internally and never reaches the
//! caller beyond the connected signal flipping; only terminal conditions are
//! pushed through the error observable. Per-subscription failures are not
//! errors at all; they resolve to an absent document.

use thiserror::Error;

/// Failures surfaced by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Socket-level failure or a non-terminal close. Recovered automatically
    /// through the reconnect path.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server permanently rejected the authentication handshake.
    /// Fatal for the channel; no retry is scheduled.
    #[error("authentication rejected by server")]
    AuthRejected,

    /// The transport never reported open within the handshake guard window.
    #[error("handshake timed out before the transport opened")]
    HandshakeTimeout,

    /// Malformed inbound frame. Logged at the decode site and ignored.
    #[error("malformed frame: {0}")]
    Protocol(String),

    /// The channel was permanently disconnected while the operation was
    /// still waiting on the readiness gate.
    #[error("channel disconnected")]
    Disconnected,
}
