//! Protocol error taxonomy.
//!
//! Handshake failures are surfaced to the caller so the UI can tell the
//! user to restart both sides. Transfer-level drops (orphan chunks, sends
//! on a closed channel) are deliberately *not* errors - they are handled
//! silently inside the transfer layer and only logged.

use thiserror::Error;

/// Errors produced while establishing a session from out-of-band codes.
#[derive(Debug, Error)]
pub enum SignalError {
    /// The pasted/scanned code could not be parsed at all. The user must
    /// rescan or re-paste.
    #[error("malformed signaling code: {0}")]
    MalformedCode(&'static str),

    /// An offer code was presented where an answer was expected, or vice
    /// versa. The handshake must be restarted.
    #[error("expected {expected} code, got {found} code")]
    ProtocolMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// The transport stack refused the remote description - stale or
    /// incompatible session. Both sides must restart.
    #[error("remote description rejected: {0}")]
    HandshakeRejected(#[source] webrtc::Error),

    /// An operation was attempted in a handshake state that does not
    /// permit it (e.g. a second create_offer on the same coordinator).
    #[error("invalid handshake state for {op}: {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// Any other failure from the underlying WebRTC stack.
    #[error("webrtc transport error")]
    Transport(#[from] webrtc::Error),
}

/// Errors produced by the chunked transfer layer.
///
/// Note that a chunk for an unknown transfer id is *not* represented
/// here: orphan chunks are dropped silently by design.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The data channel refused a send. Callers treat this as fatal for
    /// the current artifact only.
    #[error("data channel send failed: {0}")]
    ChannelSend(#[source] webrtc::Error),

    /// A binary frame shorter than the fixed chunk header.
    #[error("chunk frame too short: {len} bytes")]
    FrameTooShort { len: usize },

    /// A structured message that failed to encode.
    #[error("failed to encode control message")]
    Encode(#[from] serde_json::Error),
}
