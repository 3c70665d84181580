//! Error types for the presence IPC client.

use thiserror::Error;

use crate::protocol::EventKind;

/// Wire-level protocol violations detected by the frame codec.
///
/// Any of these is fatal to the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The header carried an opcode outside the five known values.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    /// The header announced a payload larger than the decoder accepts.
    #[error("payload length {len} exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Length announced by the header.
        len: u32,
        /// Configured upper bound.
        max: u32,
    },
}

/// Errors that can occur when using the presence IPC client.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Every candidate socket was tried and none produced a usable peer.
    #[error("no peer found after {attempts} attempts")]
    DiscoveryExhausted {
        /// Number of candidate endpoints that were tried.
        attempts: usize,
    },

    /// The peer refused the handshake (close frame or error event).
    #[error("handshake rejected: {message}")]
    HandshakeRejected {
        /// Numeric code from the peer, when one was supplied.
        code: Option<i64>,
        /// Human-readable reason.
        message: String,
    },

    /// The peer sent bytes that do not form a valid frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// The event kind is always delivered and cannot be subscribed to.
    #[error("event {0:?} cannot be subscribed to")]
    NotSubscribable(EventKind),

    /// A write was attempted while no connection is established.
    #[error("not connected to peer")]
    NotConnected,

    /// Writing a frame to the socket failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Failed to serialize or deserialize a payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    /// Returns `true` for the errors a caller of `send`, `subscribe` or
    /// `reply` sees when the write did not happen.
    pub fn is_send_failure(&self) -> bool {
        matches!(self, Self::NotConnected | Self::SendFailed(_))
    }
}

/// A specialized [`Result`] type for presence IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn send_failure_grouping() {
        assert!(IpcError::NotConnected.is_send_failure());
        assert!(IpcError::SendFailed(std::io::ErrorKind::BrokenPipe.into()).is_send_failure());
        assert!(!IpcError::Timeout.is_send_failure());
        assert!(!IpcError::DiscoveryExhausted { attempts: 10 }.is_send_failure());
        assert!(!IpcError::NotSubscribable(EventKind::Ready).is_send_failure());
    }

    #[test]
    fn frame_error_converts_into_malformed() {
        let err: IpcError = FrameError::UnknownOpcode(9).into();
        assert!(matches!(err, IpcError::MalformedFrame(FrameError::UnknownOpcode(9))));
        assert_eq!(err.to_string(), "malformed frame: unknown opcode 9");
    }
}
