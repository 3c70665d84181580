//! Typed events delivered to the application.

use std::fmt;

use tracing::warn;

use crate::error::FrameError;
use crate::error_codes::{CloseCode, ErrorCode};
use crate::protocol::{
    ErrorPayload, EventKind, JoinRequestPayload, PartialUser, PeerMessage, ReadyPayload,
    SecretPayload,
};

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream. Carries the code and message of the
    /// peer's `Close` frame when one preceded the end of stream.
    PeerClosed {
        code: Option<CloseCode>,
        message: Option<String>,
    },
    /// The peer sent bytes that are not a valid frame.
    Malformed(FrameError),
    /// An OS-level read error.
    Io(String),
    /// The client closed the connection itself.
    LocalShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed {
                code: Some(code),
                message: Some(message),
            } => write!(f, "peer closed the connection: {message} ({})", code.code()),
            Self::PeerClosed { code: Some(code), .. } => {
                write!(f, "peer closed the connection ({})", code.code())
            }
            Self::PeerClosed { .. } => f.write_str("peer closed the connection"),
            Self::Malformed(err) => write!(f, "malformed frame: {err}"),
            Self::Io(err) => write!(f, "socket error: {err}"),
            Self::LocalShutdown => f.write_str("client disconnected"),
        }
    }
}

/// An event produced from the peer's traffic.
///
/// Each inbound frame produces at most one event. `Disconnected` is emitted
/// exactly once per established connection, always as that connection's last event.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// The peer accepted the handshake.
    Ready { user: Option<PartialUser> },
    /// The peer reported an error, usually in reply to a command.
    Error { code: ErrorCode, message: String },
    /// The user accepted an invite; `secret` identifies the match to join.
    ActivityJoin { secret: String },
    /// The user wants to spectate; `secret` identifies the match.
    ActivitySpectate { secret: String },
    /// Another user asked to join. Answer with `PresenceClient::reply`.
    ActivityJoinRequest { user: PartialUser },
    /// The connection ended.
    Disconnected { reason: DisconnectReason },
}

impl PresenceEvent {
    /// Map a peer message to an event.
    ///
    /// Messages with unknown event names, replies without an event, and
    /// events whose data does not match the expected shape all yield `None`.
    pub fn from_peer_message(msg: PeerMessage) -> Option<Self> {
        let kind = msg.event_kind()?;
        let event = match kind {
            EventKind::Ready if msg.data.is_null() => Self::Ready { user: None },
            EventKind::Ready => {
                let payload = parse_data::<ReadyPayload>(kind, msg.data)?;
                Self::Ready { user: payload.user }
            }
            EventKind::Error => {
                let payload = parse_data::<ErrorPayload>(kind, msg.data)?;
                Self::Error {
                    code: ErrorCode::from(payload.code),
                    message: payload.message,
                }
            }
            EventKind::ActivityJoin => Self::ActivityJoin {
                secret: parse_data::<SecretPayload>(kind, msg.data)?.secret,
            },
            EventKind::ActivitySpectate => Self::ActivitySpectate {
                secret: parse_data::<SecretPayload>(kind, msg.data)?.secret,
            },
            EventKind::ActivityJoinRequest => Self::ActivityJoinRequest {
                user: parse_data::<JoinRequestPayload>(kind, msg.data)?.user,
            },
        };
        Some(event)
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(kind: EventKind, data: serde_json::Value) -> Option<T> {
    match serde_json::from_value(data) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!("dropping {kind:?} event with unexpected data: {e}");
            None
        }
    }
}
