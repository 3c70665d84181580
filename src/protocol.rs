//! Wire-compatible payload types for the rich-presence IPC protocol.
//!
//! Frame payloads are JSON objects. Field names and the command/event
//! vocabulary here must match the peer exactly:
//!
//! - handshake: `{"v": 1, "client_id": "..."}`
//! - command: `{"cmd": "SET_ACTIVITY", "args": {...}, "nonce": "..."}`
//! - subscription: `{"cmd": "SUBSCRIBE", "evt": "ACTIVITY_JOIN", "args": {}, "nonce": "..."}`
//! - peer message: `{"cmd": "DISPATCH", "evt": "READY", "data": {...}, "nonce": null}`
//! - close payload: `{"code": 4000, "message": "..."}`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of the one-time handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol version.
    pub v: u32,
    /// Application identifier.
    pub client_id: String,
}

/// Command names understood by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Used by the peer for pushed events; never sent by the client.
    Dispatch,
    SetActivity,
    SendActivityJoinInvite,
    CloseActivityJoinRequest,
    Subscribe,
    Unsubscribe,
}

/// Event names used by the peer.
///
/// The derived ordering is the order subscriptions are replayed in after a
/// reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Ready,
    Error,
    ActivityJoin,
    ActivitySpectate,
    ActivityJoinRequest,
}

impl EventKind {
    /// Look up an event by its wire name. Unknown names yield `None`.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "READY" => Some(Self::Ready),
            "ERROR" => Some(Self::Error),
            "ACTIVITY_JOIN" => Some(Self::ActivityJoin),
            "ACTIVITY_SPECTATE" => Some(Self::ActivitySpectate),
            "ACTIVITY_JOIN_REQUEST" => Some(Self::ActivityJoinRequest),
            _ => None,
        }
    }

    /// Returns `true` for kinds the peer accepts in `SUBSCRIBE`.
    /// `READY` and `ERROR` are always delivered and cannot be subscribed to.
    pub fn is_subscribable(self) -> bool {
        matches!(
            self,
            Self::ActivityJoin | Self::ActivitySpectate | Self::ActivityJoinRequest
        )
    }

    /// The event kinds subscribed to by default.
    pub const DEFAULT_SUBSCRIPTIONS: [EventKind; 3] = [
        EventKind::ActivityJoin,
        EventKind::ActivitySpectate,
        EventKind::ActivityJoinRequest,
    ];
}

/// An outbound command.
///
/// Created by the caller and consumed by the router, which serializes it into
/// a single `Frame` opcode frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub cmd: CommandKind,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evt: Option<EventKind>,
    /// Unique per command. Not correlated with replies.
    pub nonce: String,
}

impl Command {
    /// Create a command with empty arguments and a fresh nonce.
    pub fn new(cmd: CommandKind) -> Self {
        Self {
            cmd,
            args: Map::new(),
            evt: None,
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Add an argument.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// `SUBSCRIBE` to pushes of `evt`.
    pub fn subscribe(evt: EventKind) -> Self {
        Self {
            evt: Some(evt),
            ..Self::new(CommandKind::Subscribe)
        }
    }

    /// `UNSUBSCRIBE` from pushes of `evt`.
    pub fn unsubscribe(evt: EventKind) -> Self {
        Self {
            evt: Some(evt),
            ..Self::new(CommandKind::Unsubscribe)
        }
    }

    /// `SET_ACTIVITY` for process `pid`. A `null` activity clears presence.
    pub fn set_activity(pid: u32, activity: Value) -> Self {
        Self::new(CommandKind::SetActivity)
            .with_arg("pid", pid)
            .with_arg("activity", activity)
    }

    /// Answer a join request from `user_id`.
    pub fn join_reply(user_id: impl Into<String>, reply: JoinReply) -> Self {
        Self::new(reply.command_kind()).with_arg("user_id", user_id.into())
    }

    /// Serialize into a frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if an argument fails to serialize.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// How to answer an `ACTIVITY_JOIN_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinReply {
    Yes,
    No,
    Ignore,
}

impl JoinReply {
    /// The command that carries this reply.
    pub fn command_kind(self) -> CommandKind {
        match self {
            Self::Yes => CommandKind::SendActivityJoinInvite,
            Self::No | Self::Ignore => CommandKind::CloseActivityJoinRequest,
        }
    }
}

/// A message pushed or replied by the peer.
///
/// `cmd` and `evt` are kept as raw strings so that names this client does
/// not know about still parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evt: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl PeerMessage {
    /// The known event kind of this message, if any.
    pub fn event_kind(&self) -> Option<EventKind> {
        self.evt.as_deref().and_then(EventKind::from_wire)
    }

    /// Returns `true` if the peer tagged this message as an error.
    pub fn is_error(&self) -> bool {
        self.event_kind() == Some(EventKind::Error)
    }
}

/// A user as described in join requests and the `READY` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialUser {
    /// Snowflake ID of the user.
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// `data` of an `ERROR` event, and body of a `Close` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// `data` of the `READY` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<PartialUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// `data` of the `ACTIVITY_JOIN` and `ACTIVITY_SPECTATE` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPayload {
    pub secret: String,
}

/// `data` of the `ACTIVITY_JOIN_REQUEST` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequestPayload {
    pub user: PartialUser,
}
