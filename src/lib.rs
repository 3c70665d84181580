//! # presence-ipc
//!
//! Client-side transport for the rich-presence local IPC protocol.
//!
//! The peer process listens on a Unix socket named `discord-ipc-<n>`
//! (`n` in `0..10`) in the per-user runtime or temporary directory. This crate
//! finds that socket, performs the versioned handshake, frames JSON commands
//! onto it and turns the peer's pushes into typed [`PresenceEvent`]s.
//!
//! ## Features
//!
//! - **Wire-exact framing**: 4-byte little-endian opcode, 4-byte little-endian
//!   length, payload; incremental decoding across partial reads
//! - **Quiet discovery**: tries each candidate socket in order and reports only
//!   when none answered
//! - **Reconnect-safe**: subscriptions and presence are re-sent after every
//!   handshake
//! - **Event-driven**: receive typed events on a channel, in wire order
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use presence_ipc::{IpcConfig, PresenceClient};
//!
//! # async fn run() -> presence_ipc::Result<()> {
//! let (client, _events) = PresenceClient::new(IpcConfig::new("123456789012345678"));
//! client.connect().await?;
//! client
//!     .set_presence(&serde_json::json!({"state": "Exploring", "details": "Level 3"}))
//!     .await?;
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("presence-ipc only supports Unix-domain socket platforms");

pub mod client;
pub mod codec;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod handshake;
pub mod protocol;
pub mod router;

// Re-export primary types for ergonomic imports.
pub use client::{IpcConfig, PresenceClient};
pub use codec::{Frame, FrameDecoder, Opcode};
pub use connection::{Connection, ConnectionState, FrameHandler};
pub use discovery::{AttemptLogging, SocketEndpoint};
pub use error::{FrameError, IpcError, Result};
pub use error_codes::{CloseCode, ErrorCode};
pub use event::{DisconnectReason, PresenceEvent};
pub use protocol::{Command, CommandKind, EventKind, JoinReply, PartialUser};
