//! The one-time version/identity exchange that opens every connection.
//!
//! Right after the socket connects the client sends a single `Handshake`
//! frame, `{"v": 1, "client_id": <app id>}`, before any other traffic. The
//! peer does not have to acknowledge it. The client waits up to a bounded
//! timeout for the peer's first frame to catch an early rejection:
//!
//! - a `Close` frame, an `ERROR` event, or the connection dropping means the
//!   handshake was rejected;
//! - any other frame (normally the `READY` dispatch) means it was accepted;
//! - silence until the timeout is taken as acceptance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::Opcode;
use crate::connection::{Connection, ConnectionState};
use crate::error::{IpcError, Result};
use crate::protocol::Handshake;

/// Protocol version sent in the handshake.
pub const HANDSHAKE_VERSION: u32 = 1;

/// Default time to wait for an early rejection before assuming success.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// How the peer reacted to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted,
    Rejected { code: Option<i64>, message: String },
}

/// One-shot slot the inbound side uses to report the handshake outcome.
///
/// The first call to [`resolve`](Self::resolve) wins; later calls are no-ops.
#[derive(Debug)]
pub struct HandshakeSignal {
    tx: StdMutex<Option<oneshot::Sender<HandshakeOutcome>>>,
    accepted: AtomicBool,
}

impl HandshakeSignal {
    pub fn new() -> (Self, oneshot::Receiver<HandshakeOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: StdMutex::new(Some(tx)),
                accepted: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Report the outcome. Returns `false` if it was already reported.
    pub fn resolve(&self, outcome: HandshakeOutcome) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match tx {
            Some(tx) => {
                if outcome == HandshakeOutcome::Accepted {
                    self.accepted.store(true, Ordering::Release);
                }
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Returns `true` until an outcome has been reported.
    pub fn is_pending(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Returns `true` if the first reported outcome was `Accepted`.
    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::Acquire)
    }
}

/// Send the handshake on `conn` and wait for the outcome.
///
/// Moves the connection state to `Handshaking`, then to `Connected` on
/// success. On failure the state is left for the caller to close.
///
/// # Errors
///
/// Returns [`IpcError::HandshakeRejected`] if the peer rejects the handshake
/// or drops the connection, or any error from writing the handshake frame.
pub async fn perform(
    conn: &Connection,
    client_id: &str,
    signal: &HandshakeSignal,
    mut outcome_rx: oneshot::Receiver<HandshakeOutcome>,
    timeout: Duration,
) -> Result<()> {
    conn.set_state(ConnectionState::Handshaking);

    let payload = serde_json::to_vec(&Handshake {
        v: HANDSHAKE_VERSION,
        client_id: client_id.to_owned(),
    })?;
    conn.send(Opcode::Handshake, &payload).await?;

    let outcome = match tokio::time::timeout(timeout, &mut outcome_rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => HandshakeOutcome::Rejected {
            code: None,
            message: "handshake listener dropped".into(),
        },
        Err(_) => {
            if signal.resolve(HandshakeOutcome::Accepted) {
                debug!(label = %conn.label(), "no reply to handshake within {timeout:?}; assuming accepted");
                HandshakeOutcome::Accepted
            } else {
                // Resolved concurrently with the timeout firing.
                outcome_rx.try_recv().unwrap_or(HandshakeOutcome::Accepted)
            }
        }
    };

    match outcome {
        HandshakeOutcome::Accepted => {
            conn.set_state(ConnectionState::Connected);
            Ok(())
        }
        HandshakeOutcome::Rejected { code, message } => {
            Err(IpcError::HandshakeRejected { code, message })
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;

    use crate::codec::{Frame, FrameDecoder};
    use crate::connection::{state_cell, ConnectionOptions, FrameHandler};
    use crate::event::DisconnectReason;

    struct Ignore;

    #[async_trait]
    impl FrameHandler for Ignore {
        async fn on_frame(&self, _frame: Frame) {}
        async fn on_disconnect(&self, _reason: DisconnectReason) {}
    }

    #[test]
    fn first_resolution_wins() {
        let (signal, mut rx) = HandshakeSignal::new();
        assert!(signal.is_pending());
        assert!(signal.resolve(HandshakeOutcome::Accepted));
        assert!(!signal.resolve(HandshakeOutcome::Rejected {
            code: None,
            message: "late".into(),
        }));
        assert!(!signal.is_pending());
        assert!(signal.is_accepted());
        assert_eq!(rx.try_recv().unwrap(), HandshakeOutcome::Accepted);
    }

    #[tokio::test]
    async fn handshake_frame_is_first_and_well_formed() {
        let (client, mut peer) = tokio::io::duplex(4096);
        let state = state_cell();
        let conn = Connection::from_stream(
            client,
            Arc::new(Ignore),
            Arc::clone(&state),
            ConnectionOptions::default(),
        );
        let (signal, rx) = HandshakeSignal::new();
        signal.resolve(HandshakeOutcome::Accepted);

        perform(&conn, "1234", &signal, rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        let mut buf = [0u8; 256];
        let n = peer.read(&mut buf).await.unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&buf[..n]);
        let frame = decoder.next_frame().unwrap().expect("handshake frame");
        assert_eq!(frame.opcode, Opcode::Handshake);
        let body: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(body, serde_json::json!({"v": 1, "client_id": "1234"}));
    }

    #[tokio::test]
    async fn rejection_is_reported() {
        let (client, _peer) = tokio::io::duplex(4096);
        let conn = Connection::from_stream(
            client,
            Arc::new(Ignore),
            state_cell(),
            ConnectionOptions::default(),
        );
        let (signal, rx) = HandshakeSignal::new();
        signal.resolve(HandshakeOutcome::Rejected {
            code: Some(4000),
            message: "Invalid Client ID".into(),
        });

        let err = perform(&conn, "bad", &signal, rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            IpcError::HandshakeRejected { code, message } => {
                assert_eq!(code, Some(4000));
                assert_eq!(message, "Invalid Client ID");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_ne!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn silent_peer_is_accepted_after_timeout() {
        let (client, _peer) = tokio::io::duplex(4096);
        let conn = Connection::from_stream(
            client,
            Arc::new(Ignore),
            state_cell(),
            ConnectionOptions::default(),
        );
        let (signal, rx) = HandshakeSignal::new();

        perform(&conn, "1234", &signal, rx, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!signal.is_pending());
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
