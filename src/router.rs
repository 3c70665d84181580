//! Command/event routing on top of a [`Connection`].
//!
//! Inbound, [`Router`] is the connection's [`FrameHandler`]. Until the
//! handshake settles it watches the first frame for a rejection; after that
//! it turns `Frame` payloads into [`PresenceEvent`]s and publishes them, in
//! wire order, on the client's event channel. Frames arriving after a
//! rejected handshake are discarded.
//!
//! Each established connection ends with exactly one
//! [`PresenceEvent::Disconnected`]. Its channel slot is reserved up front with
//! [`Router::reserve_disconnect_slot`], so delivering it never waits on the
//! receiver.
//!
//! Outbound, [`send_command`] and [`replay_subscriptions`] serialize commands
//! into `Frame` opcode frames.

use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::codec::{Frame, Opcode};
use crate::connection::{Connection, ConnectionState, FrameHandler};
use crate::error::{IpcError, Result};
use crate::error_codes::CloseCode;
use crate::event::{DisconnectReason, PresenceEvent};
use crate::handshake::{HandshakeOutcome, HandshakeSignal};
use crate::protocol::{Command, ErrorPayload, EventKind, PeerMessage};

/// Inbound side of one connection.
#[derive(Debug)]
pub struct Router {
    events: mpsc::Sender<PresenceEvent>,
    handshake: HandshakeSignal,
    close_payload: StdMutex<Option<ErrorPayload>>,
    disconnect_slot: StdMutex<Option<mpsc::OwnedPermit<PresenceEvent>>>,
    label: String,
}

impl Router {
    /// Create a router publishing to `events`.
    ///
    /// The returned receiver yields the handshake outcome; pass it to
    /// [`handshake::perform`](crate::handshake::perform) together with
    /// [`handshake_signal`](Self::handshake_signal).
    pub fn new(
        events: mpsc::Sender<PresenceEvent>,
        label: impl Into<String>,
    ) -> (Self, oneshot::Receiver<HandshakeOutcome>) {
        let (handshake, rx) = HandshakeSignal::new();
        let router = Self {
            events,
            handshake,
            close_payload: StdMutex::new(None),
            disconnect_slot: StdMutex::new(None),
            label: label.into(),
        };
        (router, rx)
    }

    pub fn handshake_signal(&self) -> &HandshakeSignal {
        &self.handshake
    }

    /// Hold one slot of the event channel for this connection's final
    /// `Disconnected` event. Waits while the channel is full.
    pub async fn reserve_disconnect_slot(&self) {
        match self.events.clone().reserve_owned().await {
            Ok(permit) => {
                *self
                    .disconnect_slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(permit);
            }
            Err(_) => debug!(label = %self.label, "event channel closed, receiver dropped"),
        }
    }

    /// Returns `true` once the handshake was accepted. Only established
    /// connections publish events.
    pub fn is_established(&self) -> bool {
        self.handshake.is_accepted()
    }

    /// Settle the handshake from the peer's first frame. Returns `true` if
    /// the frame should also be dispatched.
    fn handle_handshake_reply(&self, frame: &Frame) -> bool {
        let rejection = match frame.opcode {
            Opcode::Close => {
                let payload = parse_close(&frame.payload);
                Some(HandshakeOutcome::Rejected {
                    code: payload.as_ref().map(|p| p.code),
                    message: payload
                        .map(|p| p.message)
                        .unwrap_or_else(|| "peer closed during handshake".into()),
                })
            }
            Opcode::Frame => match serde_json::from_slice::<PeerMessage>(&frame.payload) {
                Ok(msg) if msg.is_error() => {
                    let payload = serde_json::from_value::<ErrorPayload>(msg.data).ok();
                    Some(HandshakeOutcome::Rejected {
                        code: payload.as_ref().map(|p| p.code),
                        message: payload
                            .map(|p| p.message)
                            .unwrap_or_else(|| "handshake error".into()),
                    })
                }
                _ => None,
            },
            _ => None,
        };

        match rejection {
            Some(outcome) => {
                self.handshake.resolve(outcome);
                false
            }
            None => {
                self.handshake.resolve(HandshakeOutcome::Accepted);
                true
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        match frame.opcode {
            Opcode::Frame => {
                let msg = match serde_json::from_slice::<PeerMessage>(&frame.payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(label = %self.label, "dropping unparseable peer message: {e}");
                        return;
                    }
                };
                if msg.event_kind().is_none() {
                    trace!(label = %self.label, cmd = %msg.cmd, evt = ?msg.evt, "ignoring peer message");
                }
                if let Some(event) = PresenceEvent::from_peer_message(msg) {
                    self.publish(event).await;
                }
            }
            Opcode::Close => {
                let payload = parse_close(&frame.payload);
                debug!(label = %self.label, ?payload, "peer is closing the connection");
                *self
                    .close_payload
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = payload;
            }
            Opcode::Ping | Opcode::Pong => {
                trace!(label = %self.label, opcode = ?frame.opcode, "keep-alive frame ignored");
            }
            Opcode::Handshake => {
                warn!(label = %self.label, "unexpected handshake frame from peer");
            }
        }
    }

    /// Deliver an event. Waits for channel space instead of dropping, so
    /// one-shot events are never lost; a closed receiver discards silently.
    async fn publish(&self, event: PresenceEvent) {
        if self.events.send(event).await.is_err() {
            debug!(label = %self.label, "event channel closed, receiver dropped");
        }
    }
}

#[async_trait]
impl FrameHandler for Router {
    async fn on_frame(&self, frame: Frame) {
        if self.handshake.is_pending() {
            if !self.handle_handshake_reply(&frame) {
                return;
            }
        } else if !self.is_established() {
            trace!(label = %self.label, opcode = ?frame.opcode, "dropping frame after rejected handshake");
            return;
        }
        self.dispatch(frame).await;
    }

    async fn on_disconnect(&self, reason: DisconnectReason) {
        if self.handshake.resolve(HandshakeOutcome::Rejected {
            code: None,
            message: format!("connection lost during handshake: {reason}"),
        }) {
            // Failed candidates stay silent.
            return;
        }
        if !self.is_established() {
            return;
        }

        let reason = match reason {
            DisconnectReason::PeerClosed {
                code: None,
                message: None,
            } => match self
                .close_payload
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                Some(payload) => DisconnectReason::PeerClosed {
                    code: Some(CloseCode::from(payload.code)),
                    message: Some(payload.message),
                },
                None => DisconnectReason::PeerClosed {
                    code: None,
                    message: None,
                },
            },
            other => other,
        };

        debug!(label = %self.label, "disconnected: {reason}");
        let event = PresenceEvent::Disconnected { reason };
        let slot = self
            .disconnect_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match slot {
            Some(permit) => {
                permit.send(event);
            }
            None => self.publish(event).await,
        }
    }
}

fn parse_close(payload: &[u8]) -> Option<ErrorPayload> {
    serde_json::from_slice(payload).ok()
}

/// Serialize `command` and write it as a `Frame` opcode frame.
///
/// # Errors
///
/// Returns [`IpcError::NotConnected`] without writing anything unless the
/// connection is `Connected`, or any error from [`Connection::send`].
pub async fn send_command(conn: &Connection, command: &Command) -> Result<()> {
    if conn.state() != ConnectionState::Connected {
        return Err(IpcError::NotConnected);
    }
    let payload = command.to_payload()?;
    debug!(label = %conn.label(), cmd = ?command.cmd, evt = ?command.evt, nonce = %command.nonce, "sending command");
    conn.send(Opcode::Frame, &payload).await
}

/// Send one `SUBSCRIBE` per kind, in iteration order.
///
/// # Errors
///
/// Stops at and returns the first send error.
pub async fn replay_subscriptions(
    conn: &Connection,
    kinds: impl IntoIterator<Item = EventKind>,
) -> Result<()> {
    for kind in kinds {
        send_command(conn, &Command::subscribe(kind)).await?;
    }
    Ok(())
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
    use serde_json::json;

    use crate::error_codes::ErrorCode;

    fn frame(value: serde_json::Value) -> Frame {
        Frame::new(Opcode::Frame, serde_json::to_vec(&value).unwrap())
    }

    fn ready() -> Frame {
        frame(json!({"cmd": "DISPATCH", "evt": "READY", "data": {"v": 1}, "nonce": null}))
    }

    #[tokio::test]
    async fn ready_accepts_handshake_and_is_published() {
        let (tx, mut events) = mpsc::channel(8);
        let (router, mut outcome) = Router::new(tx, "test");

        router.on_frame(ready()).await;

        assert_eq!(outcome.try_recv().unwrap(), HandshakeOutcome::Accepted);
        assert!(router.is_established());
        assert_eq!(events.recv().await.unwrap(), PresenceEvent::Ready { user: None });
    }

    #[tokio::test]
    async fn close_frame_during_handshake_rejects_silently() {
        let (tx, mut events) = mpsc::channel(8);
        let (router, mut outcome) = Router::new(tx, "test");

        let close = Frame::new(
            Opcode::Close,
            serde_json::to_vec(&json!({"code": 4000, "message": "Invalid Client ID"})).unwrap(),
        );
        router.on_frame(close).await;
        router
            .on_frame(frame(json!({
                "cmd": "DISPATCH",
                "evt": "ACTIVITY_JOIN",
                "data": {"secret": "after-close"},
            })))
            .await;
        router
            .on_disconnect(DisconnectReason::PeerClosed {
                code: None,
                message: None,
            })
            .await;

        assert!(!router.is_established());
        assert_eq!(
            outcome.try_recv().unwrap(),
            HandshakeOutcome::Rejected {
                code: Some(4000),
                message: "Invalid Client ID".into(),
            }
        );
        drop(router);
        assert!(events.recv().await.is_none(), "rejected candidates publish nothing");
    }

    #[tokio::test]
    async fn error_event_during_handshake_rejects() {
        let (tx, _events) = mpsc::channel(8);
        let (router, mut outcome) = Router::new(tx, "test");

        router
            .on_frame(frame(json!({
                "cmd": "DISPATCH",
                "evt": "ERROR",
                "data": {"code": 4007, "message": "bad client"},
            })))
            .await;

        assert!(matches!(
            outcome.try_recv().unwrap(),
            HandshakeOutcome::Rejected { code: Some(4007), .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_during_handshake_rejects() {
        let (tx, _events) = mpsc::channel(8);
        let (router, mut outcome) = Router::new(tx, "test");

        router.on_disconnect(DisconnectReason::Io("reset".into())).await;

        assert!(matches!(
            outcome.try_recv().unwrap(),
            HandshakeOutcome::Rejected { code: None, .. }
        ));
    }

    #[tokio::test]
    async fn events_follow_wire_order_and_unknowns_are_dropped() {
        let (tx, mut events) = mpsc::channel(8);
        let (router, _outcome) = Router::new(tx, "test");

        router.on_frame(ready()).await;
        router
            .on_frame(frame(json!({"cmd": "DISPATCH", "evt": "ACTIVITY_JOIN", "data": {"secret": "a"}})))
            .await;
        router
            .on_frame(frame(json!({"cmd": "DISPATCH", "evt": "BRAND_NEW_EVENT", "data": {}})))
            .await;
        router.on_frame(Frame::new(Opcode::Frame, b"not json".to_vec())).await;
        router
            .on_frame(frame(json!({"cmd": "DISPATCH", "evt": "ACTIVITY_SPECTATE", "data": {"secret": "b"}})))
            .await;
        router
            .on_frame(frame(json!({"cmd": "SET_ACTIVITY", "evt": "ERROR", "data": {"code": 4000, "message": "x"}})))
            .await;
        router.on_frame(Frame::new(Opcode::Ping, b"{}".to_vec())).await;

        assert!(matches!(events.recv().await.unwrap(), PresenceEvent::Ready { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            PresenceEvent::ActivityJoin { secret: "a".into() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            PresenceEvent::ActivitySpectate { secret: "b".into() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            PresenceEvent::Error {
                code: ErrorCode::InvalidPayload,
                message: "x".into(),
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_payload_is_reported_on_disconnect() {
        let (tx, mut events) = mpsc::channel(8);
        let (router, _outcome) = Router::new(tx, "test");
        router.on_frame(ready()).await;
        let _ = events.recv().await;

        router
            .on_frame(Frame::new(
                Opcode::Close,
                serde_json::to_vec(&json!({"code": 4002, "message": "slow down"})).unwrap(),
            ))
            .await;
        router
            .on_disconnect(DisconnectReason::PeerClosed {
                code: None,
                message: None,
            })
            .await;

        assert_eq!(
            events.recv().await.unwrap(),
            PresenceEvent::Disconnected {
                reason: DisconnectReason::PeerClosed {
                    code: Some(CloseCode::RateLimited),
                    message: Some("slow down".into()),
                }
            }
        );
    }

    #[tokio::test]
    async fn reserved_slot_delivers_disconnect_into_a_full_channel() {
        let (tx, mut events) = mpsc::channel(2);
        let (router, _outcome) = Router::new(tx, "test");
        router.reserve_disconnect_slot().await;

        router.on_frame(ready()).await;
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            router.on_disconnect(DisconnectReason::LocalShutdown),
        )
        .await
        .expect("disconnect must not wait for the receiver");

        assert!(matches!(events.recv().await.unwrap(), PresenceEvent::Ready { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            PresenceEvent::Disconnected {
                reason: DisconnectReason::LocalShutdown,
            }
        );
        assert!(events.try_recv().is_err());
    }
}
