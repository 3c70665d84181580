#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for presence-ipc integration tests.
//!
//! Provides a [`FakePeer`] listening on a real Unix socket inside a temporary
//! directory, plus helpers for building the frames a real peer sends.

use std::path::{Path, PathBuf};
use std::time::Duration;

use presence_ipc::codec::{self, Frame, FrameDecoder, Opcode};
use presence_ipc::{IpcConfig, PresenceEvent};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(5);

// ── Frame helpers ───────────────────────────────────────────────────

/// Encode a `Frame` opcode frame carrying `value`.
pub fn json_frame(value: &Value) -> Vec<u8> {
    codec::encode(Opcode::Frame, &serde_json::to_vec(value).unwrap()).unwrap()
}

/// A `DISPATCH` push of event `evt`.
pub fn dispatch(evt: &str, data: Value) -> Vec<u8> {
    json_frame(&json!({"cmd": "DISPATCH", "evt": evt, "data": data, "nonce": null}))
}

/// The `READY` push a peer sends after accepting the handshake.
pub fn ready() -> Vec<u8> {
    dispatch(
        "READY",
        json!({
            "v": 1,
            "config": {"cdn_host": "cdn.example.com", "environment": "production"},
            "user": {"id": "53908232506183680", "username": "ferris", "discriminator": "0001"},
        }),
    )
}

/// A `Close` frame with the given code and message.
pub fn close(code: i64, message: &str) -> Vec<u8> {
    codec::encode(
        Opcode::Close,
        &serde_json::to_vec(&json!({"code": code, "message": message})).unwrap(),
    )
    .unwrap()
}

/// Parse a frame payload as JSON.
pub fn body(frame: &Frame) -> Value {
    serde_json::from_slice(&frame.payload).unwrap()
}

/// Client config pointed at `dir`, with short timeouts.
pub fn config(dir: &Path) -> IpcConfig {
    IpcConfig::new("1234567890")
        .with_pid(4242)
        .with_label("test")
        .with_ipc_dir(dir)
        .with_handshake_timeout(Duration::from_millis(200))
}

/// Receive the next event or fail the test.
pub async fn next_event(events: &mut mpsc::Receiver<PresenceEvent>) -> PresenceEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// ── FakePeer ────────────────────────────────────────────────────────

/// How a [`FakePeer`] answers a handshake.
#[derive(Debug, Clone)]
pub enum Greeting {
    /// Reply with `READY`.
    Ready,
    /// Reply with a `Close` frame and hang up.
    Reject { code: i64, message: String },
    /// Reply with a `Close` frame followed by `trailing` in the same write,
    /// then hang up.
    RejectThen {
        code: i64,
        message: String,
        trailing: Vec<u8>,
    },
    /// Say nothing.
    Silent,
}

/// A frame the peer received, tagged with the 1-based connection it came on.
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: usize,
    pub frame: Frame,
}

enum Control {
    Send(Vec<u8>),
    HangUp,
}

/// A scripted peer listening on `<dir>/discord-ipc-<index>`.
///
/// Serves one connection at a time and accepts again after each one ends.
/// Every frame received is recorded in order.
pub struct FakePeer {
    path: PathBuf,
    received: mpsc::UnboundedReceiver<Received>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl FakePeer {
    pub fn bind(dir: &Path, index: u8, greeting: Greeting) -> Self {
        let path = dir.join(format!("discord-ipc-{index}"));
        let listener = UnixListener::bind(&path).unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(listener, greeting, received_tx, control_rx));
        Self {
            path,
            received,
            control,
            task,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write raw bytes to the current connection.
    pub fn push(&self, bytes: Vec<u8>) {
        self.control.send(Control::Send(bytes)).unwrap();
    }

    /// Drop the current connection.
    pub fn hang_up(&self) {
        self.control.send(Control::HangUp).unwrap();
    }

    /// Wait for the next received frame.
    pub async fn next_frame(&mut self) -> Received {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("peer task ended")
    }

    /// Wait for the next `n` received frames.
    pub async fn frames(&mut self, n: usize) -> Vec<Received> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next_frame().await);
        }
        out
    }

    /// Frames already received and not yet taken.
    pub fn drain(&mut self) -> Vec<Received> {
        let mut out = Vec::new();
        while let Ok(received) = self.received.try_recv() {
            out.push(received);
        }
        out
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    listener: UnixListener,
    greeting: Greeting,
    received: mpsc::UnboundedSender<Received>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let mut connection = 0;
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        connection += 1;
        let (mut rd, mut wr) = stream.into_split();
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 4096];
        let mut greeted = false;

        'conn: loop {
            tokio::select! {
                read = rd.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => break 'conn,
                        Ok(n) => n,
                    };
                    decoder.extend(&buf[..n]);
                    while let Ok(Some(frame)) = decoder.next_frame() {
                        let is_handshake = frame.opcode == Opcode::Handshake;
                        let _ = received.send(Received { connection, frame });
                        if is_handshake && !greeted {
                            greeted = true;
                            match &greeting {
                                Greeting::Ready => {
                                    let _ = wr.write_all(&ready()).await;
                                }
                                Greeting::Reject { code, message } => {
                                    let _ = wr.write_all(&close(*code, message)).await;
                                    break 'conn;
                                }
                                Greeting::RejectThen { code, message, trailing } => {
                                    let mut wire = close(*code, message);
                                    wire.extend_from_slice(trailing);
                                    let _ = wr.write_all(&wire).await;
                                    break 'conn;
                                }
                                Greeting::Silent => {}
                            }
                        }
                    }
                }
                ctl = control.recv() => match ctl {
                    Some(Control::Send(bytes)) => {
                        let _ = wr.write_all(&bytes).await;
                    }
                    Some(Control::HangUp) => break 'conn,
                    None => return,
                },
            }
        }
    }
}
