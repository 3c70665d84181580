//! One socket, its read loop, and a serialized write path.
//!
//! A [`Connection`] is created per connect attempt and never reused. Opening
//! it spawns a background task that is the only reader of the socket: it
//! feeds bytes through a [`FrameDecoder`] and hands each complete frame to the
//! registered [`FrameHandler`]. When the stream ends, a read fails, a frame is
//! malformed, or [`Connection::close`] is called, the task moves the shared
//! state to [`ConnectionState::Disconnected`], calls
//! [`FrameHandler::on_disconnect`] exactly once, and exits. A handler call
//! still waiting when [`Connection::close`] is called is cancelled, so a
//! stalled handler never holds the loop open.
//!
//! Writes happen on the caller's task. Each frame is encoded into one buffer
//! and written under an async mutex, so concurrent senders never interleave.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{self, Frame, FrameDecoder, Opcode};
use crate::error::{IpcError, Result};
use crate::event::DisconnectReason;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8 * 1024;

/// Default time [`Connection::close`] waits for the read loop to exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a connection.
///
/// `Disconnected → Connecting → Handshaking → Connected → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// Shared, latest-value cell holding the current [`ConnectionState`].
///
/// The client creates one and hands it to every connection it opens, so
/// observers keep a single stream across reconnects.
pub type StateCell = Arc<watch::Sender<ConnectionState>>;

/// Create a new [`StateCell`] starting in `Disconnected`.
pub fn state_cell() -> StateCell {
    Arc::new(watch::Sender::new(ConnectionState::Disconnected))
}

/// Receives the inbound side of a [`Connection`].
///
/// Both methods run on the connection's read task, in wire order. A slow
/// handler applies backpressure to the socket rather than dropping frames.
/// An `on_frame` call may be cancelled when the connection is closed;
/// `on_disconnect` never is and must not wait on anything outside the crate.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// A complete frame arrived.
    async fn on_frame(&self, frame: Frame);

    /// The connection ended. Called exactly once, after the last `on_frame`.
    async fn on_disconnect(&self, reason: DisconnectReason);
}

/// Settings for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Attached to every log line from this connection.
    pub label: String,
    /// How long [`Connection::close`] waits for the read loop before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            label: "presence-ipc".into(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open socket to the peer.
pub struct Connection {
    writer: Mutex<Option<BoxedWriter>>,
    state: StateCell,
    reader: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    options: ConnectionOptions,
}

impl Connection {
    /// Open the Unix socket at `path` and start the read loop.
    ///
    /// Moves `state` to `Connecting` for the duration of the attempt and back
    /// to `Disconnected` if it fails.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Io`] if nothing accepts connections at `path`.
    /// `NotFound` and `ConnectionRefused` are the usual kinds when no peer
    /// is listening.
    pub async fn connect(
        path: &Path,
        handler: Arc<dyn FrameHandler>,
        state: StateCell,
        options: ConnectionOptions,
    ) -> Result<Self> {
        state.send_replace(ConnectionState::Connecting);
        match UnixStream::connect(path).await {
            Ok(stream) => {
                trace!(label = %options.label, path = %path.display(), "socket connected");
                Ok(Self::from_stream(stream, handler, state, options))
            }
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                Err(IpcError::Io(e))
            }
        }
    }

    /// Wrap an already-connected byte stream and start the read loop.
    ///
    /// Does not change `state`; the caller drives the handshake transitions.
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(
        stream: S,
        handler: Arc<dyn FrameHandler>,
        state: StateCell,
        options: ConnectionOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let reader = tokio::spawn(read_loop(
            read_half,
            handler,
            Arc::clone(&state),
            shutdown_rx,
            options.label.clone(),
        ));

        Self {
            writer: Mutex::new(Some(Box::new(write_half))),
            state,
            reader: Some(reader),
            shutdown_tx: Some(shutdown_tx),
            options,
        }
    }

    /// Current state of the shared state cell.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Label used in this connection's log lines.
    pub fn label(&self) -> &str {
        &self.options.label
    }

    /// Encode and write one frame.
    ///
    /// Safe to call from several tasks at once; frames are written whole, one
    /// at a time.
    ///
    /// # Errors
    ///
    /// - [`IpcError::NotConnected`] after [`close`](Self::close); nothing is written.
    /// - [`IpcError::MalformedFrame`] if the payload exceeds the frame limit.
    /// - [`IpcError::SendFailed`] if the socket write fails.
    pub async fn send(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let bytes = codec::encode(opcode, payload)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(IpcError::NotConnected)?;
        writer.write_all(&bytes).await.map_err(IpcError::SendFailed)?;
        writer.flush().await.map_err(IpcError::SendFailed)?;
        trace!(label = %self.options.label, ?opcode, len = payload.len(), "frame sent");
        Ok(())
    }

    /// Release the socket and wait for the read loop to exit.
    ///
    /// Idempotent: later calls return immediately. If the read loop does not
    /// exit within the shutdown timeout it is aborted.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(label = %self.options.label, "socket shutdown failed: {e}");
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.reader.take() {
            match tokio::time::timeout(self.options.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!(label = %self.options.label, "read loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!(label = %self.options.label, "read loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!(label = %self.options.label, "read loop aborted: {join_err}");
                    }
                    self.state.send_replace(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Returns `true` once the read loop has exited.
    pub fn is_closed(&self) -> bool {
        self.reader.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.options.label)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read until the stream ends, fails, turns malformed, or shutdown is signalled.
///
/// Dropping the [`Connection`] drops `shutdown_tx`, which also ends the loop.
async fn read_loop<R>(
    mut reader: R,
    handler: Arc<dyn FrameHandler>,
    state: StateCell,
    mut shutdown_rx: oneshot::Receiver<()>,
    label: String,
) where
    R: AsyncRead + Send + Unpin,
{
    debug!(label = %label, "read loop started");

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    let reason = 'read: loop {
        let read = tokio::select! {
            _ = &mut shutdown_rx => break 'read DisconnectReason::LocalShutdown,
            read = reader.read(&mut buf) => read,
        };

        let chunk = match read {
            Ok(0) => {
                break DisconnectReason::PeerClosed {
                    code: None,
                    message: None,
                }
            }
            Ok(n) => buf.get(..n).unwrap_or_default(),
            Err(e) => break DisconnectReason::Io(e.to_string()),
        };
        decoder.extend(chunk);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    trace!(label = %label, opcode = ?frame.opcode, len = frame.payload.len(), "frame received");
                    tokio::select! {
                        biased;
                        _ = &mut shutdown_rx => {
                            debug!(label = %label, "shutdown while handling a frame; remaining frames discarded");
                            break 'read DisconnectReason::LocalShutdown;
                        }
                        () = handler.on_frame(frame) => {}
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(label = %label, "malformed frame from peer: {e}");
                    break 'read DisconnectReason::Malformed(e);
                }
            }
        }
    };

    debug!(label = %label, "read loop exiting: {reason}");
    state.send_replace(ConnectionState::Disconnected);
    handler.on_disconnect(reason).await;
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
    use std::sync::Mutex as StdMutex;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    /// Records everything the read loop delivers.
    enum Seen {
        Frame(Frame),
        Disconnect(DisconnectReason),
    }

    struct RecordingHandler {
        tx: mpsc::UnboundedSender<Seen>,
    }

    #[async_trait]
    impl FrameHandler for RecordingHandler {
        async fn on_frame(&self, frame: Frame) {
            let _ = self.tx.send(Seen::Frame(frame));
        }

        async fn on_disconnect(&self, reason: DisconnectReason) {
            let _ = self.tx.send(Seen::Disconnect(reason));
        }
    }

    fn open() -> (Connection, DuplexStream, mpsc::UnboundedReceiver<Seen>, StateCell) {
        let (client, peer) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let state = state_cell();
        let conn = Connection::from_stream(
            client,
            Arc::new(RecordingHandler { tx }),
            Arc::clone(&state),
            ConnectionOptions::default(),
        );
        (conn, peer, rx, state)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for handler")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn frames_are_delivered_in_order_across_split_writes() {
        let (mut conn, mut peer, mut rx, _state) = open();

        let mut wire = codec::encode(Opcode::Frame, b"first").unwrap();
        wire.extend(codec::encode(Opcode::Ping, b"second").unwrap());
        for chunk in wire.chunks(3) {
            peer.write_all(chunk).await.unwrap();
            tokio::task::yield_now().await;
        }

        match next(&mut rx).await {
            Seen::Frame(f) => assert_eq!(f, Frame::new(Opcode::Frame, b"first".to_vec())),
            Seen::Disconnect(r) => panic!("unexpected disconnect: {r}"),
        }
        match next(&mut rx).await {
            Seen::Frame(f) => assert_eq!(f, Frame::new(Opcode::Ping, b"second".to_vec())),
            Seen::Disconnect(r) => panic!("unexpected disconnect: {r}"),
        }

        conn.close().await;
    }

    #[tokio::test]
    async fn end_of_stream_disconnects_once() {
        let (mut conn, peer, mut rx, state) = open();
        drop(peer);

        match next(&mut rx).await {
            Seen::Disconnect(DisconnectReason::PeerClosed { .. }) => {}
            _ => panic!("expected PeerClosed"),
        }
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);

        conn.close().await;
        assert!(rx.recv().await.is_none(), "handler must not be called again");
    }

    #[tokio::test]
    async fn malformed_frame_stops_dispatch() {
        let (mut conn, mut peer, mut rx, _state) = open();

        let mut wire = codec::encode(Opcode::Frame, b"ok").unwrap();
        wire.extend_from_slice(&1u32.to_le_bytes());
        wire.extend_from_slice(&(codec::MAX_PAYLOAD_LEN + 1).to_le_bytes());
        wire.extend(codec::encode(Opcode::Frame, b"never").unwrap());
        peer.write_all(&wire).await.unwrap();

        assert!(matches!(next(&mut rx).await, Seen::Frame(_)));
        assert!(matches!(
            next(&mut rx).await,
            Seen::Disconnect(DisconnectReason::Malformed(_))
        ));

        conn.close().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reports_local_shutdown() {
        let (mut conn, _peer, mut rx, state) = open();
        state.send_replace(ConnectionState::Connected);

        conn.close().await;
        conn.close().await;

        assert!(matches!(
            next(&mut rx).await,
            Seen::Disconnect(DisconnectReason::LocalShutdown)
        ));
        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    /// Signals entry into `on_frame`, then never returns.
    struct StalledHandler {
        tx: mpsc::UnboundedSender<Seen>,
    }

    #[async_trait]
    impl FrameHandler for StalledHandler {
        async fn on_frame(&self, frame: Frame) {
            let _ = self.tx.send(Seen::Frame(frame));
            std::future::pending::<()>().await;
        }

        async fn on_disconnect(&self, reason: DisconnectReason) {
            let _ = self.tx.send(Seen::Disconnect(reason));
        }
    }

    #[tokio::test]
    async fn close_cancels_a_stalled_handler_and_still_disconnects() {
        let (client, mut peer) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = Connection::from_stream(
            client,
            Arc::new(StalledHandler { tx }),
            state_cell(),
            ConnectionOptions {
                shutdown_timeout: Duration::from_secs(5),
                ..ConnectionOptions::default()
            },
        );

        let mut wire = codec::encode(Opcode::Frame, b"stuck").unwrap();
        wire.extend(codec::encode(Opcode::Frame, b"never").unwrap());
        peer.write_all(&wire).await.unwrap();
        assert!(matches!(next(&mut rx).await, Seen::Frame(_)));

        let started = tokio::time::Instant::now();
        conn.close().await;
        assert!(started.elapsed() < Duration::from_secs(5), "close must not wait out the timeout");

        assert!(matches!(
            next(&mut rx).await,
            Seen::Disconnect(DisconnectReason::LocalShutdown)
        ));
        assert!(rx.recv().await.is_none(), "queued frames are not delivered after close");
    }

    #[tokio::test]
    async fn send_after_close_writes_nothing() {
        let (mut conn, mut peer, _rx, _state) = open();
        conn.close().await;

        let err = conn.send(Opcode::Frame, b"late").await.unwrap_err();
        assert!(matches!(err, IpcError::NotConnected));

        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn concurrent_sends_do_not_interleave() {
        let (client, mut peer) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::from_stream(
            client,
            Arc::new(RecordingHandler { tx }),
            state_cell(),
            ConnectionOptions::default(),
        ));

        let collector = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            let mut buf = [0u8; 333];
            while frames.len() < 200 {
                let n = peer.read(&mut buf).await.unwrap();
                assert!(n > 0, "stream ended early");
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    frames.push(frame);
                }
            }
            frames
        });

        let seen = Arc::new(StdMutex::new(0usize));
        let mut tasks = Vec::new();
        for writer in [b'a', b'b'] {
            let conn = Arc::clone(&conn);
            let seen = Arc::clone(&seen);
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    conn.send(Opcode::Frame, &[writer; 700]).await.unwrap();
                    *seen.lock().unwrap() += 1;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let frames = collector.await.unwrap();
        assert_eq!(frames.len(), 200);
        for frame in frames {
            assert_eq!(frame.payload.len(), 700);
            let first = frame.payload[0];
            assert!(frame.payload.iter().all(|b| *b == first));
        }
        assert_eq!(*seen.lock().unwrap(), 200);
    }
}
