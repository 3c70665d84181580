//! Async client for the rich-presence IPC protocol.
//!
//! [`PresenceClient`] owns the application identity, the subscription set and
//! the last presence sent. [`connect`](PresenceClient::connect) runs discovery
//! over the candidate sockets, handshakes, replays subscriptions and restores
//! presence. Events arrive on the bounded channel returned from
//! [`PresenceClient::new`].
//!
//! # Example
//!
//! ```rust,no_run
//! use presence_ipc::{IpcConfig, PresenceClient, PresenceEvent};
//! use serde_json::json;
//!
//! # async fn run() -> presence_ipc::Result<()> {
//! let (client, mut events) = PresenceClient::new(IpcConfig::new("123456789012345678"));
//! client.connect().await?;
//! client.set_presence(&json!({"state": "In a match", "details": "2 - 1"})).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         PresenceEvent::ActivityJoin { secret } => { /* … */ }
//!         PresenceEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::connection::{
    state_cell, Connection, ConnectionOptions, ConnectionState, FrameHandler, StateCell,
    DEFAULT_SHUTDOWN_TIMEOUT,
};
use crate::discovery::{self, AttemptFailure, AttemptLogging, SocketEndpoint, MAX_CANDIDATES};
use crate::error::{IpcError, Result};
use crate::event::PresenceEvent;
use crate::handshake::{self, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::protocol::{Command, EventKind, JoinReply, PartialUser};
use crate::router::{self, Router};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`PresenceClient`].
///
/// The only required field is `app_id`; all others have defaults.
///
/// # Example
///
/// ```
/// use presence_ipc::client::IpcConfig;
/// use std::time::Duration;
///
/// let config = IpcConfig::new("123456789012345678")
///     .with_label("my-game")
///     .with_handshake_timeout(Duration::from_millis(500));
/// assert_eq!(config.app_id, "123456789012345678");
/// assert_eq!(config.candidate_count, 10);
/// ```
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Application ID sent in the handshake.
    pub app_id: String,
    /// Process ID reported with presence updates. Defaults to this process.
    pub pid: u32,
    /// Label attached to every log line. Defaults to `presence-ipc.<pid>`.
    pub label: String,
    /// Directory holding the peer's sockets.
    /// Defaults to `$XDG_RUNTIME_DIR`, else the platform temporary directory.
    pub ipc_dir: PathBuf,
    /// How many candidate sockets discovery tries. Defaults to **10**;
    /// clamped to `1..=10`.
    pub candidate_count: u8,
    /// How long to wait for an early handshake rejection before assuming
    /// success. Defaults to **2 seconds**.
    pub handshake_timeout: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer falls behind, the read loop waits for space rather
    /// than dropping events. One extra slot is held for each connection's
    /// final `Disconnected` event, so it is delivered even when the channel
    /// is full. Events still waiting for space when [`PresenceClient::disconnect`]
    /// is called are discarded. Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// How long closing a connection waits for its read loop before aborting
    /// it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Whether each failed discovery attempt is logged. Defaults to silent.
    pub attempt_logging: AttemptLogging,
    /// Event kinds subscribed to after every handshake.
    /// Defaults to join, spectate and join-request.
    pub subscriptions: BTreeSet<EventKind>,
}

impl IpcConfig {
    /// Create a new configuration with the given application ID and default values.
    pub fn new(app_id: impl Into<String>) -> Self {
        let pid = std::process::id();
        Self {
            app_id: app_id.into(),
            pid,
            label: format!("presence-ipc.{pid}"),
            ipc_dir: discovery::default_ipc_dir(),
            candidate_count: MAX_CANDIDATES,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            attempt_logging: AttemptLogging::Silent,
            subscriptions: EventKind::DEFAULT_SUBSCRIPTIONS.into_iter().collect(),
        }
    }

    /// Set the process ID reported with presence updates.
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Set the log label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the directory searched for the peer's sockets.
    #[must_use]
    pub fn with_ipc_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ipc_dir = dir.into();
        self
    }

    /// Set how many candidate sockets to try. Clamped to `1..=10`.
    #[must_use]
    pub fn with_candidate_count(mut self, count: u8) -> Self {
        self.candidate_count = count.clamp(1, MAX_CANDIDATES);
        self
    }

    /// Set the handshake rejection window.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the read loop shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set whether failed discovery attempts are logged.
    #[must_use]
    pub fn with_attempt_logging(mut self, logging: AttemptLogging) -> Self {
        self.attempt_logging = logging;
        self
    }

    /// Replace the initial subscription set. Kinds that cannot be
    /// subscribed to (`Ready`, `Error`) are skipped.
    #[must_use]
    pub fn with_subscriptions(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.subscriptions = kinds
            .into_iter()
            .filter(|kind| kind.is_subscribable())
            .collect();
        self
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            label: self.label.clone(),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// A connection that passed the handshake.
struct Session {
    connection: Connection,
    endpoint: SocketEndpoint,
}

/// Async client handle for the rich-presence IPC protocol.
///
/// All methods take `&self`; share the client with `Arc` to call it from
/// several tasks.
pub struct PresenceClient {
    config: IpcConfig,
    event_tx: mpsc::Sender<PresenceEvent>,
    state: StateCell,
    session: Mutex<Option<Session>>,
    subscriptions: StdMutex<BTreeSet<EventKind>>,
    presence: watch::Sender<Option<Value>>,
}

impl PresenceClient {
    /// Create a disconnected client and its event receiver.
    ///
    /// The receiver yields [`PresenceEvent`]s from every connection this
    /// client opens, in wire order. Each connection ends with exactly one
    /// `Disconnected` event.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn new(config: IpcConfig) -> (Self, mpsc::Receiver<PresenceEvent>) {
        let capacity = config.event_channel_capacity.max(1).saturating_add(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let subscriptions = config.subscriptions.clone();
        let client = Self {
            config,
            event_tx,
            state: state_cell(),
            session: Mutex::new(None),
            subscriptions: StdMutex::new(subscriptions),
            presence: watch::Sender::new(None),
        };
        (client, event_rx)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Find the peer and open a session.
    ///
    /// Tries `discord-ipc-0` upward and keeps the first socket that accepts
    /// the handshake. Then re-sends every subscription in the subscription
    /// set, in order, followed by the current presence if one is set. Does
    /// nothing if already connected.
    ///
    /// # Errors
    ///
    /// - [`IpcError::DiscoveryExhausted`] if no candidate accepted; the client
    ///   stays `Disconnected` and may be connected again later.
    /// - Any send error from replaying subscriptions or presence; the new
    ///   connection is closed again.
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;

        if let Some(current) = session.as_mut() {
            if self.state() == ConnectionState::Connected {
                debug!(label = %self.config.label, endpoint = %current.endpoint, "already connected");
                return Ok(());
            }
            current.connection.close().await;
        }
        *session = None;

        let endpoints = discovery::candidates(&self.config.ipc_dir, self.config.candidate_count);
        let found = match discovery::discover(endpoints, self.config.attempt_logging, |endpoint| async move {
            self.open_session(endpoint)
                .await
                .map_err(AttemptFailure::from)
        })
        .await
        {
            Ok(found) => found,
            Err(e) => {
                info!(label = %self.config.label, dir = %self.config.ipc_dir.display(), "no peer found");
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let mut current = found.value;
        debug!(label = %self.config.label, endpoint = %current.endpoint, "connected");

        if let Err(e) = self.restore(&current.connection).await {
            debug!(label = %self.config.label, "restoring session state failed: {e}");
            current.connection.close().await;
            return Err(e);
        }

        *session = Some(current);
        Ok(())
    }

    /// Close the session.
    ///
    /// Clears presence on the peer first (best effort). Waits for the read
    /// loop to exit, so the `Disconnected` event is queued before this
    /// returns. A no-op when there is no session.
    pub async fn disconnect(&self) {
        let Some(mut current) = self.session.lock().await.take() else {
            return;
        };

        if current.connection.state() == ConnectionState::Connected
            && self.presence.borrow().is_some()
        {
            self.presence.send_replace(None);
            let clear = Command::set_activity(self.config.pid, Value::Null);
            if let Err(e) = router::send_command(&current.connection, &clear).await {
                debug!(label = %self.config.label, "clearing presence on disconnect failed: {e}");
            }
        }

        debug!(label = %self.config.label, endpoint = %current.endpoint, "disconnecting");
        current.connection.close().await;
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Send an arbitrary command.
    ///
    /// # Errors
    ///
    /// - [`IpcError::NotConnected`] unless the client is `Connected`; nothing is written.
    /// - [`IpcError::SendFailed`] if the socket write fails.
    pub async fn send(&self, command: Command) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(IpcError::NotConnected);
        }
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(current) => router::send_command(&current.connection, &command).await,
            None => Err(IpcError::NotConnected),
        }
    }

    /// Ask the peer to push events of `kind`.
    ///
    /// The kind is recorded in the subscription set and re-sent after every
    /// reconnect. While disconnected only the set is updated.
    ///
    /// # Errors
    ///
    /// - [`IpcError::NotSubscribable`] for `Ready` and `Error`, which are
    ///   always delivered.
    /// - A send error if connected and the `SUBSCRIBE` write fails.
    pub async fn subscribe(&self, kind: EventKind) -> Result<()> {
        if !kind.is_subscribable() {
            return Err(IpcError::NotSubscribable(kind));
        }
        self.lock_subscriptions().insert(kind);
        self.send_if_connected(Command::subscribe(kind)).await
    }

    /// Stop pushes of `kind` and remove it from the subscription set.
    ///
    /// # Errors
    ///
    /// - [`IpcError::NotSubscribable`] for `Ready` and `Error`.
    /// - A send error if connected and the `UNSUBSCRIBE` write fails.
    pub async fn unsubscribe(&self, kind: EventKind) -> Result<()> {
        if !kind.is_subscribable() {
            return Err(IpcError::NotSubscribable(kind));
        }
        self.lock_subscriptions().remove(&kind);
        self.send_if_connected(Command::unsubscribe(kind)).await
    }

    /// Publish `activity` as this process's rich presence.
    ///
    /// The value is kept and re-sent after every reconnect. While
    /// disconnected only the stored value is updated.
    ///
    /// # Errors
    ///
    /// - [`IpcError::Serialization`] if `activity` does not serialize to JSON.
    /// - A send error if connected and the `SET_ACTIVITY` write fails.
    pub async fn set_presence<A: Serialize + ?Sized>(&self, activity: &A) -> Result<()> {
        let activity = serde_json::to_value(activity)?;
        self.presence.send_replace(Some(activity.clone()));
        self.send_if_connected(Command::set_activity(self.config.pid, activity))
            .await
    }

    /// Remove this process's rich presence.
    ///
    /// # Errors
    ///
    /// Returns a send error if connected and the `SET_ACTIVITY` write fails.
    pub async fn clear_presence(&self) -> Result<()> {
        self.presence.send_replace(None);
        self.send_if_connected(Command::set_activity(self.config.pid, Value::Null))
            .await
    }

    /// Answer an `ACTIVITY_JOIN_REQUEST` from `user`.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn reply(&self, user: &PartialUser, reply: JoinReply) -> Result<()> {
        self.send(Command::join_reply(user.id.clone(), reply)).await
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns `true` if the client is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Latest-value stream of the connection state, continuous across reconnects.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Latest-value stream of the presence this client publishes.
    pub fn watch_presence(&self) -> watch::Receiver<Option<Value>> {
        self.presence.subscribe()
    }

    /// The subscription set, in replay order.
    pub fn subscriptions(&self) -> Vec<EventKind> {
        self.lock_subscriptions().iter().copied().collect()
    }

    /// The socket of the current session, if any.
    pub async fn endpoint(&self) -> Option<SocketEndpoint> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|current| current.endpoint.clone())
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// One discovery attempt: open the socket and handshake.
    async fn open_session(&self, endpoint: SocketEndpoint) -> Result<Session> {
        let (router, outcome_rx) = Router::new(self.event_tx.clone(), self.config.label.clone());
        router.reserve_disconnect_slot().await;
        let router = Arc::new(router);
        let handler: Arc<dyn FrameHandler> = Arc::clone(&router) as Arc<dyn FrameHandler>;

        let mut connection = Connection::connect(
            endpoint.path(),
            handler,
            Arc::clone(&self.state),
            self.config.connection_options(),
        )
        .await?;

        if let Err(e) = handshake::perform(
            &connection,
            &self.config.app_id,
            router.handshake_signal(),
            outcome_rx,
            self.config.handshake_timeout,
        )
        .await
        {
            connection.close().await;
            return Err(e);
        }

        Ok(Session {
            connection,
            endpoint,
        })
    }

    /// Replay subscriptions, then presence, on a fresh connection.
    async fn restore(&self, connection: &Connection) -> Result<()> {
        let kinds = self.subscriptions();
        router::replay_subscriptions(connection, kinds).await?;

        let activity = self.presence.borrow().clone();
        if let Some(activity) = activity {
            router::send_command(connection, &Command::set_activity(self.config.pid, activity))
                .await?;
        }
        Ok(())
    }

    async fn send_if_connected(&self, command: Command) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            debug!(label = %self.config.label, cmd = ?command.cmd, "not connected; deferring until connect");
            return Ok(());
        }
        self.send(command).await
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, BTreeSet<EventKind>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PresenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceClient")
            .field("label", &self.config.label)
            .field("state", &self.state())
            .field("subscriptions", &self.subscriptions())
            .finish()
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
    use serde_json::json;

    fn config(dir: &std::path::Path) -> IpcConfig {
        IpcConfig::new("1234").with_ipc_dir(dir)
    }

    #[test]
    fn config_defaults() {
        let config = IpcConfig::new("app");
        assert_eq!(config.pid, std::process::id());
        assert_eq!(config.label, format!("presence-ipc.{}", std::process::id()));
        assert_eq!(config.candidate_count, 10);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.attempt_logging, AttemptLogging::Silent);
        assert_eq!(
            config.subscriptions.into_iter().collect::<Vec<_>>(),
            vec![
                EventKind::ActivityJoin,
                EventKind::ActivitySpectate,
                EventKind::ActivityJoinRequest,
            ]
        );
    }

    #[test]
    fn config_clamps() {
        let config = IpcConfig::new("app")
            .with_candidate_count(0)
            .with_event_channel_capacity(0);
        assert_eq!(config.candidate_count, 1);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(IpcConfig::new("app").with_candidate_count(99).candidate_count, 10);
    }

    #[tokio::test]
    async fn commands_fail_while_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _events) = PresenceClient::new(config(dir.path()));

        assert_eq!(client.state(), ConnectionState::Disconnected);
        let err = client
            .send(Command::subscribe(EventKind::ActivityJoin))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::NotConnected));
        assert!(err.is_send_failure());

        let user = PartialUser {
            id: "1".into(),
            username: "crab".into(),
            discriminator: None,
            avatar: None,
        };
        assert!(matches!(
            client.reply(&user, JoinReply::Yes).await,
            Err(IpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn state_only_updates_are_kept_while_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _events) = PresenceClient::new(config(dir.path()));
        let presence = client.watch_presence();

        client.set_presence(&json!({"state": "idle"})).await.unwrap();
        assert_eq!(*presence.borrow(), Some(json!({"state": "idle"})));

        client.unsubscribe(EventKind::ActivitySpectate).await.unwrap();
        assert_eq!(
            client.subscriptions(),
            vec![EventKind::ActivityJoin, EventKind::ActivityJoinRequest]
        );
        client.subscribe(EventKind::ActivitySpectate).await.unwrap();
        assert_eq!(client.subscriptions().len(), 3);

        client.clear_presence().await.unwrap();
        assert_eq!(*presence.borrow(), None);
    }

    #[tokio::test]
    async fn always_delivered_kinds_cannot_be_subscribed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).with_subscriptions([EventKind::Ready, EventKind::ActivityJoin]);
        let (client, _events) = PresenceClient::new(config);
        assert_eq!(client.subscriptions(), vec![EventKind::ActivityJoin]);

        for kind in [EventKind::Ready, EventKind::Error] {
            assert!(matches!(
                client.subscribe(kind).await,
                Err(IpcError::NotSubscribable(k)) if k == kind
            ));
            assert!(matches!(
                client.unsubscribe(kind).await,
                Err(IpcError::NotSubscribable(_))
            ));
        }
        assert_eq!(client.subscriptions(), vec![EventKind::ActivityJoin]);
    }

    #[tokio::test]
    async fn connect_without_peer_exhausts_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _events) = PresenceClient::new(config(dir.path()));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, IpcError::DiscoveryExhausted { attempts: 10 }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.endpoint().await.is_none());

        // Disconnecting an idle client is a no-op.
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
