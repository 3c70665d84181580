//! Locating the peer's socket.
//!
//! The peer listens on one of `<dir>/discord-ipc-0` … `<dir>/discord-ipc-9`.
//! [`discover`] tries each candidate in increasing order and stops at the
//! first one whose attempt succeeds. Failed attempts are the normal case when
//! no peer runs, so they are collected instead of logged; only exhaustion of
//! the whole range is reported.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{IpcError, Result};

/// File name prefix of the peer's sockets. Part of the wire contract.
pub const SOCKET_PREFIX: &str = "discord-ipc-";

/// Number of candidate sockets the peer may listen on.
pub const MAX_CANDIDATES: u8 = 10;

/// Directory the peer's sockets live in when none is configured.
///
/// `$XDG_RUNTIME_DIR` when set, otherwise the platform temporary directory.
pub fn default_ipc_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// One candidate socket: an index in `0..10` and the path derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketEndpoint {
    index: u8,
    path: PathBuf,
}

impl SocketEndpoint {
    pub fn new(dir: &Path, index: u8) -> Self {
        Self {
            index,
            path: dir.join(format!("{SOCKET_PREFIX}{index}")),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// The first `count` endpoints under `dir`, in the order they are tried.
/// `count` is clamped to [`MAX_CANDIDATES`].
pub fn candidates(dir: &Path, count: u8) -> impl Iterator<Item = SocketEndpoint> + '_ {
    (0..count.min(MAX_CANDIDATES)).map(move |index| SocketEndpoint::new(dir, index))
}

/// Whether individual failed attempts produce log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptLogging {
    /// Nothing is logged per attempt.
    #[default]
    Silent,
    /// Each failed attempt is logged at `debug`.
    Debug,
}

/// Why one candidate did not work out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// No socket file at the path.
    NotFound,
    /// A socket file exists but nothing accepted the connection.
    Refused,
    /// The socket accepted but the peer rejected the handshake.
    HandshakeRejected { code: Option<i64>, message: String },
    /// Any other error.
    Other(String),
}

impl From<IpcError> for AttemptFailure {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => Self::NotFound,
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::AddrInUse
                | io::ErrorKind::WouldBlock => Self::Refused,
                _ => Self::Other(e.to_string()),
            },
            IpcError::HandshakeRejected { code, message } => {
                Self::HandshakeRejected { code, message }
            }
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no socket"),
            Self::Refused => f.write_str("connection refused"),
            Self::HandshakeRejected { message, .. } => write!(f, "handshake rejected: {message}"),
            Self::Other(e) => f.write_str(e),
        }
    }
}

/// A candidate that was tried and failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub endpoint: SocketEndpoint,
    pub failure: AttemptFailure,
}

/// A successful discovery.
#[derive(Debug)]
pub struct Discovered<T> {
    /// What the winning attempt produced.
    pub value: T,
    pub endpoint: SocketEndpoint,
    /// Every attempt before the winner, in order.
    pub failed: Vec<FailedAttempt>,
}

/// Try `attempt` on each endpoint in order until one succeeds.
///
/// # Errors
///
/// Returns [`IpcError::DiscoveryExhausted`] with the number of attempts made
/// if every endpoint fails.
pub async fn discover<I, F, Fut, T>(
    endpoints: I,
    logging: AttemptLogging,
    mut attempt: F,
) -> Result<Discovered<T>>
where
    I: IntoIterator<Item = SocketEndpoint>,
    F: FnMut(SocketEndpoint) -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptFailure>>,
{
    let mut failed = Vec::new();

    for endpoint in endpoints {
        match attempt(endpoint.clone()).await {
            Ok(value) => {
                debug!(%endpoint, skipped = failed.len(), "peer found");
                return Ok(Discovered {
                    value,
                    endpoint,
                    failed,
                });
            }
            Err(failure) => {
                if logging == AttemptLogging::Debug {
                    debug!(%endpoint, "candidate failed: {failure}");
                }
                failed.push(FailedAttempt { endpoint, failure });
            }
        }
    }

    Err(IpcError::DiscoveryExhausted {
        attempts: failed.len(),
    })
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
    use std::sync::{Arc, Mutex};

    #[test]
    fn endpoint_paths_follow_convention() {
        let dir = Path::new("/run/user/1000");
        let paths: Vec<_> = candidates(dir, MAX_CANDIDATES)
            .map(|e| e.path().to_path_buf())
            .collect();
        assert_eq!(paths.len(), 10);
        assert_eq!(paths[0], PathBuf::from("/run/user/1000/discord-ipc-0"));
        assert_eq!(paths[9], PathBuf::from("/run/user/1000/discord-ipc-9"));
    }

    #[test]
    fn candidate_count_is_clamped() {
        assert_eq!(candidates(Path::new("/tmp"), 200).count(), 10);
        assert_eq!(candidates(Path::new("/tmp"), 3).count(), 3);
    }

    #[tokio::test]
    async fn first_success_wins_after_ordered_failures() {
        let tried = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&tried);

        let found = discover(
            candidates(Path::new("/tmp"), MAX_CANDIDATES),
            AttemptLogging::Silent,
            move |endpoint| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(endpoint.index());
                    if endpoint.index() == 7 {
                        Ok(endpoint.index())
                    } else {
                        Err(AttemptFailure::NotFound)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(found.value, 7);
        assert_eq!(found.endpoint.index(), 7);
        assert_eq!(found.failed.len(), 7);
        assert_eq!(*tried.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn exhaustion_reports_every_attempt() {
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);

        let err = discover(
            candidates(Path::new("/tmp"), MAX_CANDIDATES),
            AttemptLogging::Debug,
            move |_endpoint| {
                let counter = Arc::clone(&counter);
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<(), _>(AttemptFailure::Refused)
                }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, IpcError::DiscoveryExhausted { attempts: 10 }));
        assert_eq!(*count.lock().unwrap(), 10);
    }

    #[test]
    fn io_errors_classify() {
        let not_found = AttemptFailure::from(IpcError::Io(io::ErrorKind::NotFound.into()));
        assert_eq!(not_found, AttemptFailure::NotFound);

        let refused = AttemptFailure::from(IpcError::Io(io::ErrorKind::ConnectionRefused.into()));
        assert_eq!(refused, AttemptFailure::Refused);

        let rejected = AttemptFailure::from(IpcError::HandshakeRejected {
            code: Some(4000),
            message: "no".into(),
        });
        assert!(matches!(rejected, AttemptFailure::HandshakeRejected { code: Some(4000), .. }));
    }
}
