//! Username → session table shared by every connection task.
//!
//! Lookups clone the [`SessionHandle`] out of the map so no shard lock is ever
//! held across an `.await` on a socket write.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, MutexGuard},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long `close` waits for the writer. A writer it cannot get is released
/// when the last handle drops.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// The shareable half of a session: its name, its serialized writer and the
/// token that stops its read loop. Clones refer to the same connection.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    username: String,
    peer: Option<SocketAddr>,
    writer: Mutex<BoxedWriter>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        username: impl Into<String>,
        peer: Option<SocketAddr>,
        writer: BoxedWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                username: username.into(),
                peer,
                writer: Mutex::new(writer),
                cancel,
            }),
        }
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn same_connection(&self, other: &SessionHandle) -> bool {
        self.inner.id == other.inner.id
    }

    /// Writes `bytes` as one uninterrupted unit. Concurrent senders queue on
    /// the writer lock, so frames from different relays never interleave.
    ///
    /// A peer that stops reading blocks the write until the session is
    /// closed; the write then fails with `ConnectionAborted` and the lock is
    /// released.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let write = async {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(bytes).await?;
            writer.flush().await
        };

        select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session closed",
            )),
            result = write => result,
        }
    }

    /// Holds the writer lock so a caller can register the session and write
    /// its first line before any relayed frame can reach the connection.
    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, BoxedWriter> {
        self.inner.writer.lock().await
    }

    /// Stops the session's read loop and shuts down its write side. Never
    /// waits longer than `CLOSE_TIMEOUT` on a stalled connection.
    pub async fn close(&self) {
        self.inner.cancel.cancel();

        let shutdown = async {
            let mut writer = self.inner.writer.lock().await;
            writer.shutdown().await
        };
        match timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(username = %self.inner.username, ?err, "writer shutdown failed");
            }
            Err(_) => {
                debug!(username = %self.inner.username, "writer still busy, leaving it to drop");
            }
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("username", &self.inner.username)
            .field("peer", &self.inner.peer)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<String, SessionHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the session unless its username is already taken. The check and
    /// the insert happen under the same shard lock.
    pub fn try_register(&self, session: SessionHandle) -> bool {
        match self.sessions.entry(session.username().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn lookup(&self, username: &str) -> Option<SessionHandle> {
        self.sessions.get(username).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, username: &str) -> Option<SessionHandle> {
        self.sessions.remove(username).map(|(_, session)| session)
    }

    /// Removes `session` only if the name still maps to that same connection.
    pub fn remove_if_same(&self, session: &SessionHandle) -> bool {
        self.sessions
            .remove_if(session.username(), |_, current| current.same_connection(session))
            .is_some()
    }

    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
