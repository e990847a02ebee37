use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use shared::{
    domain::{ConnectionId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write side of one live connection. Cheap to clone; every clone talks to the
/// same outbox.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Read side of a connection's outbound queue, drained by the transport's
/// writer task.
pub struct Outbox {
    events: mpsc::UnboundedReceiver<ServerEvent>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandle {
    pub fn open() -> (Self, Outbox) {
        let (outbound, events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let id = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        (
            Self {
                id,
                outbound,
                shutdown: Arc::new(shutdown),
            },
            Outbox {
                events,
                shutdown: shutdown_rx,
            },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an event for the client. Returns `false` when the connection is
    /// already torn down; callers treat that as a failed delivery, not an error.
    pub fn send(&self, event: ServerEvent) -> bool {
        if self.is_closed() || self.outbound.send(event).is_err() {
            debug!(connection = %self.id, "dropping event for closed connection");
            return false;
        }
        true
    }

    /// Forcibly tears the connection down. Queued events are discarded.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Outbox {
    /// Next event to write, or `None` once the connection was closed or every
    /// handle is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<ServerEvent> {
        let forced = tokio::select! {
            biased;
            closed = self.shutdown.wait_for(|closed| *closed) => closed.is_ok(),
            event = self.events.recv() => return event,
        };
        if forced {
            return None;
        }
        // Every handle dropped without a forced close: drain what is left.
        self.events.recv().await
    }
}

#[derive(Clone)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub connection: ConnectionHandle,
}

#[derive(Default)]
struct Indices {
    by_connection: HashMap<ConnectionId, Session>,
    by_username: HashMap<String, ConnectionId>,
}

/// Authoritative map of who is online.
///
/// Both indices sit behind one lock, so every observer sees them agree. The
/// lock is only held for map reads and writes, never across store calls or
/// socket I/O.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Indices>>,
}

impl SessionRegistry {
    fn indices(&self) -> MutexGuard<'_, Indices> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a session. A live session for the same username on another
    /// connection is closed and removed first, under the same lock, and
    /// returned to the caller.
    pub fn register(&self, session: Session) -> Option<Session> {
        let connection_id = session.connection.id();
        let mut indices = self.indices();

        let mut superseded = None;
        if let Some(&previous_id) = indices.by_username.get(&session.username) {
            if previous_id != connection_id {
                if let Some(previous) = indices.by_connection.remove(&previous_id) {
                    previous.connection.close();
                    info!(
                        username = %session.username,
                        previous = %previous_id,
                        current = %connection_id,
                        "closing superseded session"
                    );
                    superseded = Some(previous);
                }
            }
        }

        if let Some(replaced) = indices.by_connection.remove(&connection_id) {
            if replaced.username != session.username {
                indices.by_username.remove(&replaced.username);
            }
        }
        indices
            .by_username
            .insert(session.username.clone(), connection_id);
        indices.by_connection.insert(connection_id, session);
        superseded
    }

    pub fn lookup_by_connection(&self, connection_id: ConnectionId) -> Option<Session> {
        self.indices().by_connection.get(&connection_id).cloned()
    }

    pub fn lookup_by_username(&self, username: &str) -> Option<ConnectionHandle> {
        self.session_for_username(username)
            .map(|session| session.connection)
    }

    pub fn session_for_username(&self, username: &str) -> Option<Session> {
        let indices = self.indices();
        indices
            .by_username
            .get(username)
            .and_then(|id| indices.by_connection.get(id))
            .cloned()
    }

    /// Snapshot of the live sessions belonging to any of `user_ids`.
    pub fn sessions_for_users(&self, user_ids: &[UserId]) -> Vec<Session> {
        self.indices()
            .by_connection
            .values()
            .filter(|session| user_ids.contains(&session.user_id))
            .cloned()
            .collect()
    }

    /// Idempotent. The username index is only cleared if it still points at
    /// this connection, so a superseded connection cannot evict its successor.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<Session> {
        let mut indices = self.indices();
        let removed = indices.by_connection.remove(&connection_id)?;
        if indices.by_username.get(&removed.username) == Some(&connection_id) {
            indices.by_username.remove(&removed.username);
        }
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.indices().by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
