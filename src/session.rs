//! Shared session state: online users, connection bindings, message queues.
//!
//! One store instance is shared by every connection task. All maps live
//! behind a single mutex so each operation is atomic as a whole; the lock
//! is never held across an await point.
//!
//! A username, once seen, stays in the registry for the process lifetime
//! with its online flag flipped on login/logout. Per-recipient queues are
//! created lazily on first enqueue and hold at most
//! [`MESSAGE_QUEUE_CAPACITY`] messages; a full queue makes the sender wait
//! until the drain side consumes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Maximum number of buffered messages per recipient.
pub const MESSAGE_QUEUE_CAPACITY: usize = 100;

/// Identifier for one accepted connection, allocated by the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// A message buffered for a recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub from: String,
    pub sent_at: DateTime<Utc>,
    pub text: String,
}

/// Domain-level failures of session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The username is already bound to a live connection.
    UserAlreadyOnline,
    /// The recipient has never logged in.
    RecipientNotFound,
    /// The recipient's queue drain was taken and dropped.
    QueueClosed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::UserAlreadyOnline => write!(f, "User already online"),
            SessionError::RecipientNotFound => write!(f, "Recipient doesn't exist"),
            SessionError::QueueClosed => write!(f, "Recipient queue is closed"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Bounded per-recipient buffer. The sender half is the enqueue side; the
/// receiver half is handed out once to whatever delivers on reconnect.
struct UserQueue {
    tx: mpsc::Sender<QueuedMessage>,
    rx: Option<mpsc::Receiver<QueuedMessage>>,
}

impl UserQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        Self { tx, rx: Some(rx) }
    }
}

struct Inner {
    /// Username -> online flag. Keys are never removed, only flipped.
    logged_users: HashMap<String, bool>,
    /// Live connection -> username, created on login, removed on logout.
    connections: HashMap<ConnId, String>,
    /// Recipient -> pending message queue, created on first enqueue.
    queues: HashMap<String, UserQueue>,
}

/// Thread-safe registry of sessions and pending messages.
pub struct SessionStore {
    inner: Mutex<Inner>,
}

impl SessionStore {
    /// Create a new, empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                logged_users: HashMap::new(),
                connections: HashMap::new(),
                queues: HashMap::new(),
            }),
        })
    }

    /// Mark `username` online and bind it to `conn`.
    ///
    /// Exactly one caller wins when two connections race on the same
    /// username; the loser sees [`SessionError::UserAlreadyOnline`] and the
    /// store is left untouched. A connection that is already bound releases
    /// its previous username first, so no user is left online without a
    /// live connection.
    pub fn login(&self, conn: ConnId, username: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.logged_users.get(username).copied().unwrap_or(false) {
            return Err(SessionError::UserAlreadyOnline);
        }
        if let Some(previous) = inner.connections.remove(&conn) {
            inner.logged_users.insert(previous, false);
        }
        inner.logged_users.insert(username.to_string(), true);
        inner.connections.insert(conn, username.to_string());
        let online = inner.logged_users.values().filter(|&&v| v).count();
        debug!(username, conn = conn.0, online, "User logged in");
        Ok(())
    }

    /// Release the username bound to `conn`, if any.
    ///
    /// The user record stays in the registry with its online flag cleared;
    /// an unbound connection is a no-op.
    pub fn logout(&self, conn: ConnId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(username) = inner.connections.remove(&conn) {
            inner.logged_users.insert(username.clone(), false);
            let online = inner.logged_users.values().filter(|&&v| v).count();
            debug!(username = %username, conn = conn.0, online, "User logged out");
        }
    }

    /// Append a message to `to`'s queue, creating the queue on first use.
    ///
    /// Fails with [`SessionError::RecipientNotFound`] if `to` has never
    /// logged in; no queue is created on that path. When the queue is full
    /// the send waits for the drain side, with the store lock released.
    pub async fn enqueue(
        &self,
        from: &str,
        to: &str,
        sent_at: DateTime<Utc>,
        text: &str,
    ) -> Result<(), SessionError> {
        let tx = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.logged_users.contains_key(to) {
                return Err(SessionError::RecipientNotFound);
            }
            inner
                .queues
                .entry(to.to_string())
                .or_insert_with(UserQueue::new)
                .tx
                .clone()
        };

        let message = QueuedMessage {
            from: from.to_string(),
            sent_at,
            text: text.to_string(),
        };
        tx.send(message)
            .await
            .map_err(|_| SessionError::QueueClosed)?;

        trace!(from, to, "Message enqueued");
        Ok(())
    }

    /// Whether the username has ever logged in.
    pub fn user_exists(&self, username: &str) -> bool {
        self.inner.lock().unwrap().logged_users.contains_key(username)
    }

    /// Whether the username is currently bound to a live connection.
    pub fn user_is_online(&self, username: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .logged_users
            .get(username)
            .copied()
            .unwrap_or(false)
    }

    /// Hand out the drain side of `username`'s queue.
    ///
    /// Returns `None` if no message was ever enqueued for the user or the
    /// drain was already taken. Buffered sends keep working while the
    /// returned receiver is alive.
    pub fn take_queue(&self, username: &str) -> Option<mpsc::Receiver<QueuedMessage>> {
        self.inner
            .lock()
            .unwrap()
            .queues
            .get_mut(username)
            .and_then(|q| q.rx.take())
    }

    /// Number of users currently online.
    pub fn online_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .logged_users
            .values()
            .filter(|&&online| online)
            .count()
    }
}
