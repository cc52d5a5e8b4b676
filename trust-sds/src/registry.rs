//! Bookkeeping of open proxy streams, keyed by node id.

use crate::secret::SecretItem;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Default number of pushes that may be queued for one session.
pub const DEFAULT_PUSH_QUEUE_CAPACITY: usize = 16;

/// Result of [`SessionRegistry::notify`].
///
/// None of the outcomes is an error: rotations routinely race with proxy
/// disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The item was queued for the session's stream.
    Delivered,
    /// No session is open for the node id; nothing happened.
    NoSession,
    /// The revocation sentinel was sent; the session was removed and its stream
    /// ends once already-queued pushes are written.
    Closed,
    /// The session's push queue was full; the session was removed and its stream
    /// ends so the proxy reconnects for fresh material.
    Evicted,
}

/// Receiving side of a registered session.
#[derive(Debug)]
pub struct Registration {
    /// Identifies this registration for [`SessionRegistry::unregister`].
    pub session_id: u64,
    /// Items pushed to this session. Closes when the session is replaced,
    /// revoked or evicted.
    pub mailbox: mpsc::Receiver<SecretItem>,
}

struct Session {
    id: u64,
    tx: mpsc::Sender<SecretItem>,
}

/// Maps each connected node id to the mailbox of its stream.
///
/// At most one session per node id is live: registering again replaces the
/// previous session and closes its mailbox. Clones share the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PUSH_QUEUE_CAPACITY)
    }
}

impl SessionRegistry {
    /// Creates an empty registry whose sessions queue up to `push_queue_capacity`
    /// pushes (at least one).
    pub fn new(push_queue_capacity: usize) -> Self {
        Self {
            sessions: Arc::default(),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: push_queue_capacity.max(1),
        }
    }

    /// Opens a session for `node_id`, replacing any existing one.
    pub fn register(&self, node_id: &str) -> Registration {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mailbox) = mpsc::channel(self.capacity);

        let previous = self
            .lock()
            .insert(node_id.to_string(), Session { id: session_id, tx });

        match previous {
            // Dropping the old sender closes the old mailbox.
            Some(old) => info!(
                "replaced SDS session {} for node {node_id} with session {session_id}",
                old.id
            ),
            None => debug!("registered SDS session {session_id} for node {node_id}"),
        }

        Registration {
            session_id,
            mailbox,
        }
    }

    /// Removes the session for `node_id` if it is still `session_id`.
    ///
    /// Idempotent; a session that was already replaced is left alone. Returns
    /// whether a session was removed.
    pub fn unregister(&self, node_id: &str, session_id: u64) -> bool {
        let mut sessions = self.lock();
        match sessions.get(node_id) {
            Some(s) if s.id == session_id => {
                sessions.remove(node_id);
                debug!("unregistered SDS session {session_id} for node {node_id}");
                true
            }
            _ => false,
        }
    }

    /// Pushes `item` to the session of `node_id` without waiting.
    ///
    /// `None`, or an item for which [`SecretItem::is_empty`] holds, closes the
    /// session instead.
    pub fn notify(&self, node_id: &str, item: Option<SecretItem>) -> NotifyOutcome {
        let mut sessions = self.lock();

        let Some(session) = sessions.get(node_id) else {
            debug!("no SDS session for node {node_id}; push dropped");
            return NotifyOutcome::NoSession;
        };

        let item = match item {
            Some(item) if !item.is_empty() => item,
            _ => {
                let id = session.id;
                sessions.remove(node_id);
                debug!("closing SDS session {id} for node {node_id}");
                return NotifyOutcome::Closed;
            }
        };

        match session.tx.try_send(item) {
            Ok(()) => {
                debug!("pushed secret to SDS session {} for node {node_id}", session.id);
                NotifyOutcome::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let id = session.id;
                sessions.remove(node_id);
                warn!(
                    "push queue full for SDS session {id} of node {node_id}; evicting session"
                );
                NotifyOutcome::Evicted
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The stream already ended and has yet to unregister.
                sessions.remove(node_id);
                debug!("SDS session for node {node_id} already closed; push dropped");
                NotifyOutcome::NoSession
            }
        }
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no session is open.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns `true` if a session is open for `node_id`.
    pub fn contains(&self, node_id: &str) -> bool {
        self.lock().contains_key(node_id)
    }

    /// Node ids with an open session, in no particular order.
    pub fn node_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Closes every session.
    pub fn clear(&self) {
        let mut sessions = self.lock();
        if !sessions.is_empty() {
            debug!("closing {} SDS sessions", sessions.len());
        }
        sessions.clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
