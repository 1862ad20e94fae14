//! Registry of live client connections.
//!
//! Each attached connection is represented by a [`ClientHandle`]: a bounded
//! outbound queue plus a close signal shared by the connection's reader and
//! writer. The [`ConnectionRegistry`] is the set of handles that fan-out
//! currently delivers to.

use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Identifier of an attached client.
pub type ClientId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Why a payload could not be queued for a client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the consumer is too slow.
    #[error("Outbound queue full")]
    Full,
    /// The writer side has gone away.
    #[error("Outbound queue closed")]
    Closed,
}

/// A live client connection as seen by the hub.
pub struct ClientHandle {
    id: ClientId,
    username: String,
    queue: mpsc::Sender<Bytes>,
    closed: watch::Sender<bool>,
    detached: AtomicBool,
}

impl ClientHandle {
    /// Create a handle with an outbound queue of `capacity` payloads.
    ///
    /// Returns the handle and the receiving end of its queue, which belongs
    /// to the connection's writer.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);

        let handle = Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            username: username.into(),
            queue,
            closed,
            detached: AtomicBool::new(false),
        };
        (Arc::new(handle), rx)
    }

    /// Get the client ID.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Get the username this connection attached as.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Queue a payload without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] if the queue is at capacity and
    /// [`EnqueueError::Closed`] if the writer is gone.
    pub fn try_enqueue(&self, payload: Bytes) -> Result<(), EnqueueError> {
        self.queue.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Number of payloads waiting to be written.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    /// Signal the connection's reader and writer to stop.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Check if the connection has been told to stop.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Watch for the close signal.
    #[must_use]
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Claim the detach transition. Returns `true` for the first caller only.
    pub(crate) fn begin_detach(&self) -> bool {
        !self.detached.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The set of attached clients.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    handles: DashMap<ClientId, Arc<ClientHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle to the active set.
    pub fn register(&self, handle: Arc<ClientHandle>) {
        debug!(client = handle.id(), username = %handle.username(), "Registered client");
        self.handles.insert(handle.id(), handle);
    }

    /// Remove a handle. Removing an absent handle is a no-op.
    pub fn unregister(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        let removed = self.handles.remove(&id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!(client = id, "Unregistered client");
        }
        removed
    }

    /// Snapshot of the active handles, safe to iterate while the registry
    /// keeps changing.
    #[must_use]
    pub fn active_handles(&self) -> Vec<Arc<ClientHandle>> {
        self.handles.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Check if a client is registered.
    #[must_use]
    pub fn contains(&self, id: ClientId) -> bool {
        self.handles.contains_key(&id)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if no clients are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
