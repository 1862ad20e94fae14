//! Fan-out of outbound payloads to every attached client.
//!
//! All writes onto client queues happen on one dispatch task, so each queue
//! has a single producer and per-client order matches the order in which
//! [`BroadcastHub::broadcast`] and [`BroadcastHub::send_to`] were called.
//! Enqueueing never waits: a client whose queue is full is evicted.
//!
//! The hub's own work queue is bounded as well. When producers outrun the
//! dispatch task, new broadcasts are dropped and counted instead of
//! buffering without limit.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::registry::{ClientHandle, ConnectionRegistry, EnqueueError};

/// Work items buffered ahead of the dispatch task.
pub const DEFAULT_DISPATCH_CAPACITY: usize = 65_536;

/// Work item for the dispatch task.
enum Dispatch {
    Broadcast(Bytes),
    Unicast {
        target: Arc<ClientHandle>,
        payload: Bytes,
    },
    Flush(oneshot::Sender<()>),
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Clients the payload was queued for.
    pub delivered: usize,
    /// Clients dropped because their queue was full or closed.
    pub evicted: usize,
}

/// Cumulative hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Payloads dispatched (broadcast or unicast).
    pub dispatched: u64,
    /// Individual client deliveries.
    pub delivered: u64,
    /// Clients evicted.
    pub evicted: u64,
    /// Payloads dropped because the dispatch queue was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
    dropped: AtomicU64,
}

struct HubInner {
    registry: Arc<ConnectionRegistry>,
    counters: Counters,
}

impl HubInner {
    fn fan_out(&self, payload: &Bytes) -> Delivery {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let mut delivery = Delivery::default();
        for handle in self.registry.active_handles() {
            if self.offer(&handle, payload.clone()) {
                delivery.delivered += 1;
            } else {
                delivery.evicted += 1;
            }
        }

        trace!(
            delivered = delivery.delivered,
            evicted = delivery.evicted,
            bytes = payload.len(),
            "Broadcast"
        );
        delivery
    }

    fn unicast(&self, target: &Arc<ClientHandle>, payload: Bytes) -> bool {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.offer(target, payload)
    }

    /// Queue a payload for one client, evicting it if it cannot keep up.
    fn offer(&self, handle: &Arc<ClientHandle>, payload: Bytes) -> bool {
        match handle.try_enqueue(payload) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(EnqueueError::Full) => {
                warn!(
                    client = handle.id(),
                    username = %handle.username(),
                    "Outbound queue full, evicting client"
                );
                self.evict(handle);
                false
            }
            Err(EnqueueError::Closed) => {
                debug!(client = handle.id(), "Outbound queue closed, dropping client");
                self.evict(handle);
                false
            }
        }
    }

    fn evict(&self, handle: &ClientHandle) {
        handle.close();
        self.registry.unregister(handle.id());
        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Broadcasts payloads to all registered clients.
///
/// Cloning the hub is cheap; every clone feeds the same dispatch task. The
/// task stops once the last clone is dropped.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
    dispatch: mpsc::Sender<Dispatch>,
}

impl BroadcastHub {
    /// Create a hub over `registry` and spawn its dispatch task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_capacity(registry, DEFAULT_DISPATCH_CAPACITY)
    }

    /// Like [`BroadcastHub::spawn`], buffering at most `capacity` work items
    /// ahead of the dispatch task.
    #[must_use]
    pub fn with_capacity(registry: Arc<ConnectionRegistry>, capacity: usize) -> Self {
        let inner = Arc::new(HubInner {
            registry,
            counters: Counters::default(),
        });
        let (dispatch, rx) = mpsc::channel(capacity.max(1));

        tokio::spawn(run_dispatch(Arc::clone(&inner), rx));

        Self { inner, dispatch }
    }

    /// Queue a payload for every registered client.
    ///
    /// Returns immediately; delivery happens on the dispatch task.
    pub fn broadcast(&self, payload: impl Into<Bytes>) {
        self.submit(Dispatch::Broadcast(payload.into()));
    }

    /// Queue a payload for a single client, in order with broadcasts.
    pub fn send_to(&self, target: &Arc<ClientHandle>, payload: impl Into<Bytes>) {
        self.submit(Dispatch::Unicast {
            target: Arc::clone(target),
            payload: payload.into(),
        });
    }

    fn submit(&self, item: Dispatch) {
        match self.dispatch.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dispatch queue full, dropping payload");
            }
            Err(TrySendError::Closed(_)) => warn!("Dispatch task stopped, dropping payload"),
        }
    }

    /// Wait until everything queued before this call has been dispatched.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.dispatch.send(Dispatch::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Deliver a payload to every registered client right now, bypassing
    /// the dispatch task. Only the dispatch task and tests may call this.
    pub(crate) fn fan_out(&self, payload: &Bytes) -> Delivery {
        self.inner.fan_out(payload)
    }

    /// The registry this hub delivers to.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    /// Cumulative counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let counters = &self.inner.counters;
        HubStats {
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_dispatch(inner: Arc<HubInner>, mut rx: mpsc::Receiver<Dispatch>) {
    while let Some(item) = rx.recv().await {
        match item {
            Dispatch::Broadcast(payload) => {
                inner.fan_out(&payload);
            }
            Dispatch::Unicast { target, payload } => {
                inner.unicast(&target, payload);
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Dispatch task stopped");
}
