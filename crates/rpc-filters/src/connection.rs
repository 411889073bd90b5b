//! Push-mode connection handles and outbound queues.

use dashmap::DashMap;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Handle to a push-mode transport connection.
///
/// Filters store this handle instead of a reference to the connection
/// itself. The transport owns the connection and must call
/// [`FilterEngine::uninstall_by_connection`] when it closes.
///
/// [`FilterEngine::uninstall_by_connection`]: crate::FilterEngine::uninstall_by_connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl ConnectionId {
    /// Get the raw handle value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Reason an outbound message was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The connection's outbound queue is full.
    #[error("outbound queue full")]
    Full,
    /// The connection is closed or unknown.
    #[error("connection closed")]
    Closed,
}

/// Outbound side of the push transport.
///
/// `enqueue` is a best-effort append to the connection's outbound queue. It
/// must never block on network I/O.
pub trait SubscriptionSink: Send + Sync + 'static {
    /// Queue a serialized notification for delivery on `connection`.
    fn enqueue(&self, connection: ConnectionId, payload: String) -> Result<(), EnqueueError>;
}

/// In-memory registry of open connections, each with a bounded outbound
/// queue.
///
/// The transport calls [`Self::open`] when a connection is accepted and
/// drains the returned receiver onto the wire. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    next_id: AtomicU64,
    capacity: usize,
    queues: DashMap<ConnectionId, mpsc::Sender<String>>,
}

impl ConnectionRegistry {
    /// Create a registry whose per-connection queues hold `capacity`
    /// messages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "outbound queue capacity must be non-zero");
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                capacity,
                queues: DashMap::new(),
            }),
        }
    }

    /// Register a new connection, returning its handle and the receiving
    /// end of its outbound queue.
    pub fn open(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let _ = self.inner.queues.insert(id, tx);
        (id, rx)
    }

    /// Forget a connection. Returns `false` if it was not open.
    pub fn close(&self, id: ConnectionId) -> bool {
        self.inner.queues.remove(&id).is_some()
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.inner.queues.len()
    }

    /// True if no connections are open.
    pub fn is_empty(&self) -> bool {
        self.inner.queues.is_empty()
    }
}

impl SubscriptionSink for ConnectionRegistry {
    fn enqueue(&self, connection: ConnectionId, payload: String) -> Result<(), EnqueueError> {
        let tx = self.inner.queues.get(&connection).ok_or(EnqueueError::Closed)?;
        tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_is_bounded_and_non_blocking() {
        let registry = ConnectionRegistry::new(2);
        let (conn, mut rx) = registry.open();

        registry.enqueue(conn, "a".into()).unwrap();
        registry.enqueue(conn, "b".into()).unwrap();
        assert_eq!(registry.enqueue(conn, "c".into()), Err(EnqueueError::Full));

        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_connections_reject() {
        let registry = ConnectionRegistry::new(4);
        let (conn, rx) = registry.open();
        let (other, _other_rx) = registry.open();
        assert_ne!(conn, other);
        assert_eq!(registry.len(), 2);

        drop(rx);
        assert_eq!(registry.enqueue(conn, "x".into()), Err(EnqueueError::Closed));

        assert!(registry.close(other));
        assert!(!registry.close(other));
        assert_eq!(registry.enqueue(other, "x".into()), Err(EnqueueError::Closed));
    }
}
