//! Live mapping from logical users to their open connections.
//!
//! A user may be connected from any number of devices. A connection belongs
//! to at most one user at a time, and a user whose last connection goes away
//! has no entry at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use sketchmate_shared::protocol::ServerEvent;
use sketchmate_shared::UserId;

/// Sender half of a connection's outbound queue.
pub type ConnectionSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Writable handle to one open connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: ConnectionSender,
}

impl ConnectionHandle {
    pub fn new(sender: ConnectionSender) -> Self {
        Self {
            id: ConnectionId::next(),
            sender,
        }
    }

    /// Handle plus the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event. Returns false when the connection's writer is gone.
    pub fn emit(&self, event: ServerEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Default)]
struct Sessions {
    by_user: HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    owners: HashMap<ConnectionId, UserId>,
}

impl Sessions {
    fn remove(&mut self, conn: ConnectionId) -> Option<UserId> {
        let user_id = self.owners.remove(&conn)?;
        let now_empty = match self.by_user.get_mut(&user_id) {
            Some(connections) => {
                connections.remove(&conn);
                connections.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_user.remove(&user_id);
        }
        Some(user_id)
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Sessions>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection to a user. A connection that was logged in as
    /// someone else is moved.
    pub async fn register(&self, user_id: UserId, connection: ConnectionHandle) {
        let mut sessions = self.inner.write().await;
        let conn_id = connection.id();

        if let Some(previous) = sessions.remove(conn_id) {
            if previous != user_id {
                debug!(connection = %conn_id, from = %previous, to = %user_id, "Connection switched user");
            }
        }

        sessions
            .by_user
            .entry(user_id.clone())
            .or_default()
            .insert(conn_id, connection);
        sessions.owners.insert(conn_id, user_id.clone());

        let devices = sessions.by_user.get(&user_id).map_or(0, |c| c.len());
        info!(user = %user_id, connection = %conn_id, devices, "Session registered");
    }

    /// Detach a connection from whichever user owns it. Returns that user, or
    /// `None` for a connection that never logged in.
    pub async fn deregister(&self, conn: ConnectionId) -> Option<UserId> {
        let removed = self.inner.write().await.remove(conn);
        if let Some(user_id) = &removed {
            info!(user = %user_id, connection = %conn, "Session deregistered");
        }
        removed
    }

    /// Connections of `user_id` whose writer is still running. A handle whose
    /// writer has exited stays registered until its socket task deregisters
    /// it, but is never reported here.
    pub async fn live_connections(&self, user_id: &UserId) -> Vec<ConnectionHandle> {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map(|c| c.values().filter(|h| !h.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn online_users(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(handles: &[ConnectionHandle]) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = handles.iter().map(|h| h.id()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn multiple_devices_per_user() {
        let registry = SessionRegistry::new();
        let user = UserId::from("alice");
        let (phone, _rx1) = ConnectionHandle::channel();
        let (tablet, _rx2) = ConnectionHandle::channel();
        let (laptop, _rx3) = ConnectionHandle::channel();

        for h in [&phone, &tablet, &laptop] {
            registry.register(user.clone(), h.clone()).await;
        }
        assert_eq!(registry.live_connections(&user).await.len(), 3);

        assert_eq!(registry.deregister(tablet.id()).await, Some(user.clone()));
        let mut expected = vec![phone.id(), laptop.id()];
        expected.sort();
        assert_eq!(ids(&registry.live_connections(&user).await), expected);

        registry.deregister(phone.id()).await;
        registry.deregister(laptop.id()).await;
        assert!(registry.live_connections(&user).await.is_empty());
        assert_eq!(registry.online_users().await, 0);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn deregister_unknown_connection_is_noop() {
        let registry = SessionRegistry::new();
        let (anon, _rx) = ConnectionHandle::channel();
        assert_eq!(registry.deregister(anon.id()).await, None);
        assert_eq!(registry.online_users().await, 0);
    }

    #[tokio::test]
    async fn relogin_moves_connection() {
        let registry = SessionRegistry::new();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let (conn, _rx) = ConnectionHandle::channel();

        registry.register(alice.clone(), conn.clone()).await;
        registry.register(bob.clone(), conn.clone()).await;

        assert!(registry.live_connections(&alice).await.is_empty());
        assert_eq!(registry.live_connections(&bob).await.len(), 1);
        assert_eq!(ids(&registry.live_connections(&bob).await), vec![conn.id()]);
        assert_eq!(registry.online_users().await, 1);
    }

    #[tokio::test]
    async fn duplicate_login_is_idempotent() {
        let registry = SessionRegistry::new();
        let alice = UserId::from("alice");
        let (conn, _rx) = ConnectionHandle::channel();

        registry.register(alice.clone(), conn.clone()).await;
        registry.register(alice.clone(), conn.clone()).await;
        assert_eq!(registry.live_connections(&alice).await.len(), 1);
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn emit_reports_closed_connection() {
        let (conn, rx) = ConnectionHandle::channel();
        assert!(conn.emit(ServerEvent::failure("match", "x")));
        drop(rx);
        assert!(conn.is_closed());
        assert!(!conn.emit(ServerEvent::failure("match", "x")));
    }

    #[tokio::test]
    async fn closed_connection_is_not_live() {
        let registry = SessionRegistry::new();
        let alice = UserId::from("alice");
        let (gone, gone_rx) = ConnectionHandle::channel();
        let (alive, _alive_rx) = ConnectionHandle::channel();
        registry.register(alice.clone(), gone.clone()).await;
        registry.register(alice.clone(), alive.clone()).await;

        drop(gone_rx);
        assert_eq!(ids(&registry.live_connections(&alice).await), vec![alive.id()]);
        assert_eq!(registry.connection_count().await, 2);
    }
}
