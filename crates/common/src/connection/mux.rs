//! Rendezvous between dialed and accepted connections.
//!
//! After authentication the dialing side writes an 8-byte tag. The tag is
//! either [`RPC_CHANNEL`], which routes the connection to the RPC server, or
//! a [`ConnectionId`] that some local caller is (or will be) waiting for.
//! Either side may arrive first; the table below holds whichever did.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;

/// Width of every connection tag.
pub const HEADER_LEN: usize = 8;

/// Reserved tag routing to the RPC acceptor.
pub const RPC_CHANNEL: &str = "rpc.....";

const ID_PREFIX: &str = "id";

/// Opaque 8-byte token naming one logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// A fresh random id of the form `id000000`.
    pub fn random() -> Self {
        let n: u32 = rand::rng().random_range(0..1_000_000);
        Self(format!("{}{:06}", ID_PREFIX, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HEADER_LEN || !s.is_ascii() {
            return Err(MuxError::BadTag(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("malformed connection tag {0:?}")]
    BadTag(String),

    #[error("another caller is already waiting for {0}")]
    AlreadyWaiting(ConnectionId),

    #[error("timed out waiting for connection {0}")]
    Timeout(ConnectionId),

    #[error("connection table dropped while waiting for {0}")]
    Abandoned(ConnectionId),
}

enum Cell<C> {
    /// A caller is blocked in `wait`.
    Waiting(oneshot::Sender<C>),
    /// A connection arrived before anyone asked for it.
    Ready(C),
}

/// Table of one-shot rendezvous cells keyed by connection id.
pub struct PendingConnections<C> {
    cells: Mutex<HashMap<ConnectionId, Cell<C>>>,
}

impl<C> Default for PendingConnections<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> PendingConnections<C> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Number of unmatched ids, from either side.
    pub fn pending(&self) -> usize {
        self.cells.lock().len()
    }

    fn register(&self, id: &ConnectionId) -> Result<Result<C, oneshot::Receiver<C>>, MuxError> {
        let mut cells = self.cells.lock();
        match cells.remove(id) {
            Some(Cell::Ready(conn)) => Ok(Ok(conn)),
            Some(waiting @ Cell::Waiting(_)) => {
                cells.insert(id.clone(), waiting);
                Err(MuxError::AlreadyWaiting(id.clone()))
            }
            None => {
                let (tx, rx) = oneshot::channel();
                cells.insert(id.clone(), Cell::Waiting(tx));
                Ok(Err(rx))
            }
        }
    }

    /// Block until the connection tagged `id` arrives, then consume the id.
    ///
    /// There is no deadline: a connection that never arrives blocks forever.
    /// Use [`wait_timeout`](Self::wait_timeout) to bound it.
    pub async fn wait(&self, id: &ConnectionId) -> Result<C, MuxError> {
        match self.register(id)? {
            Ok(conn) => Ok(conn),
            Err(rx) => rx.await.map_err(|_| MuxError::Abandoned(id.clone())),
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, unregistering
    /// the waiter so a late delivery is parked instead of lost.
    pub async fn wait_timeout(&self, id: &ConnectionId, timeout: Duration) -> Result<C, MuxError> {
        let mut rx = match self.register(id)? {
            Ok(conn) => return Ok(conn),
            Err(rx) => rx,
        };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(result) => result.map_err(|_| MuxError::Abandoned(id.clone())),
            Err(_) => {
                let mut cells = self.cells.lock();
                if matches!(cells.get(id), Some(Cell::Waiting(_))) {
                    cells.remove(id);
                }
                drop(cells);
                // A delivery may have raced the deadline.
                rx.close();
                rx.try_recv().map_err(|_| MuxError::Timeout(id.clone()))
            }
        }
    }

    /// Hand `conn` to whoever waits for `id`, or park it until they do.
    ///
    /// # Panics
    ///
    /// Delivering twice to an unconsumed id means id generation is broken;
    /// this is treated as a fatal invariant violation.
    pub fn deliver(&self, id: ConnectionId, conn: C) {
        let mut cells = self.cells.lock();
        match cells.remove(&id) {
            Some(Cell::Ready(_)) => {
                tracing::error!(id = %id, "connection id delivered twice");
                panic!("accepted the same connection id twice: {}", id);
            }
            Some(Cell::Waiting(tx)) => {
                if let Err(conn) = tx.send(conn) {
                    // The waiter gave up; keep the connection for a retry.
                    cells.insert(id, Cell::Ready(conn));
                }
            }
            None => {
                cells.insert(id, Cell::Ready(conn));
            }
        }
    }
}

impl<C: AsyncRead + Unpin> PendingConnections<C> {
    /// Route a freshly authenticated connection by its tag.
    ///
    /// Returns the connection back when it is tagged for the RPC server; the
    /// caller serves it. Every other connection is consumed: delivered to its
    /// waiter, or dropped when the tag is short or malformed.
    pub async fn accept(&self, mut conn: C) -> Option<C> {
        let mut tag = [0u8; HEADER_LEN];
        if let Err(e) = conn.read_exact(&mut tag).await {
            tracing::debug!(error = %e, "dropping connection with short tag");
            return None;
        }
        let Ok(tag) = std::str::from_utf8(&tag) else {
            tracing::debug!("dropping connection with non-ascii tag");
            return None;
        };
        if tag == RPC_CHANNEL {
            return Some(conn);
        }
        match tag.parse::<ConnectionId>() {
            Ok(id) => {
                tracing::trace!(id = %id, "delivering tagged connection");
                self.deliver(id, conn);
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping connection");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn id(s: &str) -> ConnectionId {
        s.parse().unwrap()
    }

    #[test]
    fn test_random_id_format() {
        for _ in 0..100 {
            let id = ConnectionId::random();
            assert_eq!(id.as_str().len(), HEADER_LEN);
            assert!(id.as_str().starts_with("id"));
            assert!(id.as_str()[2..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_deliver_then_wait() {
        let table = PendingConnections::new();
        table.deliver(id("id000001"), 7u32);
        assert_eq!(table.pending(), 1);
        assert_eq!(table.wait(&id("id000001")).await.unwrap(), 7);
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_then_deliver() {
        let table = Arc::new(PendingConnections::new());
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(&id("id000002")).await })
        };
        while table.pending() == 0 {
            tokio::task::yield_now().await;
        }
        table.deliver(id("id000002"), 9u32);
        assert_eq!(waiter.await.unwrap().unwrap(), 9);
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn test_second_waiter_refused() {
        let table = Arc::new(PendingConnections::<u32>::new());
        let first = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(&id("id000003")).await })
        };
        while table.pending() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            table.wait(&id("id000003")).await,
            Err(MuxError::AlreadyWaiting(_))
        ));
        table.deliver(id("id000003"), 1);
        assert_eq!(first.await.unwrap().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "accepted the same connection id twice")]
    fn test_double_delivery_panics() {
        let table = PendingConnections::new();
        table.deliver(id("id000004"), 1u32);
        table.deliver(id("id000004"), 2u32);
    }

    #[tokio::test]
    async fn test_id_consumed_once() {
        let table = PendingConnections::new();
        table.deliver(id("id000005"), 1u32);
        assert_eq!(table.wait(&id("id000005")).await.unwrap(), 1);
        // The id is free again; a new delivery does not collide.
        table.deliver(id("id000005"), 2u32);
        assert_eq!(table.wait(&id("id000005")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let table = PendingConnections::<u32>::new();
        let result = table
            .wait_timeout(&id("id000006"), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(MuxError::Timeout(_))));
        assert_eq!(table.pending(), 0);

        // A late delivery is parked for the next waiter.
        table.deliver(id("id000006"), 3);
        assert_eq!(table.wait(&id("id000006")).await.unwrap(), 3);
    }

    async fn tagged(tag: &[u8]) -> DuplexStream {
        let (mut dialer, accepted) = duplex(64);
        dialer.write_all(tag).await.unwrap();
        // Keep the dialer half alive long enough for the tag to be read.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(dialer);
        });
        accepted
    }

    #[tokio::test]
    async fn test_accept_routes_rpc_channel() {
        let table = PendingConnections::new();
        let conn = tagged(RPC_CHANNEL.as_bytes()).await;
        assert!(table.accept(conn).await.is_some());
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn test_accept_delivers_tagged() {
        let table = PendingConnections::new();
        let conn = tagged(b"id123456").await;
        assert!(table.accept(conn).await.is_none());
        assert!(table.wait(&id("id123456")).await.is_ok());
    }

    #[tokio::test]
    async fn test_accept_drops_short_tag() {
        let table = PendingConnections::new();
        let (mut dialer, accepted) = duplex(64);
        dialer.write_all(b"id1").await.unwrap();
        drop(dialer);
        assert!(table.accept(accepted).await.is_none());
        assert_eq!(table.pending(), 0);
    }
}
