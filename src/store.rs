//! src/store.rs
//!
//! The per-identity connection registry. Enforces at-most-one live
//! connection per PKI-ID, coalesces concurrent dial attempts to the same
//! identity onto a single in-flight dial, and resolves the crossed-dial
//! race by letting whichever side commits first win (spec.md §4.4, §9).
//!
//! Re-keyed from the teacher's endpoint-keyed `Arc<Mutex<HashMap<SocketAddr,
//! Connection>>>` cache (`transport/connection.rs`) to PKI-ID, since a peer
//! identity, not an endpoint, is this crate's unit of deduplication.

use crate::connection::{Connection, ConnectionOwner};
use crate::error::{Error, Result};
use crate::identity::PkiId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, RwLock};

/// A placeholder for an in-flight outbound dial, shared by every concurrent
/// `get_connection` call racing to reach the same `PkiId` (spec.md §4.4).
struct DialLatch {
    notify: Notify,
    result: std::sync::Mutex<Option<std::result::Result<Arc<Connection>, String>>>,
}

impl DialLatch {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: std::sync::Mutex::new(None),
        }
    }

    fn resolve(&self, result: std::result::Result<Arc<Connection>, String>) {
        *self.result.lock().unwrap() = Some(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> std::result::Result<Arc<Connection>, String> {
        loop {
            // Create the `Notified` future (which snapshots `Notify`'s
            // notify_waiters generation) *before* checking `result`, not
            // after: otherwise a `resolve()` landing between the check and
            // the `notified()` call is missed entirely, since
            // `notify_waiters` wakes only futures that existed at the time
            // it was called.
            let notified = self.notify.notified();
            if let Some(result) = self.result.lock().unwrap().clone() {
                return result;
            }
            notified.await;
        }
    }
}

struct Inner {
    connections: HashMap<PkiId, Arc<Connection>>,
    pending_dials: HashMap<PkiId, Arc<DialLatch>>,
}

/// Keeps `PKI-ID -> Connection`, serialising concurrent dials to the same
/// identity and enforcing at most one live session per identity.
pub struct ConnectionStore {
    inner: RwLock<Inner>,
}

impl ConnectionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                connections: HashMap::new(),
                pending_dials: HashMap::new(),
            }),
        })
    }

    /// Returns the existing connection for `pki_id`, if any.
    pub async fn lookup(&self, pki_id: &PkiId) -> Option<Arc<Connection>> {
        self.inner.read().await.connections.get(pki_id).cloned()
    }

    /// Coordinates an outbound dial: returns the existing connection if one
    /// is live, joins an in-flight dial to the same identity if one is
    /// underway, or becomes the dialer itself by running `dial` — always
    /// outside the store's lock (spec.md §5 "long operations are performed
    /// outside the lock").
    ///
    /// `dial` is keyed by the peer's *expected* identity when known; when
    /// the identity is discovered only after the handshake completes (no
    /// expected PKI-ID was supplied), callers should `insert` the resulting
    /// connection themselves rather than go through this coalescing path.
    pub async fn get_or_dial<F, Fut>(&self, expected_pki_id: PkiId, dial: F) -> Result<Arc<Connection>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Arc<Connection>>>,
    {
        let (latch, am_dialer) = {
            let mut inner = self.inner.write().await;
            if let Some(conn) = inner.connections.get(&expected_pki_id) {
                return Ok(conn.clone());
            }
            if let Some(latch) = inner.pending_dials.get(&expected_pki_id) {
                (latch.clone(), false)
            } else {
                let latch = Arc::new(DialLatch::new());
                inner.pending_dials.insert(expected_pki_id, latch.clone());
                (latch, true)
            }
        };

        if !am_dialer {
            return latch
                .wait()
                .await
                .map_err(|_| Error::DialCoalescingFailed(expected_pki_id));
        }

        let outcome = dial().await;
        let mut inner = self.inner.write().await;
        inner.pending_dials.remove(&expected_pki_id);
        match outcome {
            Ok(conn) => {
                // An inbound `on_connected` may have already committed a
                // connection for this identity while our dial was in
                // flight (the lock is released for the duration of
                // `dial()`, per spec.md §5). Whichever side commits to the
                // store first wins the tie-break (spec.md §4.4); if we
                // lost, close our own connection rather than clobbering
                // the winner already installed.
                if let Some(existing) = inner.connections.get(&expected_pki_id) {
                    let existing = existing.clone();
                    latch.resolve(Ok(existing.clone()));
                    drop(inner);
                    conn.close();
                    return Ok(existing);
                }
                inner.connections.insert(expected_pki_id, conn.clone());
                latch.resolve(Ok(conn.clone()));
                Ok(conn)
            }
            Err(e) => {
                latch.resolve(Err(e.to_string()));
                Err(e)
            }
        }
    }

    /// Inbound acceptance: installs `conn` under `pki_id` unless an entry
    /// already exists, in which case the caller must close the stream that
    /// produced `conn` (spec.md §4.4 `onConnected`, tie-break policy §4.4).
    pub async fn on_connected(&self, pki_id: PkiId, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        if inner.connections.contains_key(&pki_id) {
            return None;
        }
        inner.connections.insert(pki_id, conn.clone());
        Some(conn)
    }

    /// Idempotent removal and close.
    pub async fn close_by_pki_id(&self, pki_id: &PkiId) {
        let removed = self.inner.write().await.connections.remove(pki_id);
        if let Some(conn) = removed {
            conn.close();
        }
    }

    /// Removes `pki_id`'s entry only if it still points at `conn` — used by
    /// a `Connection`'s own close path so a stale callback from an already
    /// replaced session can't evict the connection that replaced it.
    pub(crate) async fn remove_if_current(&self, pki_id: &PkiId, conn: &Arc<Connection>) {
        let mut inner = self.inner.write().await;
        if let Some(current) = inner.connections.get(pki_id) {
            if Arc::ptr_eq(current, conn) {
                inner.connections.remove(pki_id);
            }
        }
    }

    pub async fn conn_num(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Closes every live connection and waits for its workers to actually
    /// exit before returning, then drops all state. Used by `Comm::stop`
    /// to satisfy the join-barrier shutdown of spec.md §5, §8 ("worker
    /// count = 0" after `Stop()` returns).
    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        let conns: Vec<_> = inner.connections.drain().map(|(_, conn)| conn).collect();
        inner.pending_dials.clear();
        drop(inner);

        futures::future::join_all(conns.iter().map(|conn| conn.close_and_join())).await;
    }
}

/// Adapter letting a `Connection` call back into its store on fatal error
/// without holding a strong reference to it (spec.md §9).
pub(crate) struct StoreBackref {
    pki_id: PkiId,
    store: Weak<ConnectionStore>,
}

impl StoreBackref {
    pub(crate) fn new(pki_id: PkiId, store: &Arc<ConnectionStore>) -> Arc<dyn ConnectionOwner> {
        Arc::new(Self {
            pki_id,
            store: Arc::downgrade(store),
        })
    }
}

impl ConnectionOwner for StoreBackref {
    fn on_connection_closed(&self, pki_id: PkiId) {
        debug_assert_eq!(pki_id, self.pki_id);
        if let Some(store) = self.store.upgrade() {
            let pki_id = self.pki_id;
            tokio::spawn(async move {
                let conn = store.lookup(&pki_id).await;
                if let Some(conn) = conn {
                    store.remove_if_current(&pki_id, &conn).await;
                }
            });
        }
    }
}
