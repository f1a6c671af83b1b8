//! src/comm.rs
//!
//! The public entry point: starts a server-side acceptor, exposes
//! `send`/`probe`/`handshake`/`accept`/`close_conn`/`stop`, and owns the
//! whole instance's lifecycle (spec.md §4.7).
//!
//! Grounded in the teacher's `App`/`Engine` lifecycle pattern
//! (`src/app.rs`, `src/engine/mod.rs`): a `CancellationToken`-driven
//! shutdown, one `tokio::spawn` per long-running service, channels wired up
//! at construction.

use crate::connection::{Connection, ConnectionInfo};
use crate::demux::Demultiplexer;
use crate::envelope::{self, GossipMessage};
use crate::error::{Error, Result};
use crate::handshake::{self, HandshakeOptions, Role};
use crate::identity::{Ed25519IdentityMapper, IdentityMapper, LocalIdentity, PeerIdentity, PkiId};
use crate::store::{ConnectionStore, StoreBackref};
use crate::transport::{ListenMode, Transport, DEFAULT_DIAL_TIMEOUT};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Bound on the dead-endpoint channel (spec.md §3, §6).
pub const DEAD_ENDPOINT_BUFFER: usize = 100;

/// A remote peer to dial: its network endpoint and, optionally, the
/// identity we expect to find there (spec.md §3).
#[derive(Clone, Debug)]
pub struct RemotePeer {
    pub endpoint: SocketAddr,
    pub expected_pki_id: Option<PkiId>,
}

impl RemotePeer {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            expected_pki_id: None,
        }
    }

    pub fn with_expected(endpoint: SocketAddr, expected_pki_id: PkiId) -> Self {
        Self {
            endpoint,
            expected_pki_id: Some(expected_pki_id),
        }
    }
}

/// Runtime options the facade is constructed with (spec.md §6).
#[derive(Clone, Debug)]
pub struct CommOptions {
    pub dial_timeout: Duration,
    pub conn_timeout: Duration,
    pub skip_handshake: bool,
    pub send_buffer: usize,
    pub recv_buffer: usize,
}

impl Default for CommOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            conn_timeout: handshake::DEFAULT_CONN_TIMEOUT,
            skip_handshake: false,
            send_buffer: crate::connection::DEFAULT_SEND_BUFFER,
            recv_buffer: crate::connection::DEFAULT_RECV_BUFFER,
        }
    }
}

/// One subscriber's bounded channel, paired with the predicate it was
/// registered under only for bookkeeping (the predicate itself lives in
/// the `Demultiplexer`).
pub struct Subscriber {
    pub messages: mpsc::Receiver<Arc<GossipMessage>>,
}

/// The public facade: one per process.
pub struct Comm {
    local: Arc<LocalIdentity>,
    identity_mapper: Arc<dyn IdentityMapper>,
    transport: Arc<Transport>,
    store: Arc<ConnectionStore>,
    demux: Arc<Demultiplexer>,
    options: CommOptions,
    stopping: Arc<AtomicBool>,
    dead_endpoint_tx: mpsc::Sender<PkiId>,
    dead_endpoint_rx: Mutex<Option<mpsc::Receiver<PkiId>>>,
    acceptor_cancel: CancellationToken,
    acceptor_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Every in-flight `handle_inbound` task (accept + handshake), tracked
    /// so `stop` can join them instead of leaving them to finish on their
    /// own after the facade has reported itself stopped (spec.md §5, §8).
    inbound_tasks: Mutex<tokio::task::JoinSet<()>>,
}

impl Comm {
    /// Constructs and starts a `Comm` instance: binds (or attaches to) the
    /// transport and spawns the server-side acceptor task immediately
    /// (spec.md §3 "started at construction").
    pub async fn start(
        local: LocalIdentity,
        mode: ListenMode,
        tls: Option<Arc<crate::transport::tls::TlsMaterial>>,
        options: CommOptions,
    ) -> Result<Arc<Self>> {
        let transport = Arc::new(Transport::new(mode, tls)?);
        let (dead_endpoint_tx, dead_endpoint_rx) = mpsc::channel(DEAD_ENDPOINT_BUFFER);

        let comm = Arc::new(Self {
            local: Arc::new(local),
            identity_mapper: Arc::new(Ed25519IdentityMapper::new()),
            transport,
            store: ConnectionStore::new(),
            demux: Arc::new(Demultiplexer::new()),
            options,
            stopping: Arc::new(AtomicBool::new(false)),
            dead_endpoint_tx,
            dead_endpoint_rx: Mutex::new(Some(dead_endpoint_rx)),
            acceptor_cancel: CancellationToken::new(),
            acceptor_handle: Mutex::new(None),
            inbound_tasks: Mutex::new(tokio::task::JoinSet::new()),
        });

        let handle = tokio::spawn(Self::acceptor_loop(comm.clone()));
        *comm.acceptor_handle.lock().await = Some(handle);

        Ok(comm)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn pki_id(&self) -> PkiId {
        self.local.pki_id
    }

    /// Number of live sessions currently held in the connection store.
    /// Exposed mainly so callers (and tests) can check the at-most-one-
    /// live-session-per-PKI-ID invariant (spec.md §3, §8).
    pub async fn conn_num(&self) -> usize {
        self.store.conn_num().await
    }

    /// Dispatches `message` independently to each peer; per-peer failure
    /// disconnects that peer and emits its PKI-ID on the dead-endpoint
    /// channel. Returns immediately (spec.md §4.7 `Send`).
    pub fn send(self: &Arc<Self>, message: GossipMessage, peers: &[RemotePeer]) {
        for peer in peers.iter().cloned() {
            let comm = self.clone();
            let message = message.clone();
            tokio::spawn(async move {
                comm.send_one(peer, message).await;
            });
        }
    }

    async fn send_one(self: Arc<Self>, peer: RemotePeer, message: GossipMessage) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        let conn = match self.get_connection(peer.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(peer = ?peer.endpoint, error = %e, "send: could not obtain connection");
                if let Some(expected) = peer.expected_pki_id {
                    self.disconnect(expected).await;
                }
                return;
            }
        };

        let envelope = match envelope::sign(&message, &self.local, None) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "send: failed to sign outbound message");
                return;
            }
        };

        let pki_id = conn.info.pki_id;
        let comm = self.clone();
        conn.send(
            envelope,
            &move |e| {
                tracing::warn!(peer = %pki_id, error = %e, "send failed");
                let comm = comm.clone();
                tokio::spawn(async move { comm.disconnect(pki_id).await });
            },
        );
    }

    /// Dials, sends a harmless ping, and closes without retaining a session
    /// (spec.md §4.7 `Probe`). The `Ping` wire variant carries no gossip
    /// semantics and exists solely to give `Probe` something to send.
    pub async fn probe(self: &Arc<Self>, peer: RemotePeer) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::Stopping);
        }
        let (mut send, mut recv, observed_hash) =
            self.transport.dial(peer.endpoint, self.options.dial_timeout).await?;
        let opts = self.handshake_opts(observed_hash);
        let _ = handshake::perform(
            &mut send,
            &mut recv,
            Role::Dialer,
            &self.local,
            peer.expected_pki_id,
            self.identity_mapper.as_ref(),
            &opts,
        )
        .await?;
        let _ = send.finish().await;
        Ok(())
    }

    /// Full handshake, no session retained; returns the verified peer
    /// identity (spec.md §4.7 `Handshake`).
    pub async fn handshake(self: &Arc<Self>, peer: RemotePeer) -> Result<PeerIdentity> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::Stopping);
        }
        let (mut send, mut recv, observed_hash) =
            self.transport.dial(peer.endpoint, self.options.dial_timeout).await?;
        let opts = self.handshake_opts(observed_hash);
        let info = handshake::perform(
            &mut send,
            &mut recv,
            Role::Dialer,
            &self.local,
            peer.expected_pki_id,
            self.identity_mapper.as_ref(),
            &opts,
        )
        .await?;
        let _ = send.finish().await;
        Ok(info.peer_identity)
    }

    /// Registers a predicate-filtered subscriber and returns its bounded
    /// receive channel (spec.md §4.7 `Accept`).
    pub fn accept(
        &self,
        predicate: impl Fn(&GossipMessage) -> bool + Send + Sync + 'static,
    ) -> Option<Subscriber> {
        if self.stopping.load(Ordering::Acquire) {
            return None;
        }
        self.demux
            .add_channel(predicate)
            .map(|messages| Subscriber { messages })
    }

    /// Forces connection teardown for `peer`'s identity, when known
    /// (spec.md §4.7 `CloseConn`).
    pub async fn close_conn(&self, peer: &RemotePeer) {
        if let Some(pki_id) = peer.expected_pki_id {
            self.store.close_by_pki_id(&pki_id).await;
        }
    }

    /// Takes the dead-endpoint receiver. May only be called once; later
    /// calls return `None` (spec.md §4.7 `PresumedDead`).
    pub async fn presumed_dead(&self) -> Option<mpsc::Receiver<PkiId>> {
        self.dead_endpoint_rx.lock().await.take()
    }

    /// Idempotent shutdown, in the order spec.md §4.7 prescribes: mark
    /// stopping, stop the acceptor, join every task it spawned (so no new
    /// connection can appear after this point), shut down the connection
    /// store (itself a join barrier on every connection's workers), then
    /// close the demultiplexer and every subscriber channel. After this
    /// returns, worker count is zero (spec.md §5, §8).
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.acceptor_cancel.cancel();
        self.transport.close().await;

        if let Some(handle) = self.acceptor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = ?e, "acceptor task join failed during stop");
            }
        }

        {
            let mut inbound_tasks = self.inbound_tasks.lock().await;
            while let Some(result) = inbound_tasks.join_next().await {
                if let Err(e) = result {
                    tracing::warn!(error = ?e, "inbound handshake task join failed during stop");
                }
            }
        }

        self.store.shutdown().await;
        self.demux.close();

        tracing::info!("comm instance stopped");
    }

    fn handshake_opts(&self, observed_peer_cert_hash: Option<[u8; 32]>) -> HandshakeOptions {
        HandshakeOptions {
            conn_timeout: self.options.conn_timeout,
            skip_handshake: self.options.skip_handshake,
            local_cert_hash: self.transport.tls.as_ref().map(|m| m.cert_hash),
            observed_peer_cert_hash,
        }
    }

    /// Drives `ConnectionStore::get_or_dial` for outbound sends: dials,
    /// handshakes, and wraps the result in a `Connection` on success
    /// (spec.md §4.4 `getConnection`).
    async fn get_connection(self: &Arc<Self>, peer: RemotePeer) -> Result<Arc<Connection>> {
        if let Some(expected) = peer.expected_pki_id {
            if let Some(conn) = self.store.lookup(&expected).await {
                return Ok(conn);
            }
            let comm = self.clone();
            let peer_for_dial = peer.clone();
            return self
                .store
                .get_or_dial(expected, move || comm.dial_and_handshake(peer_for_dial))
                .await;
        }

        // No expected identity: dial-coalescing can't key on an identity we
        // don't yet know, so every such call dials independently and the
        // store's `on_connected`-equivalent insert below still enforces
        // at-most-one-live-session once the peer's real identity surfaces.
        let conn = self.dial_and_handshake(peer).await?;
        let pki_id = conn.info.pki_id;
        if let Some(existing) = self.store.lookup(&pki_id).await {
            conn.close();
            return Ok(existing);
        }
        match self.store.on_connected(pki_id, conn.clone()).await {
            Some(conn) => Ok(conn),
            None => {
                conn.close();
                self.store
                    .lookup(&pki_id)
                    .await
                    .ok_or(Error::NoSuchConnection(pki_id))
            }
        }
    }

    async fn dial_and_handshake(self: Arc<Self>, peer: RemotePeer) -> Result<Arc<Connection>> {
        let (mut send, mut recv, observed_hash) =
            self.transport.dial(peer.endpoint, self.options.dial_timeout).await?;
        let opts = self.handshake_opts(observed_hash);
        let info = handshake::perform(
            &mut send,
            &mut recv,
            Role::Dialer,
            &self.local,
            peer.expected_pki_id,
            self.identity_mapper.as_ref(),
            &opts,
        )
        .await?;

        Ok(self.install_connection(info, send, recv))
    }

    fn install_connection(
        self: &Arc<Self>,
        info: ConnectionInfo,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    ) -> Arc<Connection> {
        let pki_id = info.pki_id;
        let demux = self.demux.clone();
        let handler = Arc::new(move |envelope: crate::envelope::Envelope| {
            if let Ok(message) = envelope::decode_message(&envelope.payload) {
                demux.demultiplex(message);
            }
        });
        let owner = StoreBackref::new(pki_id, &self.store);
        Connection::spawn(
            info,
            send,
            recv,
            self.options.send_buffer,
            self.options.recv_buffer,
            handler,
            owner,
        )
    }

    async fn disconnect(self: Arc<Self>, pki_id: PkiId) {
        self.store.close_by_pki_id(&pki_id).await;
        if self.dead_endpoint_tx.try_send(pki_id).is_err() {
            tracing::debug!(%pki_id, "dead-endpoint channel full; dropping notification");
        }
    }

    /// Server-side: accepts inbound streams, authenticates each, and hands
    /// it to the connection store; on acceptance, installs the handler and
    /// lets the connection's own workers run the service loop (spec.md
    /// §4.7 "Server side").
    async fn acceptor_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.acceptor_cancel.cancelled() => {
                    tracing::info!("acceptor loop received shutdown signal");
                    break;
                }
                accepted = self.transport.accept() => {
                    match accepted {
                        Ok(Some((send, recv, observed_hash, remote))) => {
                            let comm = self.clone();
                            self.inbound_tasks.lock().await.spawn(async move {
                                comm.handle_inbound(send, recv, observed_hash, remote).await;
                            });
                        }
                        Ok(None) => {
                            tracing::info!("transport endpoint closed; acceptor loop exiting");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept inbound connection");
                        }
                    }
                }
            }
        }
    }

    async fn handle_inbound(
        self: Arc<Self>,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        observed_hash: Option<[u8; 32]>,
        remote: SocketAddr,
    ) {
        let opts = self.handshake_opts(observed_hash);
        let info = match handshake::perform(
            &mut send,
            &mut recv,
            Role::Acceptor,
            &self.local,
            None,
            self.identity_mapper.as_ref(),
            &opts,
        )
        .await
        {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(peer = %remote, error = %e, "inbound handshake failed");
                return;
            }
        };

        let pki_id = info.pki_id;
        let conn = self.install_connection(info, send, recv);
        if self.store.on_connected(pki_id, conn.clone()).await.is_none() {
            tracing::debug!(%pki_id, "rejecting inbound connection: identity already has a live session");
            conn.close();
        }
    }
}
