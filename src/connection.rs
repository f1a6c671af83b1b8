//! src/connection.rs
//!
//! One peer session: a single bidirectional QUIC stream, a bounded send
//! queue drained by one send worker, one receive worker dispatching to a
//! handler callback, and a close latch shared by every exit path
//! (spec.md §4.3).
//!
//! A `Connection` carries a weak, PKI-ID-keyed back-reference to the store
//! it lives in so it can deregister itself on a fatal stream error without
//! the store owning it in turn (spec.md §9 — "a relation, not ownership").

use crate::envelope::{self, Envelope, GossipMessage};
use crate::error::{Error, Result};
use crate::identity::PkiId;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use quinn::{RecvStream, SendStream};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Default bound on a connection's outbound send queue (spec.md §3, §6).
pub const DEFAULT_SEND_BUFFER: usize = 20;

/// Default bound on a connection's inbound staging queue (spec.md §3, §6).
pub const DEFAULT_RECV_BUFFER: usize = 20;

/// Identity established for this session by the handshake engine
/// (spec.md §3).
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub pki_id: PkiId,
    pub peer_identity: crate::identity::PeerIdentity,
    pub auth_info: Option<AuthInfo>,
}

/// The transport-certificate binding recorded when both ends run with
/// transport security active (spec.md §3, §4.5 step 6).
#[derive(Clone, Debug)]
pub struct AuthInfo {
    pub signature: Vec<u8>,
    pub signed_bytes: Vec<u8>,
}

type Handler = dyn Fn(Envelope) + Send + Sync;
type OnError = dyn Fn(Error) + Send + Sync;

/// Back-reference a `Connection` uses to deregister itself from its store
/// without holding a strong reference to it (spec.md §9).
pub(crate) trait ConnectionOwner: Send + Sync {
    fn on_connection_closed(&self, pki_id: PkiId);
}

/// The two background tasks a live `Connection` owns, retained so shutdown
/// can join them instead of merely signalling them (spec.md §5, §8).
struct WorkerHandles {
    send: JoinHandle<()>,
    receive: JoinHandle<()>,
}

/// One live peer session.
pub struct Connection {
    pub info: ConnectionInfo,
    send_tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    workers: Mutex<Option<WorkerHandles>>,
    /// Keeps the store's back-reference to this connection alive for
    /// exactly as long as the connection itself, so the weak handle its
    /// workers hold (`ConnectionOwner`) can always be upgraded on a fatal
    /// stream error, not just when `Comm` itself is still holding the
    /// strong `Arc` (spec.md §9).
    _owner_keepalive: Arc<dyn ConnectionOwner>,
}

impl Connection {
    /// Wraps a freshly handshaken bidirectional stream, spawning its send
    /// and receive workers. `handler` is invoked synchronously, in arrival
    /// order, for every received envelope (spec.md §4.3).
    pub(crate) fn spawn(
        info: ConnectionInfo,
        send_stream: SendStream,
        recv_stream: RecvStream,
        send_buffer: usize,
        recv_buffer: usize,
        handler: Arc<Handler>,
        owner: Arc<dyn ConnectionOwner>,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(send_buffer);
        let cancel = CancellationToken::new();
        let owner_weak = Arc::downgrade(&owner);

        let conn = Arc::new(Self {
            info: info.clone(),
            send_tx,
            cancel: cancel.clone(),
            workers: tokio::sync::Mutex::new(None),
            _owner_keepalive: owner,
        });

        let send_handle = tokio::spawn(Self::send_worker(
            send_rx,
            send_stream,
            info.pki_id,
            cancel.clone(),
            owner_weak.clone(),
        ));
        let receive_handle = tokio::spawn(Self::receive_worker(
            recv_stream,
            info.pki_id,
            handler,
            cancel,
            owner_weak,
            recv_buffer,
        ));

        // Uncontended: nothing else has a handle to `conn` yet.
        *conn.workers.try_lock().expect("uncontended at construction") = Some(WorkerHandles {
            send: send_handle,
            receive: receive_handle,
        });

        conn
    }

    /// Enqueues `message` for delivery without ever blocking the caller. A
    /// full queue invokes `on_error` with `Error::SendOverflow` and returns
    /// (spec.md §4.3 `send`, §7).
    pub fn send(&self, envelope: Envelope, on_error: &OnError) {
        if self.cancel.is_cancelled() {
            on_error(Error::StreamBroken);
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_) | mpsc::error::TrySendError::Closed(_)) =
            self.send_tx.try_send(envelope)
        {
            on_error(Error::SendOverflow);
        }
    }

    /// Idempotent teardown: signals both workers to stop and marks the
    /// connection closed. Safe to call from any exit path, any number of
    /// times (spec.md §4.3, §8).
    ///
    /// Uses a `CancellationToken` rather than a bare `Notify`: `Notify`'s
    /// `notify_waiters` only wakes tasks already polling `notified()`, so a
    /// close racing a worker mid-`framed.send()`/`framed.next()` (polling
    /// neither) would be missed and the worker would then park on
    /// `notified()` forever. `CancellationToken::cancelled()` checks the
    /// cancelled flag on every poll, so it can't miss a `cancel()` that
    /// happened before the worker started waiting on it.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signals both workers to stop and waits for them to actually exit, so
    /// that after this returns no task of this connection's remains running
    /// (spec.md §5 join barrier, §8 "worker count = 0"). Used by
    /// `ConnectionStore::shutdown` rather than the fire-and-forget `close`,
    /// which every other exit path uses.
    pub(crate) async fn close_and_join(&self) {
        self.cancel.cancel();
        let handles = self.workers.lock().await.take();
        if let Some(WorkerHandles { send, receive }) = handles {
            let _ = send.await;
            let _ = receive.await;
        }
    }

    /// Builds a `Connection` with no workers and no real stream, for tests
    /// (e.g. `store.rs`'s tie-break test) that only need a distinct,
    /// closable handle to stand in for a session.
    #[cfg(test)]
    pub(crate) fn test_stub(info: ConnectionInfo) -> Arc<Self> {
        let (send_tx, _send_rx) = mpsc::channel(1);
        Arc::new(Self {
            info,
            send_tx,
            cancel: CancellationToken::new(),
            workers: tokio::sync::Mutex::new(None),
            _owner_keepalive: Arc::new(NullOwner),
        })
    }

    async fn send_worker(
        mut send_rx: mpsc::Receiver<Envelope>,
        send_stream: SendStream,
        pki_id: PkiId,
        cancel: CancellationToken,
        owner: Weak<dyn ConnectionOwner>,
    ) {
        let codec = LengthDelimitedCodec::new();
        let mut framed = FramedWrite::new(send_stream, codec);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_envelope = send_rx.recv() => {
                    match maybe_envelope {
                        None => break,
                        Some(envelope) => {
                            let bytes = match envelope::encode_envelope(&envelope) {
                                Ok(bytes) => bytes,
                                Err(e) => {
                                    tracing::warn!(%pki_id, error = %e, "failed to encode outbound envelope");
                                    continue;
                                }
                            };
                            if let Err(e) = framed.send(Bytes::from(bytes)).await {
                                tracing::warn!(%pki_id, error = %e, "send worker hit a broken stream");
                                break;
                            }
                        }
                    }
                }
            }
        }

        cancel.cancel();
        if let Some(owner) = owner.upgrade() {
            owner.on_connection_closed(pki_id);
        }
    }

    /// Reads and decodes frames off the wire, then dispatches them to
    /// `handler` through a bounded staging channel (spec.md §6
    /// `recv_buffer`): a slow handler applies backpressure to the stream
    /// reader instead of letting decoded envelopes pile up unboundedly in
    /// memory. The reader and the dispatcher run concurrently inside this
    /// one spawned task (`tokio::join!`) rather than as separate tasks, so
    /// the connection still has exactly one receive worker (spec.md §4.3).
    async fn receive_worker(
        recv_stream: RecvStream,
        pki_id: PkiId,
        handler: Arc<Handler>,
        cancel: CancellationToken,
        owner: Weak<dyn ConnectionOwner>,
        recv_buffer: usize,
    ) {
        let codec = LengthDelimitedCodec::new();
        let mut framed = FramedRead::new(recv_stream, codec);
        let (stage_tx, mut stage_rx) = mpsc::channel::<Envelope>(recv_buffer);
        let reader_cancel = cancel.clone();

        let reader = async {
            loop {
                let bytes = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = framed.next() => match frame {
                        None => {
                            tracing::debug!(%pki_id, "peer closed its end of the stream");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(%pki_id, error = %e, "receive worker hit a broken stream");
                            break;
                        }
                        Some(Ok(bytes)) => bytes,
                    },
                };

                let envelope = match envelope::decode_envelope(&bytes) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(%pki_id, error = %e, "dropping malformed envelope");
                        continue;
                    }
                };

                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    result = stage_tx.send(envelope) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping `stage_tx` here (the reader's only sender) is what
            // lets the dispatcher below drain and exit.
        };

        let dispatcher = async {
            while let Some(envelope) = stage_rx.recv().await {
                handler(envelope);
            }
        };

        tokio::join!(reader, dispatcher);

        cancel.cancel();
        if let Some(owner) = owner.upgrade() {
            owner.on_connection_closed(pki_id);
        }
    }
}

/// A `ConnectionOwner` that does nothing, for tests that need a `Connection`
/// without a real store behind it.
#[cfg(test)]
struct NullOwner;

#[cfg(test)]
impl ConnectionOwner for NullOwner {
    fn on_connection_closed(&self, _pki_id: PkiId) {}
}
