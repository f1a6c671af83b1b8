//! tests/common/harness.rs
//!
//! Test harness for spinning up `Comm` instances on loopback, with or
//! without transport security, and tearing them down. Grounded in the
//! teacher's `TestNode::spawn`/tempdir pattern (`tests/common/harness.rs`),
//! adapted from a single-node-plus-websocket-observer harness to a
//! two/N-`Comm` harness with no observation channel beyond the public API.

use gossip_comm::transport::tls::TlsMaterial;
use gossip_comm::transport::ListenMode;
use gossip_comm::{Comm, CommOptions, LocalIdentity, RemotePeer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// A running `Comm` instance plus everything a test needs to dial it.
pub struct TestNode {
    pub comm: Arc<Comm>,
    pub addr: SocketAddr,
}

impl TestNode {
    /// Spawns a node with no transport security, default options.
    pub async fn spawn() -> Self {
        Self::spawn_with(None, CommOptions::default()).await
    }

    /// Spawns a node with the given options (e.g. a small `send_buffer`).
    pub async fn spawn_with_options(options: CommOptions) -> Self {
        Self::spawn_with(None, options).await
    }

    /// Spawns a node with transport security active, using a fresh
    /// self-signed certificate.
    pub async fn spawn_with_tls() -> Self {
        let tls = Arc::new(TlsMaterial::generate_self_signed().expect("generate self-signed cert"));
        Self::spawn_with(Some(tls), CommOptions::default()).await
    }

    async fn spawn_with(tls: Option<Arc<TlsMaterial>>, options: CommOptions) -> Self {
        let identity = LocalIdentity::generate();
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let comm = Comm::start(identity, ListenMode::Bind(bind_addr), tls, options)
            .await
            .expect("comm instance should start");
        let addr = comm.local_addr().expect("bound comm instance has a local address");
        Self { comm, addr }
    }

    /// A `RemotePeer` pointing at this node with no identity pinned.
    pub fn as_peer(&self) -> RemotePeer {
        RemotePeer::new(self.addr)
    }

    /// A `RemotePeer` pointing at this node, pinned to its actual PKI-ID.
    pub fn as_peer_expecting_self(&self) -> RemotePeer {
        RemotePeer::with_expected(self.addr, self.comm.pki_id())
    }
}

/// Polls an async `condition` until it returns `true` or `deadline` elapses,
/// sleeping briefly between checks. Used in place of a fixed `sleep`
/// wherever a test needs to wait for async background work (a dial, a
/// handshake, a disconnect) to land.
pub async fn wait_until<F, Fut>(mut condition: F, deadline: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition().await {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
