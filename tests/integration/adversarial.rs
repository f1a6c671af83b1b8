//! tests/integration/adversarial.rs
//!
//! End-to-end scenarios 3 and 4 from spec.md §8 (identity mismatch, TLS
//! transport-certificate binding violation), plus the idempotence
//! properties from §8.

use crate::common::harness::{wait_until, TestNode};
use gossip_comm::identity::{LocalIdentity, PkiId};
use gossip_comm::transport::tls::TlsMaterial;
use gossip_comm::transport::{ListenMode, Transport};
use gossip_comm::{handshake, Error, GossipMessage, RemotePeer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn identity_mismatch_via_handshake_returns_pki_mismatch() {
    let b = TestNode::spawn().await;
    let real_pki_id = b.comm.pki_id();
    let bogus_pki_id = PkiId([0xAB; 32]);
    assert_ne!(real_pki_id, bogus_pki_id);

    let peer = RemotePeer::with_expected(b.addr, bogus_pki_id);
    let err = b
        .comm
        .handshake(peer)
        .await
        .expect_err("handshake should reject a mismatched expected PKI-ID");

    match err {
        Error::HandshakePkiMismatch { expected, actual } => {
            assert_eq!(expected, bogus_pki_id);
            assert_eq!(actual, real_pki_id);
        }
        other => panic!("expected HandshakePkiMismatch, got {other:?}"),
    }

    b.comm.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn identity_mismatch_via_send_emits_expected_pki_id_on_dead_endpoint() {
    let a = TestNode::spawn().await;
    let b = TestNode::spawn().await;
    let bogus_pki_id = PkiId([0xCD; 32]);

    let mut dead = a.comm.presumed_dead().await.expect("dead-endpoint channel available");
    let peer = RemotePeer::with_expected(b.addr, bogus_pki_id);
    a.comm.send(GossipMessage::Ping, &[peer]);

    let reported = tokio::time::timeout(Duration::from_secs(2), dead.recv())
        .await
        .expect("a dead-endpoint notification should arrive")
        .expect("channel should not be closed");
    assert_eq!(reported, bogus_pki_id);
    assert_eq!(a.comm.conn_num().await, 0, "no session should have been created");

    a.comm.stop().await;
    b.comm.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tls_binding_violation_fails_the_handshake() {
    let tls_a = Arc::new(TlsMaterial::generate_self_signed().unwrap());
    let tls_b = Arc::new(TlsMaterial::generate_self_signed().unwrap());
    let local_a = LocalIdentity::generate();
    let local_b = LocalIdentity::generate();

    let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let server = Transport::new(ListenMode::Bind(loopback), Some(tls_b.clone())).unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = Transport::new(ListenMode::Bind(loopback), Some(tls_a.clone())).unwrap();

    let server_task = tokio::spawn(async move {
        let (mut send, mut recv, observed_hash, _remote) = server.accept().await.unwrap().unwrap();
        let opts = handshake::HandshakeOptions {
            conn_timeout: Duration::from_secs(2),
            skip_handshake: false,
            local_cert_hash: Some(tls_b.cert_hash),
            observed_peer_cert_hash: observed_hash,
        };
        let mapper = gossip_comm::identity::Ed25519IdentityMapper::new();
        handshake::perform(
            &mut send,
            &mut recv,
            handshake::Role::Acceptor,
            &local_b,
            None,
            &mapper,
            &opts,
        )
        .await
    });

    let (mut send, mut recv, _observed_hash) = client.dial(server_addr, Duration::from_secs(3)).await.unwrap();
    // The dial really did observe the server's genuine cert hash, but we
    // feed the handshake a different one here, simulating a transport layer
    // that disagrees with what the peer asserts about itself (spec.md
    // scenario 4: claimed hash H' != observed hash H).
    let wrong_observed = Some([0x42u8; 32]);
    let opts = handshake::HandshakeOptions {
        conn_timeout: Duration::from_secs(2),
        skip_handshake: false,
        local_cert_hash: Some(tls_a.cert_hash),
        observed_peer_cert_hash: wrong_observed,
    };
    let mapper = gossip_comm::identity::Ed25519IdentityMapper::new();
    let client_result = handshake::perform(
        &mut send,
        &mut recv,
        handshake::Role::Dialer,
        &local_a,
        None,
        &mapper,
        &opts,
    )
    .await;

    assert!(
        matches!(client_result, Err(Error::HandshakeTransportBindingMismatch)),
        "expected a transport-binding mismatch, got {client_result:?}"
    );

    let server_result = server_task.await.unwrap();
    assert!(
        server_result.is_ok(),
        "the server's own view of the handshake should succeed: only the client fed itself a bogus observed hash"
    );
}

#[tokio::test]
async fn stop_is_idempotent_and_presumed_dead_is_single_use() {
    let node = TestNode::spawn().await;
    assert!(node.comm.presumed_dead().await.is_some());
    assert!(node.comm.presumed_dead().await.is_none());
    node.comm.stop().await;
    node.comm.stop().await;
    assert!(node.comm.accept(|_| true).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn close_conn_tears_down_an_established_session() {
    let a = TestNode::spawn().await;
    let b = TestNode::spawn().await;
    let peer = b.as_peer_expecting_self();

    a.comm.send(GossipMessage::Ping, &[peer.clone()]);
    let connected = wait_until(|| async { a.comm.conn_num().await == 1 }, Duration::from_secs(2)).await;
    assert!(connected, "A should have established a session with B");

    a.comm.close_conn(&peer).await;
    assert_eq!(a.comm.conn_num().await, 0);

    a.comm.stop().await;
    b.comm.stop().await;
}
