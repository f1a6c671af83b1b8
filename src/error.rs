//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use crate::identity::PkiId;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize or deserialize: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Cryptography error: {0}")]
    Crypto(#[from] ed25519_dalek::SignatureError),

    #[error("Invalid identity key file")]
    InvalidKeyFile,

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Failed to initiate connection to {0}: {1}")]
    DialFailed(SocketAddr, #[source] quinn::ConnectError),

    #[error("Dial failed: {0}")]
    DialFailedGeneric(String),

    #[error("Connection to {0} failed during establishment: {1}")]
    ConnectionEstablishFailed(SocketAddr, #[source] quinn::ConnectionError),

    #[error("An established connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("Failed to write to network stream: {0}")]
    WriteStream(#[from] quinn::WriteError),

    #[error("Failed to read from network stream: {0}")]
    ReadStream(String),

    #[error("Dial to PKI-ID {0} failed on another coalesced caller")]
    DialCoalescingFailed(PkiId),

    // --- Handshake error kinds (spec.md §7) ---
    #[error("Timed out waiting for peer's handshake reply")]
    HandshakeTimeout,

    #[error("Peer's first message on stream was not ConnEstablish")]
    HandshakeWrongType,

    #[error("Peer's ConnEstablish carried no PKI-ID")]
    HandshakeMissingPkiId,

    #[error("Local identity mapper rejected the peer's identity: {0}")]
    HandshakeIdentityRejected(String),

    #[error("Peer PKI-ID {actual} did not match the expected PKI-ID {expected}")]
    HandshakePkiMismatch { expected: PkiId, actual: PkiId },

    #[error(
        "Peer's declared transport-certificate hash did not match the hash observed on the transport layer"
    )]
    HandshakeTransportBindingMismatch,

    #[error("Local transport security is active but the peer presented no transport certificate")]
    HandshakeMissingTransportCert,

    #[error("Peer's handshake signature failed to verify")]
    HandshakeSignatureInvalid,

    // --- Send-path error kinds ---
    #[error("Send queue is full; message dropped")]
    SendOverflow,

    #[error("Connection's underlying stream is broken")]
    StreamBroken,

    #[error("No live or in-flight connection for PKI-ID {0}")]
    NoSuchConnection(PkiId),

    #[error("Comm instance is stopping; no new work is accepted")]
    Stopping,
}
