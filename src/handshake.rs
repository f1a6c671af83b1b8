//! src/handshake.rs
//!
//! The identity-binding handshake run on every freshly opened bidirectional
//! stream, inbound or outbound (spec.md §4.5). No close teacher analog
//! exists — the teacher's node never authenticates peers at the
//! application layer — so this module is built directly from spec.md §4.5
//! in the crate's idiom (async fn returning `error::Result`, `tracing`
//! logging, `tokio::time::timeout`).

use crate::connection::{AuthInfo, ConnectionInfo};
use crate::envelope::{self, GossipMessage};
use crate::error::{Error, Result};
use crate::identity::{IdentityMapper, LocalIdentity, PkiId};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use quinn::{RecvStream, SendStream};
use std::time::Duration;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Default deadline for receiving the peer's handshake reply (spec.md §5, §6).
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(2);

/// Which side opened the stream; only affects logging and which party's
/// expectations (`expected_pki_id`) are checked — the wire exchange itself
/// is symmetric (spec.md §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Acceptor,
}

/// Runtime knobs the handshake needs beyond identity and timeouts
/// (spec.md §6).
#[derive(Clone, Debug)]
pub struct HandshakeOptions {
    pub conn_timeout: Duration,
    pub skip_handshake: bool,
    /// `Some` when transport security is active locally; carries this
    /// node's leaf certificate hash.
    pub local_cert_hash: Option<[u8; 32]>,
    /// The certificate hash this node's transport layer actually observed
    /// from the remote peer on this stream, independent of whatever the
    /// peer claims in its `ConnEstablish` (spec.md §6).
    pub observed_peer_cert_hash: Option<[u8; 32]>,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            skip_handshake: false,
            local_cert_hash: None,
            observed_peer_cert_hash: None,
        }
    }
}

/// Runs the handshake to completion on `send`/`recv`, returning the
/// established `ConnectionInfo` or a fatal `Error` that the caller must
/// treat as "close this stream, no session" (spec.md §4.5).
pub async fn perform(
    send: &mut SendStream,
    recv: &mut RecvStream,
    _role: Role,
    local: &LocalIdentity,
    expected_pki_id: Option<PkiId>,
    mapper: &dyn IdentityMapper,
    opts: &HandshakeOptions,
) -> Result<ConnectionInfo> {
    let establish = GossipMessage::ConnEstablish {
        pki_id: local.pki_id,
        identity_certificate: local.peer_identity.clone(),
        transport_cert_hash: opts.local_cert_hash,
    };
    let our_envelope = envelope::sign(&establish, local, opts.local_cert_hash.as_ref())?;

    let mut writer = FramedWrite::new(send, LengthDelimitedCodec::new());
    let bytes = envelope::encode_envelope(&our_envelope)?;
    writer
        .send(Bytes::from(bytes))
        .await
        .map_err(|_| Error::StreamBroken)?;

    let mut reader = FramedRead::new(recv, LengthDelimitedCodec::new());
    let frame = tokio::time::timeout(opts.conn_timeout, reader.next())
        .await
        .map_err(|_| Error::HandshakeTimeout)?
        .ok_or(Error::StreamBroken)?
        .map_err(|_| Error::StreamBroken)?;

    let peer_envelope = envelope::decode_envelope(&frame)?;
    let peer_message = envelope::decode_message(&peer_envelope.payload)?;

    let (peer_pki_id, peer_identity, peer_cert_hash) = match peer_message {
        GossipMessage::ConnEstablish {
            pki_id,
            identity_certificate,
            transport_cert_hash,
        } => (pki_id, identity_certificate, transport_cert_hash),
        _ => return Err(Error::HandshakeWrongType),
    };

    if peer_identity.0.is_empty() {
        return Err(Error::HandshakeMissingPkiId);
    }

    let registered_pki_id = mapper
        .put(&peer_identity)
        .map_err(|e| Error::HandshakeIdentityRejected(e.to_string()))?;
    if registered_pki_id != peer_pki_id {
        return Err(Error::HandshakeIdentityRejected(
            "declared PKI-ID does not match identity certificate's derived PKI-ID".into(),
        ));
    }

    // Verify the envelope's primary signature against the identity it just
    // asserted: proof the peer holds the private key for the identity it
    // claims, independent of whether transport security is active. This is
    // the "envelope signature" of spec.md §4.5 step 6, verified
    // unconditionally rather than gated to the TLS-active branch since it
    // costs nothing and catches a forged ConnEstablish early.
    envelope::verify(&peer_envelope, &peer_pki_id, mapper).map_err(|_| Error::HandshakeSignatureInvalid)?;

    if let Some(expected) = expected_pki_id {
        if expected != peer_pki_id {
            return Err(Error::HandshakePkiMismatch {
                expected,
                actual: peer_pki_id,
            });
        }
    }

    let auth_info = if opts.local_cert_hash.is_some() {
        match peer_cert_hash {
            None if opts.skip_handshake => None,
            None => return Err(Error::HandshakeMissingTransportCert),
            Some(claimed) => {
                let observed = opts
                    .observed_peer_cert_hash
                    .ok_or(Error::HandshakeMissingTransportCert)?;
                if claimed != observed {
                    return Err(Error::HandshakeTransportBindingMismatch);
                }
                envelope::verify_secondary(&peer_envelope, &peer_pki_id, mapper, &observed)
                    .map_err(|_| Error::HandshakeSignatureInvalid)?;
                Some(AuthInfo {
                    signature: peer_envelope
                        .secondary_signature
                        .clone()
                        .expect("checked Some above"),
                    signed_bytes: observed.to_vec(),
                })
            }
        }
    } else {
        None
    };

    tracing::debug!(peer = %peer_pki_id, bound = auth_info.is_some(), "handshake completed");

    Ok(ConnectionInfo {
        pki_id: peer_pki_id,
        peer_identity,
        auth_info,
    })
}
