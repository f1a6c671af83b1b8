//! src/envelope.rs
//!
//! The on-wire envelope: a signed, opaque payload. One variant of the
//! decoded payload, `ConnEstablish`, is the first message exchanged on
//! every new stream (spec.md §4.1, §6).

use crate::error::{Error, Result};
use crate::identity::{IdentityMapper, LocalIdentity, PeerIdentity, PkiId};
use serde::{Deserialize, Serialize};

/// A signed unit on the wire: an opaque `payload`, a detached `signature`
/// over that payload, and an optional `secondary_signature` over the
/// sender's transport-certificate hash (spec.md §4.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
    pub secondary_signature: Option<Vec<u8>>,
}

/// The decoded form of an envelope's payload. `ConnEstablish` is the only
/// tag the handshake engine understands; everything else is opaque gossip
/// traffic this core neither interprets nor validates beyond the envelope
/// signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GossipMessage {
    ConnEstablish {
        pki_id: PkiId,
        identity_certificate: PeerIdentity,
        transport_cert_hash: Option<[u8; 32]>,
    },
    /// A harmless, session-less liveness check used by `Comm::probe`.
    Ping,
    /// Opaque gossip-protocol traffic, outside this core's scope.
    Payload(Vec<u8>),
}

/// Serializes `message` into the bytes an `Envelope::payload` carries.
pub fn encode_message(message: &GossipMessage) -> Result<Vec<u8>> {
    bincode::serialize(message).map_err(Error::Serialization)
}

/// Parses an `Envelope::payload` back into a typed `GossipMessage`.
pub fn decode_message(payload: &[u8]) -> Result<GossipMessage> {
    bincode::deserialize(payload).map_err(Error::Serialization)
}

/// Serializes an envelope for sending over a framed stream.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    bincode::serialize(envelope).map_err(Error::Serialization)
}

/// Parses a received frame into an `Envelope`.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    bincode::deserialize(bytes).map_err(Error::Serialization)
}

/// Signs `message`, producing a complete envelope. When `transport_cert_hash`
/// is `Some`, the resulting envelope also carries a secondary signature over
/// that hash, letting any message on an authenticated connection
/// independently reassert the identity-to-session binding (not just the
/// initial `ConnEstablish`). When transport security is inactive, call this
/// with `transport_cert_hash: None`: the signature still covers the
/// payload, but no binding claim is made (spec.md §9 — "do not fabricate a
/// signature" means never synthesizing a secondary signature without an
/// observed transport certificate).
pub fn sign(
    message: &GossipMessage,
    local: &LocalIdentity,
    transport_cert_hash: Option<&[u8; 32]>,
) -> Result<Envelope> {
    let payload = encode_message(message)?;
    let signature = local.sign(&payload);
    let secondary_signature = transport_cert_hash.map(|hash| local.sign(hash));
    Ok(Envelope {
        payload,
        signature,
        secondary_signature,
    })
}

/// Verifies that `envelope.signature` was produced by the identity
/// registered under `pki_id`, then decodes its payload.
pub fn verify(envelope: &Envelope, pki_id: &PkiId, mapper: &dyn IdentityMapper) -> Result<GossipMessage> {
    mapper.verify(pki_id, &envelope.payload, &envelope.signature)?;
    decode_message(&envelope.payload)
}

/// Verifies the secondary signature against an independently observed
/// transport-certificate hash, failing if the envelope carries none.
pub fn verify_secondary(
    envelope: &Envelope,
    pki_id: &PkiId,
    mapper: &dyn IdentityMapper,
    observed_hash: &[u8; 32],
) -> Result<()> {
    let secondary = envelope
        .secondary_signature
        .as_ref()
        .ok_or(Error::HandshakeMissingTransportCert)?;
    mapper.verify(pki_id, observed_hash, secondary)
}
