//! src/identity.rs
//!
//! The identity mapper: maps a peer's identity certificate to a stable,
//! fixed-length PKI-ID, validates identities admitted to a session, and
//! provides the signing/verification primitives the handshake and envelope
//! codec build on.
//!
//! Per spec.md §1 the identity store's own certificate *validation rules*
//! are an external collaborator; `IdentityMapper` is the seam such a store
//! would plug into. `Ed25519IdentityMapper` is this crate's default,
//! swappable implementation, grounded in the teacher's `domain::Identity`
//! (an ed25519-dalek keypair loaded from or persisted to a file).

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::{fmt, fs, io, path::Path};

/// A peer's opaque identity certificate. For the default ed25519 mapper
/// this is simply the 32-byte verifying key, but the type carries arbitrary
/// bytes so a real certificate-bearing identity store can plug in without
/// changing any other module.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity(pub Vec<u8>);

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", hex::encode(&self.0))
    }
}

/// A short, stable identifier derived from a `PeerIdentity`; the unique key
/// for per-peer state throughout the connection store.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PkiId(pub [u8; 32]);

impl PkiId {
    pub fn from_identity(identity: &PeerIdentity) -> Self {
        let digest = Sha256::digest(&identity.0);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PkiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pki::{}", &hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for PkiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(&self.0[..4]))
    }
}

/// External collaborator interface: validates and stores peer identities
/// admitted during a handshake, and verifies signatures made by them.
pub trait IdentityMapper: Send + Sync {
    /// Validates `identity` and registers it under its derived `PkiId`.
    /// Rejects malformed identities; implementations backed by a real
    /// identity store would also reject identities outside the network's
    /// membership here.
    fn put(&self, identity: &PeerIdentity) -> Result<PkiId>;

    /// Looks up a previously `put` identity.
    fn lookup(&self, pki_id: &PkiId) -> Option<PeerIdentity>;

    /// Verifies that `signature` over `message` was produced by the
    /// identity registered under `pki_id`.
    fn verify(&self, pki_id: &PkiId, message: &[u8], signature: &[u8]) -> Result<()>;
}

/// Default `IdentityMapper`: treats `PeerIdentity` bytes as an ed25519
/// verifying key and rejects anything else.
#[derive(Default)]
pub struct Ed25519IdentityMapper {
    known: Mutex<HashMap<PkiId, PeerIdentity>>,
}

impl Ed25519IdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn verifying_key(identity: &PeerIdentity) -> Result<VerifyingKey> {
        let bytes: [u8; 32] = identity
            .0
            .as_slice()
            .try_into()
            .map_err(|_| Error::HandshakeIdentityRejected("identity is not a 32-byte ed25519 key".into()))?;
        VerifyingKey::from_bytes(&bytes).map_err(Error::Crypto)
    }
}

impl IdentityMapper for Ed25519IdentityMapper {
    fn put(&self, identity: &PeerIdentity) -> Result<PkiId> {
        let _ = Self::verifying_key(identity)?;
        let pki_id = PkiId::from_identity(identity);
        self.known.lock().unwrap().insert(pki_id, identity.clone());
        Ok(pki_id)
    }

    fn lookup(&self, pki_id: &PkiId) -> Option<PeerIdentity> {
        self.known.lock().unwrap().get(pki_id).cloned()
    }

    fn verify(&self, pki_id: &PkiId, message: &[u8], signature: &[u8]) -> Result<()> {
        let identity = self
            .lookup(pki_id)
            .ok_or(Error::NoSuchConnection(*pki_id))?;
        let verifying_key = Self::verifying_key(&identity)?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::HandshakeSignatureInvalid)?;
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify(message, &signature)
            .map_err(|_| Error::HandshakeSignatureInvalid)
    }
}

/// This node's own cryptographic identity: the signing key plus the
/// `PeerIdentity`/`PkiId` derived from it, asserted in every handshake.
pub struct LocalIdentity {
    keypair: SigningKey,
    pub peer_identity: PeerIdentity,
    pub pki_id: PkiId,
}

impl LocalIdentity {
    /// Generates a new, random identity.
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let keypair = SigningKey::generate(&mut csprng);
        Self::from_keypair(keypair)
    }

    /// Loads an identity from a file, or creates and persists a new one if
    /// the file doesn't exist.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        match fs::read(path.as_ref()) {
            Ok(bytes) => {
                let keypair_bytes: [u8; 32] =
                    bytes.try_into().map_err(|_| Error::InvalidKeyFile)?;
                Ok(Self::from_keypair(SigningKey::from_bytes(&keypair_bytes)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate();
                fs::write(path.as_ref(), identity.keypair.to_bytes())?;
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn from_keypair(keypair: SigningKey) -> Self {
        let peer_identity = PeerIdentity(keypair.verifying_key().to_bytes().to_vec());
        let pki_id = PkiId::from_identity(&peer_identity);
        Self {
            keypair,
            peer_identity,
            pki_id,
        }
    }

    /// Signs `message`, returning the detached signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message).to_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sign_and_verify_roundtrip() {
        let identity = LocalIdentity::generate();
        let mapper = Ed25519IdentityMapper::new();
        let pki_id = mapper.put(&identity.peer_identity).unwrap();
        assert_eq!(pki_id, identity.pki_id);

        let message = b"hello gossip";
        let signature = identity.sign(message);
        assert!(mapper.verify(&pki_id, message, &signature).is_ok());
    }

    #[test]
    fn verify_fails_on_tampered_message() {
        let identity = LocalIdentity::generate();
        let mapper = Ed25519IdentityMapper::new();
        let pki_id = mapper.put(&identity.peer_identity).unwrap();

        let signature = identity.sign(b"original");
        assert!(mapper.verify(&pki_id, b"tampered", &signature).is_err());
    }

    #[test]
    fn put_rejects_malformed_identity() {
        let mapper = Ed25519IdentityMapper::new();
        let bogus = PeerIdentity(vec![0u8; 4]);
        assert!(mapper.put(&bogus).is_err());
    }

    #[test]
    fn pki_id_is_stable_digest_of_identity() {
        let identity = LocalIdentity::generate();
        let a = PkiId::from_identity(&identity.peer_identity);
        let b = PkiId::from_identity(&identity.peer_identity);
        assert_eq!(a, b);
    }

    #[test]
    fn identity_from_file_persists_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");
        assert!(!path.exists());
        let identity = LocalIdentity::from_file(&path).unwrap();
        assert!(path.exists());
        let reloaded = LocalIdentity::from_file(&path).unwrap();
        assert_eq!(identity.pki_id, reloaded.pki_id);
    }
}
