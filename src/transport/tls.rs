//! src/transport/tls.rs
//!
//! Configures mutual TLS for QUIC using self-signed, per-node certificates
//! (spec.md §6). There is deliberately no shared certificate authority:
//! certificate *validation* belongs to the external identity store
//! (spec.md §1), so the transport layer here accepts any presented
//! certificate and merely records its hash. The handshake engine
//! (`crate::handshake`) is what actually binds a connection to a verified
//! application identity, by comparing this observed hash against the one
//! the peer claims in its signed `ConnEstablish`.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::SystemTime;
use std::{fs, path::Path};

/// A node's TLS leaf certificate and private key, plus the hash other peers
/// will observe when they terminate a connection to/from this node.
pub struct TlsMaterial {
    pub cert_der: Vec<u8>,
    key_der: Vec<u8>,
    pub cert_hash: [u8; 32],
}

impl TlsMaterial {
    fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        let cert_hash = hash_cert(&cert_der);
        Self {
            cert_der,
            key_der,
            cert_hash,
        }
    }

    /// Loads a certificate/key pair from disk, generating and persisting a
    /// fresh self-signed pair if either file is missing. This is the one
    /// fatal-at-startup path in the core (spec.md §7): a malformed existing
    /// file, or a generation failure, aborts the process rather than
    /// running without transport security silently misconfigured.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
        match (fs::read(cert_path), fs::read(key_path)) {
            (Ok(cert_der), Ok(key_der)) => {
                if cert_der.is_empty() {
                    return Err(Error::TlsConfig(
                        "certificate chain present but empty".into(),
                    ));
                }
                Ok(Self::from_der(cert_der, key_der))
            }
            (Err(e), _) | (_, Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let generated = Self::generate_self_signed()?;
                if let Some(parent) = cert_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(cert_path, &generated.cert_der)?;
                fs::write(key_path, &generated.key_der)?;
                Ok(generated)
            }
            (Err(e), _) => Err(Error::TlsConfig(format!(
                "failed to load transport certificate: {e}"
            ))),
            (_, Err(e)) => Err(Error::TlsConfig(format!(
                "failed to load transport key: {e}"
            ))),
        }
    }

    /// Generates a fresh, ephemeral self-signed certificate. Used for
    /// externally-owned-server attachment and in tests.
    pub fn generate_self_signed() -> Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| Error::TlsConfig(format!("failed to generate self-signed certificate: {e}")))?;
        let cert_der = cert.serialize_der().map_err(|e| {
            Error::TlsConfig(format!("failed to serialize generated certificate: {e}"))
        })?;
        let key_der = cert.serialize_private_key_der();
        Ok(Self::from_der(cert_der, key_der))
    }
}

fn hash_cert(cert_der: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(cert_der);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Accepts any server certificate chain without validating it against a
/// root of trust; this transport's authenticity guarantees come from the
/// application-layer handshake, not from PKI chain validation.
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Requires the client to present a certificate (mutual TLS) but, like
/// `AcceptAnyServerCert`, does not validate it against a root of trust.
struct AcceptAnyClientCert;

impl rustls::server::ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn client_auth_root_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _now: SystemTime,
    ) -> std::result::Result<rustls::server::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::ClientCertVerified::assertion())
    }
}

/// Builds the quinn client configuration used to dial peers.
pub fn build_client_config(material: &TlsMaterial) -> Result<quinn::ClientConfig> {
    let cert_chain = vec![rustls::Certificate(material.cert_der.clone())];
    let key = rustls::PrivateKey(material.key_der.clone());

    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsConfig(format!("invalid client certificate: {e}")))?;

    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

/// Builds the quinn server configuration used to accept peers, requiring
/// mutual TLS.
pub fn build_server_config(material: &TlsMaterial) -> Result<quinn::ServerConfig> {
    let cert_chain = vec![rustls::Certificate(material.cert_der.clone())];
    let key = rustls::PrivateKey(material.key_der.clone());

    let crypto = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsConfig(format!("invalid server certificate: {e}")))?;

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let transport_config = Arc::get_mut(&mut server_config.transport).unwrap();
    transport_config.keep_alive_interval(Some(std::time::Duration::from_secs(10)));

    Ok(server_config)
}

/// Extracts the leaf certificate hash quinn's rustls backend observed from
/// the remote peer on an established connection — the "observed" half of
/// the claimed-vs-observed comparison the handshake engine performs
/// (spec.md §6).
pub fn observed_peer_cert_hash(connection: &quinn::Connection) -> Option<[u8; 32]> {
    let identity = connection.peer_identity()?;
    let certs = identity.downcast::<Vec<rustls::Certificate>>().ok()?;
    let leaf = certs.first()?;
    Some(hash_cert(&leaf.0))
}
