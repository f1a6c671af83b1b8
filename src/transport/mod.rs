//! src/transport/mod.rs
//!
//! The QUIC endpoint: dials outbound peers and accepts inbound connections,
//! opening exactly one long-lived bidirectional stream per peer (spec.md
//! §4.3's single-stream `Connection` model), generalized from the
//! teacher's `Transport` actor which opened one short-lived unidirectional
//! stream per message.

use crate::error::{Error, Result};
use crate::transport::tls::TlsMaterial;
use quinn::{Connecting, Endpoint, RecvStream, SendStream, TokioRuntime};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub mod tls;

/// How the server side of a `Comm` instance binds its listening port
/// (spec.md §6). A `bind_addr` with port 0 binds an OS-assigned ephemeral
/// port.
#[derive(Clone, Debug)]
pub enum ListenMode {
    Bind(SocketAddr),
    /// No server: attach to an externally-owned endpoint (e.g. in tests
    /// that share one `Endpoint` across simulated nodes).
    External(Endpoint),
}

impl ListenMode {
    pub fn ephemeral() -> Self {
        Self::Bind(SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0))
    }
}

/// Default timeout for establishing the QUIC transport connection before
/// the handshake even begins (spec.md §5, §6).
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Thin wrapper over a `quinn::Endpoint` plus this node's TLS material.
pub struct Transport {
    endpoint: Endpoint,
    pub tls: Option<Arc<TlsMaterial>>,
}

impl Transport {
    /// Builds a transport bound per `mode`, configured for mutual TLS when
    /// `tls` is `Some` (spec.md §6).
    pub fn new(mode: ListenMode, tls: Option<Arc<TlsMaterial>>) -> Result<Self> {
        let endpoint = match mode {
            ListenMode::External(endpoint) => endpoint,
            ListenMode::Bind(bind_addr) => Self::bind_endpoint(bind_addr, tls.as_deref())?,
        };
        Ok(Self { endpoint, tls })
    }

    fn bind_endpoint(bind_addr: SocketAddr, tls: Option<&TlsMaterial>) -> Result<Endpoint> {
        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        std_socket.set_nonblocking(true)?;

        let server_config = match tls {
            Some(material) => Some(self::tls::build_server_config(material)?),
            None => None,
        };

        let mut endpoint = Endpoint::new(Default::default(), server_config, std_socket, Arc::new(TokioRuntime))?;
        if let Some(material) = tls {
            endpoint.set_default_client_config(self::tls::build_client_config(material)?);
        }
        Ok(endpoint)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Dials `addr` and opens the single bidirectional stream the
    /// connection store's handshake uses, within `timeout`.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<(SendStream, RecvStream, Option<[u8; 32]>)> {
        let connecting: Connecting = self
            .endpoint
            .connect(addr, "localhost")
            .map_err(|e| Error::DialFailed(addr, e))?;

        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| Error::DialFailedGeneric(format!("dial to {addr} timed out")))?
            .map_err(|e| Error::ConnectionEstablishFailed(addr, e))?;

        let observed_hash = self::tls::observed_peer_cert_hash(&connection);
        let (send, recv) = connection.open_bi().await?;
        Ok((send, recv, observed_hash))
    }

    /// Awaits the next inbound connection and opens its single bidirectional
    /// stream, returning the observed peer certificate hash alongside it.
    pub async fn accept(&self) -> Result<Option<(SendStream, RecvStream, Option<[u8; 32]>, SocketAddr)>> {
        let Some(connecting) = self.endpoint.accept().await else {
            return Ok(None);
        };
        let connection = connecting.await?;
        let remote = connection.remote_address();
        let observed_hash = self::tls::observed_peer_cert_hash(&connection);
        let (send, recv) = connection.accept_bi().await?;
        Ok(Some((send, recv, observed_hash, remote)))
    }

    pub async fn close(&self) {
        self.endpoint.close(0u32.into(), b"comm stopping");
        self.endpoint.wait_idle().await;
    }
}
