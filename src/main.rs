//! src/main.rs
//!
//! Binary entry point. Initializes tracing, loads configuration, loads or
//! generates this node's identity and (if configured) transport-security
//! material, starts the `Comm` facade, and runs until interrupted.

use anyhow::Context;
use gossip_comm::config::ListenModeConfig;
use gossip_comm::transport::tls::TlsMaterial;
use gossip_comm::transport::ListenMode;
use gossip_comm::{Comm, CommOptions, Config, LocalIdentity};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;

    let identity = match LocalIdentity::from_file(&config.identity_path) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!(error = %e, "failed to load or generate node identity");
            std::process::exit(1);
        }
    };

    // Fatal-at-startup per spec.md §7: a requested transport-security
    // certificate that can't be loaded or generated aborts the process.
    let tls = match &config.tls {
        Some(tls_config) => match TlsMaterial::load_or_generate(&tls_config.cert_path, &tls_config.key_path) {
            Ok(material) => Some(Arc::new(material)),
            Err(e) => {
                tracing::error!(error = %e, "failed to load or generate transport-security certificate");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let listen = match config.listen {
        ListenModeConfig::Ephemeral => ListenMode::ephemeral(),
        ListenModeConfig::Bind => ListenMode::Bind(config.bind_addr),
        ListenModeConfig::External => {
            tracing::error!("listen = External requires an externally-owned endpoint; not supported from main.rs");
            std::process::exit(1);
        }
    };

    let options = CommOptions {
        dial_timeout: config.dial_timeout(),
        conn_timeout: config.conn_timeout(),
        skip_handshake: config.skip_handshake,
        send_buffer: config.send_buffer,
        recv_buffer: config.recv_buffer,
    };

    let pki_id = identity.pki_id;
    let comm = Comm::start(identity, listen, tls, options)
        .await
        .context("failed to start comm instance")?;

    tracing::info!(
        pki_id = %pki_id,
        addr = %comm.local_addr().context("comm instance has no local address")?,
        "gossip comm node started"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("ctrl-c received; stopping comm instance");
    comm.stop().await;

    Ok(())
}
