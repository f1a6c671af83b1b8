//! src/lib.rs
//!
//! Library root for the gossip overlay's peer-to-peer communication core:
//! endpoint dialing, inbound stream acceptance, per-peer connection
//! deduplication, the identity-binding handshake, and subscription-based
//! message fan-out (spec.md §1). Declares the module hierarchy and
//! re-exports the public API.

pub mod comm;
pub mod config;
pub mod connection;
pub mod demux;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod store;
pub mod transport;

pub use comm::{Comm, CommOptions, RemotePeer, Subscriber};
pub use config::Config;
pub use envelope::GossipMessage;
pub use error::Error;
pub use identity::{LocalIdentity, PeerIdentity, PkiId};
