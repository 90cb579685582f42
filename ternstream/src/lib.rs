//! TernStream -- low-latency multi-channel transport over UDP.
//!
//! A [`Host`] owns one socket and any number of [`Peer`]s. Each peer carries
//! up to 255 channels, and every channel offers three delivery modes with
//! independent ordinal spaces:
//! - **Unreliable**: fire-and-forget, delivered as it arrives
//! - **Semireliable**: ordered, retransmitted while the sender still holds it
//! - **Reliable**: ordered, exactly-once, or the connection times out
//!
//! Connections are optionally encrypted with X25519 key agreement and
//! ChaCha20-Poly1305 (see `terntrust`).

pub mod channel;
pub mod congestion;
pub mod error;
pub mod event;
pub mod flow_control;
pub mod frame;
pub mod handshake;
pub mod host;
pub mod interceptor;
pub mod memory;
pub mod ordinal;
pub mod packet;
pub mod peer;
pub mod rtt;
pub mod settings;
pub mod socket;
pub mod transport;
pub mod tree;

mod connection;

// Re-export key public types at crate root.
pub use error::{ErrorKind, Result, TernStreamError};
pub use event::Event;
pub use handshake::{ConnectionMode, ConnectionTypes};
pub use host::Host;
pub use interceptor::Interceptor;
pub use memory::{BlockHandle, MemoryPool};
pub use ordinal::Ordinal;
pub use peer::{Peer, PeerReason, PeerState, PeerStats};
pub use settings::{Settings, StreamSettings};
pub use terntrust::{Key, KeyAgreement, X25519};
pub use transport::Delivery;
pub use tree::Tree;
