// TernTrust - key agreement and session encryption for TernStream
//
// Crate root: module declarations and public re-exports.

pub mod error;
pub mod crypto;
pub mod handshake;

// Re-export key types at crate root for convenience.
pub use crypto::aead::{AeadCipher, SessionCipher};
pub use crypto::keys::{Key, KeyAgreement, KEY_LEN};
pub use crypto::x25519::X25519;
pub use error::{Result, TernTrustError};
pub use handshake::{Handshake, Role};
