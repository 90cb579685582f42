// TernTrust error types

use thiserror::Error;

/// Top-level error type for the TernTrust crate.
#[derive(Debug, Error)]
pub enum TernTrustError {
    // ── Crypto errors ───────────────────────────────────────────────────
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("AEAD encryption failed: {0}")]
    Encryption(String),

    #[error("AEAD decryption failed: {0}")]
    Decryption(String),

    // ── Handshake errors ────────────────────────────────────────────────
    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("invalid handshake state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, TernTrustError>;
