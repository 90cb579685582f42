// Fixed-size key material and the key agreement capability used by the
// secure handshake.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Result;

/// Length in bytes of every private, public and shared key.
pub const KEY_LEN: usize = 32;

/// 32 bytes of key material. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, which must be exactly [`KEY_LEN`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            crate::error::TernTrustError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a short prefix, enough to correlate public keys in logs.
        write!(
            f,
            "Key({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// An elliptic-curve key agreement scheme.
///
/// Implementations must be deterministic for a given private key, run in
/// constant time and work on fixed-size [`KEY_LEN`] byte values.
pub trait KeyAgreement: Send + Sync {
    /// Generate a fresh random private key.
    fn generate_private_key(&self) -> Key;

    /// Derive the public key matching `private_key`.
    fn create_public_key(&self, private_key: &Key) -> Key;

    /// Combine our private key with the remote public key into a shared key.
    fn create_shared_key(&self, private_key: &Key, remote_public_key: &Key) -> Result<Key>;
}
