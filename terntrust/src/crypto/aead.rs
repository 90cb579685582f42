// ChaCha20-Poly1305 (RFC 8439) authenticated encryption for session traffic.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key as CipherKey, Nonce};

use crate::crypto::x25519::SessionKeys;
use crate::error::{Result, TernTrustError};
use crate::handshake::Role;

/// Size of the Poly1305 authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 authenticated encryption with associated data.
#[derive(Clone)]
pub struct AeadCipher {
    cipher: ChaCha20Poly1305,
}

impl AeadCipher {
    /// Create a new AEAD cipher from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(CipherKey::from_slice(key)),
        }
    }

    /// Encrypt `plaintext` with the given 12-byte `nonce` and associated data `aad`.
    ///
    /// Returns ciphertext || 16-byte Poly1305 tag.
    pub fn encrypt(&self, nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        self.cipher
            .encrypt(Nonce::from_slice(nonce), payload)
            .map_err(|e| TernTrustError::Encryption(format!("{e}")))
    }

    /// Decrypt `ciphertext` (which includes the appended 16-byte tag) with the given
    /// 12-byte `nonce` and the same `aad` used during encryption.
    pub fn decrypt(&self, nonce: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(TernTrustError::Decryption(format!(
                "ciphertext of {} bytes is shorter than the tag",
                ciphertext.len()
            )));
        }
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        self.cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|e| TernTrustError::Decryption(format!("{e}")))
    }
}

/// Build a per-packet nonce: the direction IV XOR the big-endian counter
/// in its last eight bytes.
pub fn packet_nonce(iv: &[u8; 12], counter: u64) -> [u8; 12] {
    let mut nonce = *iv;
    for (n, c) in nonce[4..].iter_mut().zip(counter.to_be_bytes()) {
        *n ^= c;
    }
    nonce
}

/// The pair of directional ciphers protecting one connection.
///
/// `seal` uses our write key, `open` uses the remote's write key. Which of
/// the derived keys is "ours" depends on the handshake role.
#[derive(Clone)]
pub struct SessionCipher {
    seal: AeadCipher,
    seal_iv: [u8; 12],
    open: AeadCipher,
    open_iv: [u8; 12],
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}

impl SessionCipher {
    /// Arrange derived session keys for the given local role.
    pub fn new(keys: &SessionKeys, role: Role) -> Self {
        match role {
            Role::Initiator => Self {
                seal: AeadCipher::new(&keys.initiator_write_key),
                seal_iv: keys.initiator_write_iv,
                open: AeadCipher::new(&keys.acceptor_write_key),
                open_iv: keys.acceptor_write_iv,
            },
            Role::Acceptor => Self {
                seal: AeadCipher::new(&keys.acceptor_write_key),
                seal_iv: keys.acceptor_write_iv,
                open: AeadCipher::new(&keys.initiator_write_key),
                open_iv: keys.initiator_write_iv,
            },
        }
    }

    /// Encrypt an outbound packet body under packet counter `counter`.
    pub fn seal(&self, counter: u64, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.seal
            .encrypt(&packet_nonce(&self.seal_iv, counter), plaintext, aad)
    }

    /// Authenticate and decrypt an inbound packet body.
    pub fn open(&self, counter: u64, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.open
            .decrypt(&packet_nonce(&self.open_iv, counter), ciphertext, aad)
    }
}
