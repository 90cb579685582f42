// X25519 Diffie-Hellman key agreement and session key derivation.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::keys::{Key, KeyAgreement};
use crate::error::{Result, TernTrustError};

/// X25519 (Curve25519 ECDH) key agreement.
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519;

impl KeyAgreement for X25519 {
    fn generate_private_key(&self) -> Key {
        let secret = StaticSecret::random_from_rng(OsRng);
        Key::from_bytes(secret.to_bytes())
    }

    fn create_public_key(&self, private_key: &Key) -> Key {
        let secret = StaticSecret::from(*private_key.as_bytes());
        Key::from_bytes(*PublicKey::from(&secret).as_bytes())
    }

    fn create_shared_key(&self, private_key: &Key, remote_public_key: &Key) -> Result<Key> {
        let secret = StaticSecret::from(*private_key.as_bytes());
        let shared = secret.diffie_hellman(&PublicKey::from(*remote_public_key.as_bytes()));
        // A low-order remote point yields an all-zero secret.
        if !shared.was_contributory() {
            return Err(TernTrustError::InvalidKey(
                "remote public key is a low-order point".into(),
            ));
        }
        Ok(Key::from_bytes(*shared.as_bytes()))
    }
}

/// Per-direction keys derived from the shared key via HKDF.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub initiator_write_key: [u8; 32],
    pub acceptor_write_key: [u8; 32],
    pub initiator_write_iv: [u8; 12],
    pub acceptor_write_iv: [u8; 12],
}

/// Derive session keys from a shared key, bound to the connection session id.
///
/// ```text
/// prk                 = HKDF-Extract(salt=0, ikm=shared_key)
/// session_secret      = HKDF-Expand(prk, "tern session", 32)
/// initiator_write_key = HKDF-Expand(session_secret, "initiator write key" || session, 32)
/// acceptor_write_key  = HKDF-Expand(session_secret, "acceptor write key"  || session, 32)
/// initiator_write_iv  = HKDF-Expand(session_secret, "initiator write iv"  || session, 12)
/// acceptor_write_iv   = HKDF-Expand(session_secret, "acceptor write iv"   || session, 12)
/// ```
pub fn derive_session_keys(shared_key: &Key, session: u32) -> Result<SessionKeys> {
    let salt = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_key.as_bytes());

    let mut session_secret = [0u8; 32];
    hk.expand(b"tern session", &mut session_secret)
        .map_err(|e| TernTrustError::KeyDerivation(format!("HKDF expand error: {e}")))?;

    let hk2 = Hkdf::<Sha256>::new(None, &session_secret);
    session_secret.zeroize();

    let expand = |label: &[u8], out: &mut [u8]| -> Result<()> {
        let mut info = Vec::with_capacity(label.len() + 4);
        info.extend_from_slice(label);
        info.extend_from_slice(&session.to_be_bytes());
        hk2.expand(&info, out)
            .map_err(|e| TernTrustError::KeyDerivation(format!("HKDF expand error: {e}")))
    };

    let mut keys = SessionKeys {
        initiator_write_key: [0u8; 32],
        acceptor_write_key: [0u8; 32],
        initiator_write_iv: [0u8; 12],
        acceptor_write_iv: [0u8; 12],
    };
    expand(b"initiator write key", &mut keys.initiator_write_key)?;
    expand(b"acceptor write key", &mut keys.acceptor_write_key)?;
    expand(b"initiator write iv", &mut keys.initiator_write_iv)?;
    expand(b"acceptor write iv", &mut keys.acceptor_write_iv)?;
    Ok(keys)
}
