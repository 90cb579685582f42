//! Connection modes and the key-exchange glue used by secure connections.
//!
//! ```text
//!   Initiator                                   Acceptor
//!   initiate()      -- Connect(public key) -->
//!                                               accept(initiator key)
//!                   <-- Accept(public key) --
//!   complete(acceptor key)
//!                   --   Confirm (sealed)   -->  authenticated => Connected
//! ```

use bitflags::bitflags;
use terntrust::{Handshake, Key, KeyAgreement, Role, SessionCipher};

use crate::error::{Result, TernStreamError};

bitflags! {
    /// Connection modes a host accepts from initiators.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnectionTypes: u8 {
        const INSECURE = 0b01;
        const SECURE = 0b10;
        const ALL = Self::INSECURE.bits() | Self::SECURE.bits();
    }
}

impl ConnectionTypes {
    pub fn accepts(self, mode: ConnectionMode) -> bool {
        self.contains(mode.into())
    }
}

impl Default for ConnectionTypes {
    fn default() -> Self {
        ConnectionTypes::ALL
    }
}

/// How a single connection is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionMode {
    /// Frames travel in the clear behind a CRC32.
    Insecure = 0x00,
    /// Frames are sealed with per-direction ChaCha20-Poly1305 keys.
    Secure = 0x01,
}

impl ConnectionMode {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(ConnectionMode::Insecure),
            0x01 => Ok(ConnectionMode::Secure),
            other => Err(TernStreamError::InvalidConnectionMode(other)),
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, ConnectionMode::Secure)
    }
}

impl From<ConnectionMode> for ConnectionTypes {
    fn from(mode: ConnectionMode) -> Self {
        match mode {
            ConnectionMode::Insecure => ConnectionTypes::INSECURE,
            ConnectionMode::Secure => ConnectionTypes::SECURE,
        }
    }
}

/// The initiator's half-finished exchange, held until the Accept arrives.
#[derive(Debug)]
pub struct KeyExchange {
    handshake: Handshake,
}

impl KeyExchange {
    /// Start the initiator's side. Returns the public key to put in the
    /// Connect packet.
    pub fn initiate(agreement: &dyn KeyAgreement, identity: Option<&Key>) -> Result<(Self, Key)> {
        let mut handshake = Handshake::new(Role::Initiator);
        let public_key = start(&mut handshake, agreement, identity)?;
        Ok((Self { handshake }, public_key))
    }

    /// Acceptor side in one step: combine our key with the initiator's and
    /// derive the session. Returns the public key for the Accept packet.
    pub fn accept(
        agreement: &dyn KeyAgreement,
        identity: Option<&Key>,
        remote_public_key: &Key,
        session: u32,
    ) -> Result<(Key, SecureSession)> {
        let mut handshake = Handshake::new(Role::Acceptor);
        let public_key = start(&mut handshake, agreement, identity)?;
        let cipher = handshake.finish(agreement, remote_public_key, session)?;
        Ok((public_key, SecureSession::new(cipher)))
    }

    /// Finish the initiator side with the acceptor's public key.
    pub fn complete(
        mut self,
        agreement: &dyn KeyAgreement,
        remote_public_key: &Key,
        session: u32,
    ) -> Result<SecureSession> {
        let cipher = self.handshake.finish(agreement, remote_public_key, session)?;
        Ok(SecureSession::new(cipher))
    }
}

/// Use the host's long-lived `identity` when it has one, a fresh ephemeral
/// key otherwise.
fn start(handshake: &mut Handshake, agreement: &dyn KeyAgreement, identity: Option<&Key>) -> Result<Key> {
    Ok(match identity {
        Some(private_key) => handshake.start_with(agreement, private_key.clone())?,
        None => handshake.start(agreement)?,
    })
}

/// Counters a receiver still remembers below the highest one accepted.
pub const REPLAY_WINDOW: u64 = 64;

/// Sliding record of accepted packet counters.
#[derive(Debug, Default, Clone, Copy)]
struct ReplayWindow {
    /// One past the highest counter accepted.
    top: u64,
    /// Bit `i` is set when counter `top - 1 - i` was accepted.
    seen: u64,
}

impl ReplayWindow {
    fn admits(&self, counter: u64) -> bool {
        if counter >= self.top {
            return true;
        }
        let age = self.top - 1 - counter;
        age < REPLAY_WINDOW && self.seen & (1u64 << age) == 0
    }

    fn record(&mut self, counter: u64) {
        if counter >= self.top {
            let shift = counter - self.top + 1;
            self.seen = if shift >= REPLAY_WINDOW { 0 } else { self.seen << shift };
            self.seen |= 1;
            self.top = counter.saturating_add(1);
        } else {
            self.seen |= 1u64 << (self.top - 1 - counter);
        }
    }
}

/// Established packet protection for one connection.
pub struct SecureSession {
    cipher: SessionCipher,
    next_counter: u64,
    received: ReplayWindow,
}

impl SecureSession {
    fn new(cipher: SessionCipher) -> Self {
        Self {
            cipher,
            next_counter: 0,
            received: ReplayWindow::default(),
        }
    }

    /// Seal `plaintext` under a fresh packet counter.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(u64, Vec<u8>)> {
        let counter = self.next_counter;
        let sealed = self.cipher.seal(counter, plaintext, aad)?;
        self.next_counter += 1;
        Ok((counter, sealed))
    }

    /// Authenticate and decrypt a packet. Each counter opens at most once,
    /// and counters more than [`REPLAY_WINDOW`] behind the highest seen
    /// are refused.
    pub fn open(&mut self, counter: u64, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if !self.received.admits(counter) {
            return Err(TernStreamError::Replayed(counter));
        }
        let plaintext = self.cipher.open(counter, ciphertext, aad)?;
        self.received.record(counter);
        Ok(plaintext)
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("next_counter", &self.next_counter)
            .field("highest_received", &self.received.top.checked_sub(1))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terntrust::X25519;

    #[test]
    fn types_accept_modes() {
        assert!(ConnectionTypes::ALL.accepts(ConnectionMode::Secure));
        assert!(ConnectionTypes::INSECURE.accepts(ConnectionMode::Insecure));
        assert!(!ConnectionTypes::INSECURE.accepts(ConnectionMode::Secure));
        assert!(!ConnectionTypes::SECURE.accepts(ConnectionMode::Insecure));
    }

    #[test]
    fn mode_from_u8() {
        assert_eq!(ConnectionMode::from_u8(1).unwrap(), ConnectionMode::Secure);
        assert!(matches!(
            ConnectionMode::from_u8(7),
            Err(TernStreamError::InvalidConnectionMode(7))
        ));
    }

    #[test]
    fn both_sides_agree_on_session() {
        let (exchange, initiator_key) = KeyExchange::initiate(&X25519, None).unwrap();
        let (acceptor_key, mut acceptor) =
            KeyExchange::accept(&X25519, None, &initiator_key, 0xfeed).unwrap();
        let mut initiator = exchange.complete(&X25519, &acceptor_key, 0xfeed).unwrap();

        let (counter, sealed) = initiator.seal(b"confirm", b"aad").unwrap();
        assert_eq!(counter, 0);
        assert_eq!(acceptor.open(counter, &sealed, b"aad").unwrap(), b"confirm");

        let (counter, sealed) = acceptor.seal(b"data", b"aad").unwrap();
        assert_eq!(initiator.open(counter, &sealed, b"aad").unwrap(), b"data");
        assert!(initiator.open(counter + 1, &sealed, b"aad").is_err());
        assert_eq!(initiator.seal(b"next", b"aad").unwrap().0, 1);
    }

    #[test]
    fn mismatched_session_fails_authentication() {
        let (exchange, initiator_key) = KeyExchange::initiate(&X25519, None).unwrap();
        let (acceptor_key, mut acceptor) = KeyExchange::accept(&X25519, None, &initiator_key, 1).unwrap();
        let mut initiator = exchange.complete(&X25519, &acceptor_key, 2).unwrap();
        let (counter, sealed) = initiator.seal(b"x", b"").unwrap();
        assert!(acceptor.open(counter, &sealed, b"").is_err());
    }

    #[test]
    fn identity_key_is_offered_as_is() {
        let identity = X25519.generate_private_key();
        let (exchange, initiator_key) = KeyExchange::initiate(&X25519, None).unwrap();
        let (acceptor_key, mut acceptor) =
            KeyExchange::accept(&X25519, Some(&identity), &initiator_key, 3).unwrap();
        assert_eq!(acceptor_key, X25519.create_public_key(&identity));

        let mut initiator = exchange.complete(&X25519, &acceptor_key, 3).unwrap();
        let (counter, sealed) = initiator.seal(b"hi", b"").unwrap();
        assert_eq!(acceptor.open(counter, &sealed, b"").unwrap(), b"hi");
    }

    fn pair() -> (SecureSession, SecureSession) {
        let (exchange, initiator_key) = KeyExchange::initiate(&X25519, None).unwrap();
        let (acceptor_key, acceptor) = KeyExchange::accept(&X25519, None, &initiator_key, 9).unwrap();
        let initiator = exchange.complete(&X25519, &acceptor_key, 9).unwrap();
        (initiator, acceptor)
    }

    #[test]
    fn replayed_packet_is_refused() {
        let (mut initiator, mut acceptor) = pair();
        let (counter, sealed) = initiator.seal(b"once", b"").unwrap();
        assert_eq!(acceptor.open(counter, &sealed, b"").unwrap(), b"once");
        assert!(matches!(
            acceptor.open(counter, &sealed, b""),
            Err(TernStreamError::Replayed(0))
        ));
    }

    #[test]
    fn reordered_packets_inside_the_window_open() {
        let (mut initiator, mut acceptor) = pair();
        let sealed: Vec<_> = (0..4).map(|_| initiator.seal(b"x", b"").unwrap()).collect();
        for (counter, ciphertext) in sealed.iter().rev() {
            assert!(acceptor.open(*counter, ciphertext, b"").is_ok());
        }
        for (counter, ciphertext) in &sealed {
            assert!(acceptor.open(*counter, ciphertext, b"").is_err());
        }
    }

    #[test]
    fn packets_behind_the_window_are_refused() {
        let (mut initiator, mut acceptor) = pair();
        let (old, old_sealed) = initiator.seal(b"late", b"").unwrap();
        let mut latest = None;
        for _ in 0..REPLAY_WINDOW {
            latest = Some(initiator.seal(b"x", b"").unwrap());
        }
        let (counter, sealed) = latest.unwrap();
        assert_eq!(counter, REPLAY_WINDOW);
        acceptor.open(counter, &sealed, b"").unwrap();
        assert!(matches!(
            acceptor.open(old, &old_sealed, b""),
            Err(TernStreamError::Replayed(0))
        ));
    }

    #[test]
    fn failed_authentication_leaves_the_counter_usable() {
        let (mut initiator, mut acceptor) = pair();
        let (counter, sealed) = initiator.seal(b"real", b"").unwrap();
        let mut forged = sealed.clone();
        forged[0] ^= 1;
        assert!(acceptor.open(counter, &forged, b"").is_err());
        assert_eq!(acceptor.open(counter, &sealed, b"").unwrap(), b"real");
    }
}
