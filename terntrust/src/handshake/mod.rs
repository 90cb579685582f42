// Ephemeral key exchange for one connection.
//
// Initiator                                Acceptor
//   start()        -- public key -->
//                                           start()
//                                           finish(initiator public)
//                  <-- public key --
//   finish(acceptor public)
//
// Both sides end with a SessionCipher keyed from the same shared key and
// bound to the connection's session id.

pub mod state;

use std::mem;

pub use state::HandshakeState;

use crate::crypto::aead::SessionCipher;
use crate::crypto::keys::{Key, KeyAgreement};
use crate::crypto::x25519::derive_session_keys;
use crate::error::{Result, TernTrustError};

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that sent the connection request.
    Initiator,
    /// The side that accepted it.
    Acceptor,
}

/// One side of an ephemeral key exchange.
#[derive(Debug)]
pub struct Handshake {
    role: Role,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Our public key, once generated.
    pub fn public_key(&self) -> Option<&Key> {
        match &self.state {
            HandshakeState::KeySent { public_key, .. } | HandshakeState::Complete { public_key } => {
                Some(public_key)
            }
            HandshakeState::Idle => None,
        }
    }

    /// Generate the ephemeral key pair and return the public key to send.
    pub fn start(&mut self, agreement: &dyn KeyAgreement) -> Result<Key> {
        self.start_with(agreement, agreement.generate_private_key())
    }

    /// Like [`Handshake::start`], but with a long-lived private key the
    /// remote may already know the public half of.
    pub fn start_with(&mut self, agreement: &dyn KeyAgreement, private_key: Key) -> Result<Key> {
        if !matches!(self.state, HandshakeState::Idle) {
            return Err(self.invalid_transition("KeySent"));
        }
        let public_key = agreement.create_public_key(&private_key);
        self.state = HandshakeState::KeySent {
            private_key,
            public_key: public_key.clone(),
        };
        Ok(public_key)
    }

    /// Combine our private key with the remote public key and derive the
    /// session cipher for `session`.
    pub fn finish(
        &mut self,
        agreement: &dyn KeyAgreement,
        remote_public_key: &Key,
        session: u32,
    ) -> Result<SessionCipher> {
        let (private_key, public_key) = match mem::replace(&mut self.state, HandshakeState::Idle) {
            HandshakeState::KeySent {
                private_key,
                public_key,
            } => (private_key, public_key),
            other => {
                let from = other.label();
                self.state = other;
                return Err(TernTrustError::InvalidStateTransition {
                    from: from.into(),
                    to: "Complete".into(),
                });
            }
        };

        let shared = match agreement.create_shared_key(&private_key, remote_public_key) {
            Ok(shared) => shared,
            Err(e) => {
                self.state = HandshakeState::KeySent {
                    private_key,
                    public_key,
                };
                return Err(e);
            }
        };
        let keys = derive_session_keys(&shared, session)?;
        self.state = HandshakeState::Complete { public_key };
        Ok(SessionCipher::new(&keys, self.role))
    }

    fn invalid_transition(&self, to: &str) -> TernTrustError {
        TernTrustError::InvalidStateTransition {
            from: self.state.label().into(),
            to: to.into(),
        }
    }
}
