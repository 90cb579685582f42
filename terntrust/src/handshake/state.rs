// Handshake state machine.

use crate::crypto::keys::Key;

/// The current state of one side of a key exchange.
#[derive(Debug)]
pub enum HandshakeState {
    /// No key material generated yet.
    Idle,

    /// Our ephemeral key pair exists and the public half has been offered.
    KeySent {
        /// Ephemeral private key, kept until the remote public key arrives.
        private_key: Key,
        /// Ephemeral public key sent to the remote.
        public_key: Key,
    },

    /// Session keys have been derived; the private key is gone.
    Complete {
        /// Our public key, kept so a retransmitted offer can be answered
        /// with the same value.
        public_key: Key,
    },
}

impl HandshakeState {
    /// Human-readable label for the current state (used in error messages).
    pub fn label(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "Idle",
            HandshakeState::KeySent { .. } => "KeySent",
            HandshakeState::Complete { .. } => "Complete",
        }
    }
}
