use serde::{Deserialize, Serialize};

use crate::types::*;

/// A binary protocol message, carried on the wire as `?OTR:<base64>.`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub sender_instance: InstanceTag,
    /// Zero when the sender does not know the receiver's instance yet.
    pub receiver_instance: InstanceTag,
    pub body: Body,
}

impl Envelope {
    pub fn new(sender_instance: InstanceTag, receiver_instance: InstanceTag, body: Body) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender_instance,
            receiver_instance,
            body,
        }
    }
}

/// Body of an encoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    // ── Authenticated key exchange ─────────────────────────────────────

    /// Initiator's ephemeral X25519 public value.
    DhCommit { public: Vec<u8> },

    /// Responder's ephemeral X25519 public value.
    DhKey { public: Vec<u8> },

    /// Initiator's [`IdentityProof`], sealed under the exchange key.
    RevealSignature { sealed: Vec<u8> },

    /// Responder's [`IdentityProof`], sealed under the exchange key.
    Signature { sealed: Vec<u8> },

    // ── Conversation ──────────────────────────────────────────────────

    /// A sealed [`DataPayload`]. `counter` strictly increases per direction.
    Data { counter: u64, ciphertext: Vec<u8> },
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DhCommit { .. } => "dh-commit",
            Self::DhKey { .. } => "dh-key",
            Self::RevealSignature { .. } => "reveal-signature",
            Self::Signature { .. } => "signature",
            Self::Data { .. } => "data",
        }
    }
}

/// Long-term identity public key plus its signature over the exchange transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProof {
    /// 32-byte Ed25519 public key.
    pub public_key: Vec<u8>,
    /// 64-byte Ed25519 signature.
    pub signature: Vec<u8>,
}

/// Plaintext of a data message before sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    pub text: String,
    /// Set when the sender is ending the private conversation.
    #[serde(default)]
    pub end_session: bool,
}
