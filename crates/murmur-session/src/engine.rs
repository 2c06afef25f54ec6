//! Boundary between the session layer and the cryptographic engine.
//!
//! The engine owns key material, per-conversation protocol state and the
//! wire transformation. The session layer only decides what to ask of it
//! and routes the engine's callbacks ([`MessageOps`]) to the application.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use murmur_protocol::types::{FragmentCode, InstanceTag, Policy};
use thiserror::Error;

/// Engine handle shared by a [`UserState`](crate::UserState) and its clients.
pub type SharedEngine<E> = Arc<Mutex<E>>;

pub(crate) fn lock<E>(engine: &SharedEngine<E>) -> Result<MutexGuard<'_, E>, EngineError> {
    engine.lock().map_err(|_| EngineError::Poisoned)
}

/// 20-byte digest identifying a long-term public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; Fingerprint::LEN]);

impl Fingerprint {
    pub const LEN: usize = 20;

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Five groups of eight uppercase hex digits separated by spaces.
    pub fn to_human(&self) -> String {
        let mut out = String::with_capacity(44);
        for (i, chunk) in self.0.chunks(4).enumerate() {
            if i > 0 {
                out.push(' ');
            }
            for byte in chunk {
                out.push_str(&format!("{byte:02X}"));
            }
        }
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_human())
    }
}

/// Errors raised by an engine. Opaque to the session layer; propagated as-is.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("key generation failed for {account} ({protocol}): {reason}")]
    KeyGeneration {
        account: String,
        protocol: String,
        reason: String,
    },

    #[error("contact {contact} not found for account {account}")]
    UnknownContact { account: String, contact: String },

    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine state lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Summary of a private key record held by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub accountname: String,
    pub protocol: String,
    pub fingerprint: Fingerprint,
}

/// One conversation leg as reported by the engine, by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnContext {
    pub accountname: String,
    pub protocol: String,
    pub contactname: String,
    pub our_instance: InstanceTag,
    pub their_instance: InstanceTag,
}

/// Result of one engine send or receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    /// Wire text on send; deliverable plaintext on receive, `None` for
    /// protocol-internal traffic.
    pub message: Option<String>,
    pub context: ConnContext,
}

/// Notifications the engine raises while handling a message. Delivered to
/// the client's `received` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The key exchange completed; the peer proved ownership of this key.
    GoneSecure { their_fingerprint: Fingerprint },
    /// A peer key not seen before in this conversation.
    NewFingerprint(Fingerprint),
    /// Policy refused to send plaintext; a private conversation was requested.
    EncryptionRequired,
    /// The peer ended the private conversation; the message was not sent.
    ConnectionEnded,
    /// The key exchange failed.
    SetupError(String),
    /// A message held back during the key exchange was sent encrypted.
    MessageResent,
    /// Plaintext arrived while a private conversation was expected.
    ReceivedUnencrypted(String),
    /// Encrypted data arrived that could not be decrypted.
    ReceivedUnreadable,
    /// A protocol message failed to parse.
    ReceivedMalformed,
    /// A protocol message addressed to another instance of this account.
    ReceivedForOtherInstance,
    /// The peer reported an error.
    ReceivedError(String),
}

/// Parameters of an outbound message.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    pub account: &'a str,
    pub protocol: &'a str,
    pub contact: &'a str,
    pub text: &'a str,
    pub instance: InstanceTag,
    pub frag_policy: FragmentCode,
}

/// Parameters of an inbound message.
#[derive(Debug, Clone, Copy)]
pub struct InboundMessage<'a> {
    pub account: &'a str,
    pub protocol: &'a str,
    pub contact: &'a str,
    pub text: &'a str,
}

/// Callbacks the engine may invoke while handling a message.
pub trait MessageOps {
    /// Policy for the contact, `None` if the contact is unknown.
    fn policy(&self, account: &str, contact: &str) -> Option<Policy>;

    /// Whether the contact is online, `None` if unknown.
    fn is_logged_in(&self, account: &str, contact: &str) -> Option<bool>;

    /// Deliver protocol output the engine produced itself.
    fn inject_message(&self, account: &str, contact: &str, message: &str);

    /// Largest message the transport carries, `None` for unbounded.
    fn max_message_size(&self) -> Option<usize>;

    fn handle_event(&self, account: &str, contact: &str, event: EngineEvent);
}

/// The cryptographic engine.
pub trait Engine {
    /// Use `path` as the key store that keys generated without an explicit
    /// path are saved to. The file need not exist yet.
    fn set_key_store(&mut self, path: &Path);

    /// Use `path` as the instance-tag store that newly created tags are
    /// saved to. The file need not exist yet.
    fn set_instag_store(&mut self, path: &Path);

    /// Load private keys from a key store file.
    fn read_privkeys(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Load instance tags from an instance-tag file. Later generated tags are
    /// written back to it.
    fn read_instags(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Generate a key for (account, protocol), replacing any existing one.
    /// When `key_store` is given, every key the engine holds is written there.
    fn generate_privkey(
        &mut self,
        account: &str,
        protocol: &str,
        key_store: Option<&Path>,
    ) -> Result<(), EngineError>;

    fn find_privkey(&self, account: &str, protocol: &str) -> Option<KeyInfo>;

    /// Drop one key from memory. Returns false if there was none.
    fn forget_privkey(&mut self, account: &str, protocol: &str) -> bool;

    /// Drop every key from memory.
    fn forget_all(&mut self);

    fn send_message(
        &mut self,
        ops: &dyn MessageOps,
        message: OutboundMessage<'_>,
    ) -> Result<EngineOutput, EngineError>;

    fn receive_message(
        &mut self,
        ops: &dyn MessageOps,
        message: InboundMessage<'_>,
    ) -> Result<EngineOutput, EngineError>;

    /// End the private conversation with one instance of a contact.
    fn end_session(
        &mut self,
        ops: &dyn MessageOps,
        account: &str,
        protocol: &str,
        contact: &str,
        instance: InstanceTag,
    ) -> Result<(), EngineError>;
}
