//! The concrete engine: key stores, per-contact conversations and the
//! send/receive state machine over the murmur wire format.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use murmur_protocol::codec::{
    add_whitespace_tag, encode_envelope, error_message, query_message, Incoming,
};
use murmur_protocol::fragment;
use murmur_protocol::types::{
    FragmentCode, InstanceTag, Policy, FRAGMENT_SEND_ALL, FRAGMENT_SEND_ALL_BUT_FIRST,
    FRAGMENT_SEND_ALL_BUT_LAST, INSTAG_MASTER, MIN_VALID_INSTAG,
};
use murmur_protocol::{classify, Body, DataPayload, Envelope};
use murmur_session::{
    ConnContext, Engine, EngineError, EngineEvent, EngineOutput, InboundMessage, KeyInfo,
    MessageOps, OutboundMessage,
};
use ring::rand::SystemRandom;
use tracing::{debug, info, warn};

use crate::conversation::{Conversation, Offer};
use crate::identity::IdentityKey;
use crate::session::AkeStep;
use crate::stores::{InstagStore, KeyStore};

type ConversationKey = (String, String, String);

/// Account, protocol and contact of the message being handled, plus the
/// callbacks to reach the application with.
struct Call<'a> {
    ops: &'a dyn MessageOps,
    account: &'a str,
    protocol: &'a str,
    contact: &'a str,
}

impl Call<'_> {
    fn policy(&self) -> Policy {
        self.ops.policy(self.account, self.contact).unwrap_or_default()
    }

    fn inject(&self, message: &str) {
        self.ops.inject_message(self.account, self.contact, message);
    }

    fn event(&self, event: EngineEvent) {
        self.ops.handle_event(self.account, self.contact, event);
    }

    /// Encode a protocol message and inject it, fragmenting as needed.
    fn inject_envelope(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let wire = encode_envelope(envelope)?;
        self.deliver(
            wire,
            FRAGMENT_SEND_ALL,
            envelope.sender_instance,
            envelope.receiver_instance,
        )?;
        Ok(())
    }

    /// Hand `wire` to the transport according to `code`. Whatever is not
    /// injected here is returned for the caller to send.
    fn deliver(
        &self,
        wire: String,
        code: FragmentCode,
        our_instance: InstanceTag,
        their_instance: InstanceTag,
    ) -> anyhow::Result<Option<String>> {
        let fragmenting = matches!(
            code,
            FRAGMENT_SEND_ALL | FRAGMENT_SEND_ALL_BUT_FIRST | FRAGMENT_SEND_ALL_BUT_LAST
        );
        if !fragmenting {
            return Ok(Some(wire));
        }
        let mut pieces = match self.ops.max_message_size() {
            Some(max) => fragment::split(&wire, max, our_instance, their_instance)?,
            None => vec![wire],
        };

        match code {
            FRAGMENT_SEND_ALL => {
                for piece in &pieces {
                    self.inject(piece);
                }
                Ok(None)
            }
            FRAGMENT_SEND_ALL_BUT_FIRST => {
                let first = pieces.remove(0);
                for piece in &pieces {
                    self.inject(piece);
                }
                Ok(Some(first))
            }
            _ => {
                let last = pieces.pop();
                for piece in &pieces {
                    self.inject(piece);
                }
                Ok(last)
            }
        }
    }

    fn context(&self, our_instance: InstanceTag, their_instance: InstanceTag) -> ConnContext {
        ConnContext {
            accountname: self.account.to_string(),
            protocol: self.protocol.to_string(),
            contactname: self.contact.to_string(),
            our_instance,
            their_instance,
        }
    }

    fn key(&self) -> ConversationKey {
        (
            self.account.to_string(),
            self.protocol.to_string(),
            self.contact.to_string(),
        )
    }
}

/// Engine over Ed25519 identities, X25519 key exchange and AES-256-GCM.
pub struct MurmurEngine {
    rng: SystemRandom,
    keys: KeyStore,
    instags: InstagStore,
    /// Where keys generated without an explicit path are saved.
    key_store_path: Option<PathBuf>,
    conversations: HashMap<ConversationKey, Conversation>,
    /// Logical clock ordering activity across instances.
    clock: u64,
}

impl Default for MurmurEngine {
    fn default() -> Self {
        Self {
            rng: SystemRandom::new(),
            keys: KeyStore::new(),
            instags: InstagStore::new(),
            key_store_path: None,
            conversations: HashMap::new(),
            clock: 0,
        }
    }
}

impl std::fmt::Debug for MurmurEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MurmurEngine")
            .field("keys", &self.keys.len())
            .field("key_store_path", &self.key_store_path)
            .field("conversations", &self.conversations.len())
            .finish()
    }
}

impl MurmurEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the conversation with `contact` has a private session with
    /// any instance.
    pub fn is_encrypted(&self, account: &str, protocol: &str, contact: &str) -> bool {
        self.conversations
            .get(&(account.to_string(), protocol.to_string(), contact.to_string()))
            .is_some_and(Conversation::is_encrypted)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn our_instance(&mut self, account: &str, protocol: &str) -> anyhow::Result<InstanceTag> {
        self.instags.get_or_create(account, protocol, &self.rng)
    }

    fn send(
        &mut self,
        call: &Call<'_>,
        message: &OutboundMessage<'_>,
    ) -> anyhow::Result<EngineOutput> {
        let policy = call.policy();
        let our_instance = self.our_instance(call.account, call.protocol)?;
        if !policy.allows_protocol() {
            return Ok(EngineOutput {
                message: Some(message.text.to_string()),
                context: call.context(our_instance, INSTAG_MASTER),
            });
        }

        let now = self.tick();
        let conv = self
            .conversations
            .entry(call.key())
            .or_insert_with(|| Conversation::new(our_instance));
        let their_instance = conv.select(message.instance).ok_or_else(|| {
            anyhow::anyhow!("no instance {:#x} of {}", message.instance, call.contact)
        })?;
        let context = call.context(our_instance, their_instance);
        let Some(session) = conv.session_mut(their_instance) else {
            anyhow::bail!("no instance {their_instance:#x} of {}", call.contact);
        };

        if session.is_encrypted() {
            let body = session.seal_data(
                &DataPayload {
                    text: message.text.to_string(),
                    end_session: false,
                },
                our_instance,
            )?;
            session.last_sent = now;
            let wire = encode_envelope(&Envelope::new(our_instance, their_instance, body))?;
            let message = call.deliver(wire, message.frag_policy, our_instance, their_instance)?;
            return Ok(EngineOutput { message, context });
        }

        if session.is_finished() {
            debug!(contact = call.contact, "refusing to send into a finished conversation");
            call.event(EngineEvent::ConnectionEnded);
            return Ok(EngineOutput {
                message: Some(String::new()),
                context,
            });
        }

        if policy.requires_encryption() {
            conv.pending = Some(message.text.to_string());
            call.event(EngineEvent::EncryptionRequired);
            let query = query_message(call.account);
            let message = call.deliver(query, message.frag_policy, our_instance, their_instance)?;
            return Ok(EngineOutput { message, context });
        }

        if policy.sends_whitespace_tag() && conv.offer != Offer::Rejected {
            conv.offer = Offer::Sent;
            let tagged = add_whitespace_tag(message.text);
            let message = call.deliver(tagged, message.frag_policy, our_instance, their_instance)?;
            return Ok(EngineOutput { message, context });
        }

        Ok(EngineOutput {
            message: Some(message.text.to_string()),
            context,
        })
    }

    fn receive(&mut self, call: &Call<'_>, text: &str) -> anyhow::Result<EngineOutput> {
        let policy = call.policy();
        let our_instance = self.our_instance(call.account, call.protocol)?;
        if !policy.allows_protocol() {
            return Ok(EngineOutput {
                message: Some(text.to_string()),
                context: call.context(our_instance, INSTAG_MASTER),
            });
        }

        let now = self.tick();
        let conv = self
            .conversations
            .entry(call.key())
            .or_insert_with(|| Conversation::new(our_instance));
        let nothing = |their_instance| EngineOutput {
            message: None,
            context: call.context(our_instance, their_instance),
        };

        let assembled;
        let text = if fragment::is_fragment(text) {
            let Ok(piece) = fragment::parse(text) else {
                call.event(EngineEvent::ReceivedMalformed);
                return Ok(nothing(INSTAG_MASTER));
            };
            if piece.receiver_instance != INSTAG_MASTER && piece.receiver_instance != our_instance {
                call.event(EngineEvent::ReceivedForOtherInstance);
                return Ok(nothing(piece.sender_instance));
            }
            match conv.assembler.push(&piece) {
                Some(full) => {
                    assembled = full;
                    assembled.as_str()
                }
                None => return Ok(nothing(piece.sender_instance)),
            }
        } else {
            text
        };

        let incoming = match classify(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(contact = call.contact, error = %e, "undecodable protocol message");
                call.event(EngineEvent::ReceivedMalformed);
                return Ok(nothing(INSTAG_MASTER));
            }
        };

        let speaks_current = incoming.offers_current_version();
        match incoming {
            Incoming::Query { .. } if speaks_current => {
                debug!(contact = call.contact, "answering query");
                let body = conv.master.start_ake(&self.rng)?;
                call.inject_envelope(&Envelope::new(our_instance, INSTAG_MASTER, body))?;
                Ok(nothing(INSTAG_MASTER))
            }

            Incoming::Query { .. } => Ok(EngineOutput {
                message: Some(text.to_string()),
                context: call.context(our_instance, INSTAG_MASTER),
            }),

            Incoming::Error(detail) => {
                call.event(EngineEvent::ReceivedError(detail));
                if policy.error_starts_ake() {
                    call.inject(&query_message(call.account));
                }
                Ok(nothing(INSTAG_MASTER))
            }

            Incoming::TaggedPlaintext { text: stripped, .. } => {
                if speaks_current && policy.whitespace_starts_ake() && !conv.is_encrypted() {
                    debug!(contact = call.contact, "whitespace tag seen, starting exchange");
                    let body = conv.master.start_ake(&self.rng)?;
                    call.inject_envelope(&Envelope::new(our_instance, INSTAG_MASTER, body))?;
                }
                if policy.requires_encryption() {
                    call.event(EngineEvent::ReceivedUnencrypted(stripped.clone()));
                }
                Ok(EngineOutput {
                    message: Some(stripped),
                    context: call.context(our_instance, INSTAG_MASTER),
                })
            }

            Incoming::Plaintext(plain) => {
                if conv.offer == Offer::Sent {
                    conv.offer = Offer::Rejected;
                }
                if policy.requires_encryption() || conv.is_encrypted() {
                    call.event(EngineEvent::ReceivedUnencrypted(plain.clone()));
                }
                Ok(EngineOutput {
                    message: Some(plain),
                    context: call.context(our_instance, INSTAG_MASTER),
                })
            }

            Incoming::Encoded(envelope) => {
                let their_instance = envelope.sender_instance;
                let addressed_to_us = envelope.receiver_instance == our_instance
                    || (envelope.receiver_instance == INSTAG_MASTER
                        && matches!(envelope.body, Body::DhCommit { .. }));
                if envelope.receiver_instance != INSTAG_MASTER && !addressed_to_us {
                    call.event(EngineEvent::ReceivedForOtherInstance);
                    return Ok(nothing(their_instance));
                }
                if !addressed_to_us || their_instance < MIN_VALID_INSTAG {
                    call.event(EngineEvent::ReceivedMalformed);
                    return Ok(nothing(INSTAG_MASTER));
                }

                let message = receive_encoded(
                    call,
                    conv,
                    Keys {
                        store: &mut self.keys,
                        path: self.key_store_path.as_deref(),
                        rng: &self.rng,
                    },
                    envelope,
                    now,
                )?;
                Ok(EngineOutput {
                    message,
                    context: call.context(our_instance, their_instance),
                })
            }
        }
    }
}

/// Borrowed key material for handling one encoded message.
struct Keys<'a> {
    store: &'a mut KeyStore,
    path: Option<&'a Path>,
    rng: &'a SystemRandom,
}

impl Keys<'_> {
    /// Our identity for (account, protocol), generated on first need.
    fn identity(&mut self, account: &str, protocol: &str) -> anyhow::Result<&IdentityKey> {
        if self.store.get(account, protocol).is_none() {
            info!(account, protocol, "no identity key, generating one");
            self.store
                .insert(account, protocol, IdentityKey::generate(self.rng)?);
            if let Some(path) = self.path {
                self.store.save(path)?;
            }
        }
        self.store
            .get(account, protocol)
            .ok_or_else(|| anyhow::anyhow!("identity key for {account} vanished"))
    }
}

fn receive_encoded(
    call: &Call<'_>,
    conv: &mut Conversation,
    mut keys: Keys<'_>,
    envelope: Envelope,
    now: u64,
) -> anyhow::Result<Option<String>> {
    let our_instance = conv.our_instance;
    let their_instance = envelope.sender_instance;
    let session = conv.child(their_instance);
    session.last_received = now;

    let body = match envelope.body {
        Body::Data {
            counter,
            ciphertext,
        } => {
            if !session.is_encrypted() {
                call.event(EngineEvent::ReceivedUnreadable);
                call.inject(&error_message(&format!(
                    "You sent encrypted data to {}, who wasn't expecting it.",
                    call.account
                )));
                return Ok(None);
            }
            let payload = match session.open_data(counter, &ciphertext, our_instance) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(contact = call.contact, error = %e, "dropping unreadable data");
                    call.event(EngineEvent::ReceivedUnreadable);
                    return Ok(None);
                }
            };
            if payload.end_session {
                info!(
                    contact = call.contact,
                    instance = their_instance,
                    "peer ended private conversation"
                );
                session.finish();
                call.event(EngineEvent::ConnectionEnded);
            }
            return Ok((!payload.text.is_empty()).then_some(payload.text));
        }
        body => body,
    };

    let rng = keys.rng;
    let identity = keys.identity(call.account, call.protocol)?;
    let step = match session.handle_ake(&body, identity, rng) {
        Ok(step) => step,
        Err(e) => {
            warn!(contact = call.contact, kind = body.kind(), error = %e, "key exchange failed");
            call.event(EngineEvent::SetupError(e.to_string()));
            return Ok(None);
        }
    };

    match step {
        AkeStep::Ignore => {
            debug!(contact = call.contact, kind = body.kind(), "ignoring exchange message");
        }
        AkeStep::Reply(reply) => {
            call.inject_envelope(&Envelope::new(our_instance, their_instance, reply))?;
        }
        AkeStep::Secure {
            reply,
            their_fingerprint,
        } => {
            if let Some(reply) = reply {
                call.inject_envelope(&Envelope::new(our_instance, their_instance, reply))?;
            }
            info!(
                account = call.account,
                contact = call.contact,
                instance = their_instance,
                fingerprint = %their_fingerprint,
                "private conversation established"
            );
            if conv.known_fingerprints.insert(their_fingerprint) {
                call.event(EngineEvent::NewFingerprint(their_fingerprint));
            }
            call.event(EngineEvent::GoneSecure { their_fingerprint });

            if let Some(text) = conv.pending.take() {
                let session = conv.child(their_instance);
                let body = session.seal_data(
                    &DataPayload {
                        text,
                        end_session: false,
                    },
                    our_instance,
                )?;
                session.last_sent = now;
                call.inject_envelope(&Envelope::new(our_instance, their_instance, body))?;
                call.event(EngineEvent::MessageResent);
            }
        }
    }
    Ok(None)
}

impl Engine for MurmurEngine {
    fn set_key_store(&mut self, path: &Path) {
        self.key_store_path = Some(path.to_path_buf());
    }

    fn set_instag_store(&mut self, path: &Path) {
        self.instags.set_path(path);
    }

    fn read_privkeys(&mut self, path: &Path) -> Result<(), EngineError> {
        let count = self.keys.load(path)?;
        self.key_store_path = Some(path.to_path_buf());
        debug!(path = %path.display(), keys = count, "read key store");
        Ok(())
    }

    fn read_instags(&mut self, path: &Path) -> Result<(), EngineError> {
        let count = self.instags.load(path)?;
        debug!(path = %path.display(), instags = count, "read instance tags");
        Ok(())
    }

    fn generate_privkey(
        &mut self,
        account: &str,
        protocol: &str,
        key_store: Option<&Path>,
    ) -> Result<(), EngineError> {
        let key = IdentityKey::generate(&self.rng).map_err(|e| EngineError::KeyGeneration {
            account: account.to_string(),
            protocol: protocol.to_string(),
            reason: e.to_string(),
        })?;
        info!(account, protocol, fingerprint = %key.fingerprint(), "generated private key");
        self.keys.insert(account, protocol, key);

        if let Some(path) = key_store {
            self.keys.save(path)?;
            self.key_store_path = Some(path.to_path_buf());
        }
        Ok(())
    }

    fn find_privkey(&self, account: &str, protocol: &str) -> Option<KeyInfo> {
        self.keys.get(account, protocol).map(|key| KeyInfo {
            accountname: account.to_string(),
            protocol: protocol.to_string(),
            fingerprint: key.fingerprint(),
        })
    }

    fn forget_privkey(&mut self, account: &str, protocol: &str) -> bool {
        self.keys.remove(account, protocol)
    }

    fn forget_all(&mut self) {
        self.keys.clear();
    }

    fn send_message(
        &mut self,
        ops: &dyn MessageOps,
        message: OutboundMessage<'_>,
    ) -> Result<EngineOutput, EngineError> {
        let call = Call {
            ops,
            account: message.account,
            protocol: message.protocol,
            contact: message.contact,
        };
        Ok(self.send(&call, &message)?)
    }

    fn receive_message(
        &mut self,
        ops: &dyn MessageOps,
        message: InboundMessage<'_>,
    ) -> Result<EngineOutput, EngineError> {
        let call = Call {
            ops,
            account: message.account,
            protocol: message.protocol,
            contact: message.contact,
        };
        Ok(self.receive(&call, message.text)?)
    }

    fn end_session(
        &mut self,
        ops: &dyn MessageOps,
        account: &str,
        protocol: &str,
        contact: &str,
        instance: InstanceTag,
    ) -> Result<(), EngineError> {
        let call = Call {
            ops,
            account,
            protocol,
            contact,
        };
        let Some(conv) = self.conversations.get_mut(&call.key()) else {
            return Ok(());
        };
        let our_instance = conv.our_instance;
        let Some(their_instance) = conv.select(instance) else {
            return Ok(());
        };
        let Some(session) = conv.session_mut(their_instance) else {
            return Ok(());
        };

        if session.is_encrypted() && ops.is_logged_in(account, contact) != Some(false) {
            let body = session.seal_data(
                &DataPayload {
                    text: String::new(),
                    end_session: true,
                },
                our_instance,
            )?;
            call.inject_envelope(&Envelope::new(our_instance, their_instance, body))?;
        }
        session.end();
        conv.pending = None;
        info!(account, contact, instance = their_instance, "ended private conversation");
        Ok(())
    }
}
