//! Per-instance protocol state: the authenticated key exchange and the
//! encrypted conversation it establishes.
//!
//! The exchange is a signed ephemeral X25519 agreement:
//!
//! ```text
//! initiator                          responder
//!   DhCommit(g^x)          ───►
//!                          ◄───      DhKey(g^y)
//!   RevealSignature(proof_i) ─►      (verify, go encrypted)
//!                          ◄───      Signature(proof_r)
//!   (verify, go encrypted)
//! ```
//!
//! Proofs are Ed25519 signatures over the exchange transcript, sealed under
//! the exchange key derived from the shared secret.

use murmur_protocol::types::InstanceTag;
use murmur_protocol::{Body, DataPayload, IdentityProof};
use murmur_session::Fingerprint;
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;

use crate::identity::{verify_proof, IdentityKey};
use crate::message_keys::{build_aad, open, seal, Role, SessionKeys};

const INITIATOR_LABEL: &[u8] = b"initiator";
const RESPONDER_LABEL: &[u8] = b"responder";

// Exchange proofs are each sealed once under the exchange key.
const REVEAL_COUNTER: u64 = 0;
const SIGNATURE_COUNTER: u64 = 1;

/// Progress of the key exchange.
#[derive(Default)]
pub enum AuthState {
    #[default]
    None,
    AwaitingDhKey {
        secret: EphemeralPrivateKey,
        public: Vec<u8>,
    },
    AwaitingRevealSig {
        keys: SessionKeys,
        initiator_public: Vec<u8>,
        responder_public: Vec<u8>,
    },
    AwaitingSig {
        keys: SessionKeys,
        initiator_public: Vec<u8>,
        responder_public: Vec<u8>,
    },
}

impl AuthState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Keys and counters of an established private conversation.
pub struct Secure {
    keys: SessionKeys,
    role: Role,
    their_fingerprint: Fingerprint,
    send_counter: u64,
    recv_counter: u64,
}

pub enum MsgState {
    Plaintext,
    Encrypted(Box<Secure>),
    /// The peer ended the conversation; nothing more may be sent until a
    /// new exchange or a local end.
    Finished,
}

/// What the caller must do after feeding an exchange message.
#[derive(Debug)]
pub enum AkeStep {
    /// Send this body back to the peer.
    Reply(Body),
    /// The exchange completed.
    Secure {
        reply: Option<Body>,
        their_fingerprint: Fingerprint,
    },
    /// Out-of-sequence message, dropped.
    Ignore,
}

fn transcript(
    label: &[u8],
    initiator_public: &[u8],
    responder_public: &[u8],
    identity_public: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        label.len() + initiator_public.len() + responder_public.len() + identity_public.len(),
    );
    out.extend_from_slice(label);
    out.extend_from_slice(initiator_public);
    out.extend_from_slice(responder_public);
    out.extend_from_slice(identity_public);
    out
}

fn ephemeral(rng: &SystemRandom) -> anyhow::Result<(EphemeralPrivateKey, Vec<u8>)> {
    let secret = EphemeralPrivateKey::generate(&X25519, rng)
        .map_err(|_| anyhow::anyhow!("RNG failed"))?;
    let public = secret
        .compute_public_key()
        .map_err(|_| anyhow::anyhow!("failed to compute public key"))?
        .as_ref()
        .to_vec();
    Ok((secret, public))
}

fn agree(secret: EphemeralPrivateKey, their_public: &[u8]) -> anyhow::Result<Vec<u8>> {
    agreement::agree_ephemeral(
        secret,
        &UnparsedPublicKey::new(&X25519, their_public),
        |shared| shared.to_vec(),
    )
    .map_err(|_| anyhow::anyhow!("key agreement failed"))
}

fn seal_proof(keys: &SessionKeys, counter: u64, proof: &IdentityProof) -> anyhow::Result<Vec<u8>> {
    let bytes = postcard::to_allocvec(proof)
        .map_err(|e| anyhow::anyhow!("serialization failed: {e}"))?;
    seal(keys.ake(), counter, &[], &bytes)
}

fn open_proof(keys: &SessionKeys, counter: u64, sealed: &[u8]) -> anyhow::Result<IdentityProof> {
    let bytes = open(keys.ake(), counter, &[], sealed)?;
    postcard::from_bytes(&bytes).map_err(|e| anyhow::anyhow!("malformed proof: {e}"))
}

/// Protocol state towards one peer instance.
pub struct Session {
    pub their_instance: InstanceTag,
    pub auth: AuthState,
    pub msg: MsgState,
    /// Logical time of the last message received from / sent to this instance.
    pub last_received: u64,
    pub last_sent: u64,
}

impl Session {
    pub fn new(their_instance: InstanceTag) -> Self {
        Self {
            their_instance,
            auth: AuthState::None,
            msg: MsgState::Plaintext,
            last_received: 0,
            last_sent: 0,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.msg, MsgState::Encrypted(_))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.msg, MsgState::Finished)
    }

    pub fn their_fingerprint(&self) -> Option<Fingerprint> {
        match &self.msg {
            MsgState::Encrypted(secure) => Some(secure.their_fingerprint),
            _ => None,
        }
    }

    /// Begin an exchange as initiator, abandoning any exchange in progress.
    pub fn start_ake(&mut self, rng: &SystemRandom) -> anyhow::Result<Body> {
        let (secret, public) = ephemeral(rng)?;
        self.auth = AuthState::AwaitingDhKey {
            secret,
            public: public.clone(),
        };
        Ok(Body::DhCommit { public })
    }

    /// Advance the exchange with an incoming exchange message.
    ///
    /// On error the exchange is abandoned; the message state is untouched.
    pub fn handle_ake(
        &mut self,
        body: &Body,
        identity: &IdentityKey,
        rng: &SystemRandom,
    ) -> anyhow::Result<AkeStep> {
        let result = self.advance(body, identity, rng);
        if result.is_err() {
            self.auth = AuthState::None;
        }
        result
    }

    fn advance(
        &mut self,
        body: &Body,
        identity: &IdentityKey,
        rng: &SystemRandom,
    ) -> anyhow::Result<AkeStep> {
        match (std::mem::take(&mut self.auth), body) {
            // Both sides committed at once: the larger public value wins and
            // the other side answers it.
            (AuthState::AwaitingDhKey { secret, public }, Body::DhCommit { public: theirs })
                if public.as_slice() > theirs.as_slice() =>
            {
                self.auth = AuthState::AwaitingDhKey { secret, public };
                Ok(AkeStep::Ignore)
            }

            (_, Body::DhCommit { public: theirs }) => {
                let (secret, ours) = ephemeral(rng)?;
                let keys = SessionKeys::derive(&agree(secret, theirs)?, theirs, &ours)?;
                self.auth = AuthState::AwaitingRevealSig {
                    keys,
                    initiator_public: theirs.clone(),
                    responder_public: ours.clone(),
                };
                Ok(AkeStep::Reply(Body::DhKey { public: ours }))
            }

            (AuthState::AwaitingDhKey { secret, public }, Body::DhKey { public: theirs }) => {
                let keys = SessionKeys::derive(&agree(secret, theirs)?, &public, theirs)?;
                let proof = identity.prove(&transcript(
                    INITIATOR_LABEL,
                    &public,
                    theirs,
                    identity.public_key(),
                ));
                let sealed = seal_proof(&keys, REVEAL_COUNTER, &proof)?;
                self.auth = AuthState::AwaitingSig {
                    keys,
                    initiator_public: public,
                    responder_public: theirs.clone(),
                };
                Ok(AkeStep::Reply(Body::RevealSignature { sealed }))
            }

            (
                AuthState::AwaitingRevealSig {
                    keys,
                    initiator_public,
                    responder_public,
                },
                Body::RevealSignature { sealed },
            ) => {
                let proof = open_proof(&keys, REVEAL_COUNTER, sealed)?;
                let their_fingerprint = verify_proof(
                    &proof,
                    &transcript(
                        INITIATOR_LABEL,
                        &initiator_public,
                        &responder_public,
                        &proof.public_key,
                    ),
                )?;
                let ours = identity.prove(&transcript(
                    RESPONDER_LABEL,
                    &initiator_public,
                    &responder_public,
                    identity.public_key(),
                ));
                let sealed = seal_proof(&keys, SIGNATURE_COUNTER, &ours)?;
                self.go_encrypted(keys, Role::Responder, their_fingerprint);
                Ok(AkeStep::Secure {
                    reply: Some(Body::Signature { sealed }),
                    their_fingerprint,
                })
            }

            (
                AuthState::AwaitingSig {
                    keys,
                    initiator_public,
                    responder_public,
                },
                Body::Signature { sealed },
            ) => {
                let proof = open_proof(&keys, SIGNATURE_COUNTER, sealed)?;
                let their_fingerprint = verify_proof(
                    &proof,
                    &transcript(
                        RESPONDER_LABEL,
                        &initiator_public,
                        &responder_public,
                        &proof.public_key,
                    ),
                )?;
                self.go_encrypted(keys, Role::Initiator, their_fingerprint);
                Ok(AkeStep::Secure {
                    reply: None,
                    their_fingerprint,
                })
            }

            (state, _) => {
                self.auth = state;
                Ok(AkeStep::Ignore)
            }
        }
    }

    fn go_encrypted(&mut self, keys: SessionKeys, role: Role, their_fingerprint: Fingerprint) {
        self.msg = MsgState::Encrypted(Box::new(Secure {
            keys,
            role,
            their_fingerprint,
            send_counter: 0,
            recv_counter: 0,
        }));
    }

    /// Seal a data payload for the peer. Fails unless encrypted.
    pub fn seal_data(
        &mut self,
        payload: &DataPayload,
        our_instance: InstanceTag,
    ) -> anyhow::Result<Body> {
        let MsgState::Encrypted(secure) = &mut self.msg else {
            anyhow::bail!("no private conversation with instance {:#x}", self.their_instance);
        };
        let bytes = postcard::to_allocvec(payload)
            .map_err(|e| anyhow::anyhow!("serialization failed: {e}"))?;
        secure.send_counter += 1;
        let counter = secure.send_counter;
        let aad = build_aad(our_instance, self.their_instance);
        let ciphertext = seal(secure.keys.sending(secure.role), counter, &aad, &bytes)?;
        Ok(Body::Data {
            counter,
            ciphertext,
        })
    }

    /// Open a data message from the peer. Counters must strictly increase.
    pub fn open_data(
        &mut self,
        counter: u64,
        ciphertext: &[u8],
        our_instance: InstanceTag,
    ) -> anyhow::Result<DataPayload> {
        let MsgState::Encrypted(secure) = &mut self.msg else {
            anyhow::bail!("not expecting encrypted data");
        };
        if counter <= secure.recv_counter {
            anyhow::bail!("replayed counter {counter}");
        }
        let aad = build_aad(self.their_instance, our_instance);
        let bytes = open(secure.keys.receiving(secure.role), counter, &aad, ciphertext)?;
        secure.recv_counter = counter;
        postcard::from_bytes(&bytes).map_err(|e| anyhow::anyhow!("malformed payload: {e}"))
    }

    /// Return to plaintext, dropping keys and any exchange in progress.
    pub fn end(&mut self) {
        self.msg = MsgState::Plaintext;
        self.auth = AuthState::None;
    }

    /// The peer ended the conversation. Keys are dropped but sending stays
    /// refused until a local end or a new exchange.
    pub fn finish(&mut self) {
        self.msg = MsgState::Finished;
        self.auth = AuthState::None;
    }
}
