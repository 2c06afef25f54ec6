//! Key derivation for a completed exchange and AES-256-GCM sealing of
//! exchange proofs and data messages.
//!
//! Each exchange yields three keys: one sealing the identity proofs, and one
//! per direction for data messages.

use hkdf::Hkdf;
use murmur_protocol::types::InstanceTag;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;

const AKE_INFO: &[u8] = b"murmur v3 exchange";
const INITIATOR_INFO: &[u8] = b"murmur v3 data initiator";
const RESPONDER_INFO: &[u8] = b"murmur v3 data responder";

/// Which side of the exchange we were.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Keys derived from one exchange. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    ake: [u8; 32],
    initiator_to_responder: [u8; 32],
    responder_to_initiator: [u8; 32],
}

impl SessionKeys {
    /// HKDF-SHA256 over the X25519 shared secret, salted with both
    /// ephemeral public values in initiator-first order.
    pub fn derive(
        shared: &[u8],
        initiator_public: &[u8],
        responder_public: &[u8],
    ) -> anyhow::Result<Self> {
        let salt = Sha256::new()
            .chain_update(initiator_public)
            .chain_update(responder_public)
            .finalize();
        let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), shared);

        let mut keys = Self {
            ake: [0u8; 32],
            initiator_to_responder: [0u8; 32],
            responder_to_initiator: [0u8; 32],
        };
        for (info, out) in [
            (AKE_INFO, &mut keys.ake),
            (INITIATOR_INFO, &mut keys.initiator_to_responder),
            (RESPONDER_INFO, &mut keys.responder_to_initiator),
        ] {
            hk.expand(info, out)
                .map_err(|_| anyhow::anyhow!("key derivation failed"))?;
        }
        Ok(keys)
    }

    pub fn ake(&self) -> &[u8; 32] {
        &self.ake
    }

    pub fn sending(&self, role: Role) -> &[u8; 32] {
        match role {
            Role::Initiator => &self.initiator_to_responder,
            Role::Responder => &self.responder_to_initiator,
        }
    }

    pub fn receiving(&self, role: Role) -> &[u8; 32] {
        match role {
            Role::Initiator => &self.responder_to_initiator,
            Role::Responder => &self.initiator_to_responder,
        }
    }
}

fn to_aead_key(key: &[u8; 32]) -> anyhow::Result<LessSafeKey> {
    let unbound =
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| anyhow::anyhow!("invalid key"))?;
    Ok(LessSafeKey::new(unbound))
}

/// Nonce = 0u32 || counter(8), big-endian. Counters never repeat under a key.
fn build_nonce(counter: u64) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_be_bytes());
    Nonce::assume_unique_for_key(nonce_bytes)
}

/// Binds a data message to the instance pair it travels between.
pub fn build_aad(sender_instance: InstanceTag, receiver_instance: InstanceTag) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&sender_instance.to_be_bytes());
    aad[4..].copy_from_slice(&receiver_instance.to_be_bytes());
    aad
}

/// Seal `plaintext`, returning ciphertext with the 16-byte tag appended.
pub fn seal(key: &[u8; 32], counter: u64, aad: &[u8], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let aead_key = to_aead_key(key)?;
    let mut in_out = plaintext.to_vec();
    aead_key
        .seal_in_place_append_tag(build_nonce(counter), Aad::from(aad), &mut in_out)
        .map_err(|_| anyhow::anyhow!("encryption failed"))?;
    Ok(in_out)
}

pub fn open(key: &[u8; 32], counter: u64, aad: &[u8], ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
    if ciphertext.len() < GCM_TAG_SIZE {
        anyhow::bail!("ciphertext too short for GCM tag");
    }
    let aead_key = to_aead_key(key)?;
    let mut in_out = ciphertext.to_vec();
    let plaintext = aead_key
        .open_in_place(build_nonce(counter), Aad::from(aad), &mut in_out)
        .map_err(|_| anyhow::anyhow!("decryption failed: invalid key or tampered data"))?;
    Ok(plaintext.to_vec())
}
