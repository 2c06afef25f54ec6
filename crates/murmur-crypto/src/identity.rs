//! Long-term identity keys.
//!
//! Each (account, protocol) pair owns one Ed25519 key. Peers recognise it by
//! its fingerprint, the first 20 bytes of SHA-256 over the public key.

use murmur_protocol::IdentityProof;
use murmur_session::Fingerprint;
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// An Ed25519 key pair together with its PKCS#8 encoding.
pub struct IdentityKey {
    pkcs8: Zeroizing<Vec<u8>>,
    pair: Ed25519KeyPair,
}

impl IdentityKey {
    /// Generate a fresh identity key.
    pub fn generate(rng: &SystemRandom) -> anyhow::Result<Self> {
        let document = Ed25519KeyPair::generate_pkcs8(rng)
            .map_err(|_| anyhow::anyhow!("RNG failed"))?;
        Self::from_pkcs8(document.as_ref())
    }

    pub fn from_pkcs8(bytes: &[u8]) -> anyhow::Result<Self> {
        let pair = Ed25519KeyPair::from_pkcs8(bytes)
            .map_err(|e| anyhow::anyhow!("invalid identity key: {e}"))?;
        Ok(Self {
            pkcs8: Zeroizing::new(bytes.to_vec()),
            pair,
        })
    }

    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn public_key(&self) -> &[u8] {
        self.pair.public_key().as_ref()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_of(self.public_key())
    }

    /// Sign `transcript`, binding it to this key.
    pub fn prove(&self, transcript: &[u8]) -> IdentityProof {
        IdentityProof {
            public_key: self.public_key().to_vec(),
            signature: self.pair.sign(transcript).as_ref().to_vec(),
        }
    }
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

pub fn fingerprint_of(public_key: &[u8]) -> Fingerprint {
    let digest = Sha256::digest(public_key);
    let mut fp = [0u8; Fingerprint::LEN];
    fp.copy_from_slice(&digest[..Fingerprint::LEN]);
    Fingerprint(fp)
}

/// Check a peer's proof over `transcript`. Returns the fingerprint of the
/// key that signed it.
pub fn verify_proof(proof: &IdentityProof, transcript: &[u8]) -> anyhow::Result<Fingerprint> {
    UnparsedPublicKey::new(&signature::ED25519, &proof.public_key)
        .verify(transcript, &proof.signature)
        .map_err(|_| anyhow::anyhow!("identity signature did not verify"))?;
    Ok(fingerprint_of(&proof.public_key))
}
