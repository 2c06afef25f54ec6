//! Murmur cryptographic engine.
//!
//! This crate provides:
//! - Ed25519 identity keys and their fingerprints
//! - A signed X25519 key exchange per peer instance
//! - AES-256-GCM data messages with HKDF-derived directional keys
//! - Key store and instance tag persistence
//! - [`MurmurEngine`], the [`murmur_session::Engine`] tying these together

pub mod conversation;
pub mod engine;
pub mod identity;
pub mod message_keys;
pub mod persistence;
pub mod session;
pub mod stores;

pub use engine::MurmurEngine;
pub use identity::{fingerprint_of, IdentityKey};
