//! Wire vocabulary shared by the murmur session layer and its engines.
//!
//! This crate provides:
//! - Instance tags, meta-instance codes and fragment-policy codes
//! - Per-contact [`Policy`] and its capability flags
//! - Binary protocol envelopes and their `?OTR:` text encoding
//! - Query messages, whitespace tags and error messages
//! - Fragmentation and reassembly of oversized messages

pub mod codec;
pub mod error;
pub mod fragment;
pub mod messages;
pub mod types;

pub use codec::{classify, Incoming};
pub use error::ProtocolError;
pub use messages::{Body, DataPayload, Envelope, IdentityProof};
pub use types::{FragmentCode, InstanceTag, Policy};
