//! Session orchestration for multi-account encrypted messaging.
//!
//! A [`UserState`] owns the engine and creates [`Client`]s; each client owns
//! its [`Account`]s and their [`Contact`]s and decides, per message, how the
//! engine's output reaches the transport.

pub mod account;
pub mod client;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod instance;
pub mod policy;
pub mod user_state;

#[cfg(test)]
mod mock;

pub use account::{Account, Contact};
pub use client::{AccountHandle, Client, ContactHandle, SendOptions};
pub use config::{ClientConfig, InjectFn, ReceivedFn, UserStateOptions};
pub use context::Context;
pub use engine::{
    ConnContext, Engine, EngineError, EngineEvent, EngineOutput, Fingerprint, InboundMessage,
    KeyInfo, MessageOps, OutboundMessage, SharedEngine,
};
pub use error::{ConfigError, ResolutionError, SessionError};
pub use instance::{Instance, MetaInstance};
pub use murmur_protocol::types::Policy;
pub use policy::{validate_frag_policy, FragPolicy, FragSelector};
pub use user_state::{PrivKey, UserState};
