use thiserror::Error;

use crate::engine::EngineError;
use crate::policy::FragPolicy;

/// Rejected client configuration. Raised at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid frag_policy {0}")]
    UnknownFragPolicy(String),

    #[error("frag_policy {0} not supported")]
    UnsupportedFragPolicy(FragPolicy),

    #[error("max_message_size must be positive")]
    ZeroMaxMessageSize,

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A name given to a send/receive call that does not resolve.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("account not found: {0}")]
    UnknownAccount(String),

    #[error("contact {contact} not found for account {account}")]
    UnknownContact { account: String, contact: String },

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("unknown frag_policy: {0}")]
    UnknownFragPolicy(String),
}

/// Errors from session-layer operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}
