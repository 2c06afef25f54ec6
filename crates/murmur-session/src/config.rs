use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::account::{Account, Contact};
use crate::engine::EngineEvent;
use crate::error::ConfigError;
use crate::policy::{validate_frag_policy, FragPolicy};

/// Called with `(account, contact, text)` whenever text must go out on the
/// transport: plaintext the engine left untouched, or protocol output the
/// engine produced itself.
pub type InjectFn = Arc<dyn Fn(&Account, &Contact, &str) + Send + Sync>;

/// Called with engine notifications raised while handling a message.
pub type ReceivedFn = Arc<dyn Fn(&Account, &Contact, &EngineEvent) + Send + Sync>;

fn default_protocol() -> String {
    "meow".into()
}

/// Construction-time options of a [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) protocol: String,
    pub(crate) max_message_size: Option<usize>,
    pub(crate) frag_policy: FragPolicy,
    pub(crate) inject: Option<InjectFn>,
    pub(crate) received: Option<ReceivedFn>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            max_message_size: None,
            frag_policy: FragPolicy::default(),
            inject: None,
            received: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("protocol", &self.protocol)
            .field("max_message_size", &self.max_message_size)
            .field("frag_policy", &self.frag_policy)
            .field("inject", &self.inject.is_some())
            .field("received", &self.received.is_some())
            .finish()
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn frag_policy(mut self, policy: FragPolicy) -> Self {
        self.frag_policy = policy;
        self
    }

    /// `true` switches `send_skip` to `send_all`; `false` switches any
    /// fragmenting policy back to `send_skip`. Otherwise a no-op.
    pub fn fragment(mut self, enabled: bool) -> Self {
        if enabled && self.frag_policy == FragPolicy::SendSkip {
            self.frag_policy = FragPolicy::SendAll;
        } else if !enabled && self.frag_policy != FragPolicy::SendSkip {
            self.frag_policy = FragPolicy::SendSkip;
        }
        self
    }

    pub fn on_inject<F>(mut self, f: F) -> Self
    where
        F: Fn(&Account, &Contact, &str) + Send + Sync + 'static,
    {
        self.inject = Some(Arc::new(f));
        self
    }

    pub fn on_received<F>(mut self, f: F) -> Self
    where
        F: Fn(&Account, &Contact, &EngineEvent) + Send + Sync + 'static,
    {
        self.received = Some(Arc::new(f));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_frag_policy(self.frag_policy)?;
        if self.max_message_size == Some(0) {
            return Err(ConfigError::ZeroMaxMessageSize);
        }
        Ok(())
    }

    /// Parse options from TOML. Callbacks are attached afterwards with the
    /// builder methods.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(s)?;
        let mut config = Self::new().protocol(file.protocol);
        config.max_message_size = file.max_message_size;
        if let Some(policy) = file.frag_policy {
            config.frag_policy = policy.parse()?;
        }
        if let Some(enabled) = file.fragment {
            config = config.fragment(enabled);
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_protocol")]
    protocol: String,
    #[serde(default)]
    max_message_size: Option<usize>,
    #[serde(default)]
    frag_policy: Option<String>,
    #[serde(default)]
    fragment: Option<bool>,
}

/// Where a [`UserState`](crate::UserState) loads and stores engine files.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserStateOptions {
    /// Private key store.
    pub key_store: Option<PathBuf>,
    /// Instance tag store.
    pub instag_store: Option<PathBuf>,
}

impl UserStateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_store(mut self, path: impl AsRef<Path>) -> Self {
        self.key_store = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn instag_store(mut self, path: impl AsRef<Path>) -> Self {
        self.instag_store = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}
