use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Identifies one protocol instance (one device / client) of an account.
/// Values below [`MIN_VALID_INSTAG`] are reserved for meta instances.
pub type InstanceTag = u32;

/// The master context of a conversation, used before any peer instance is known.
pub const INSTAG_MASTER: InstanceTag = 0;
/// The "best" child context: an encrypted one if any, else the most recent.
pub const INSTAG_BEST: InstanceTag = 1;
/// The child context that most recently sent or received.
pub const INSTAG_RECENT: InstanceTag = 2;
/// The child context that most recently received.
pub const INSTAG_RECENT_RECEIVED: InstanceTag = 3;
/// The child context that most recently sent.
pub const INSTAG_RECENT_SENT: InstanceTag = 4;
/// Smallest value a real instance tag may take.
pub const MIN_VALID_INSTAG: InstanceTag = 0x100;

/// Returns true for the reserved meta-instance range.
pub fn is_meta_instance(tag: InstanceTag) -> bool {
    tag < MIN_VALID_INSTAG
}

/// Numeric fragmentation policy code understood by the engine.
pub type FragmentCode = u32;

/// Do not fragment or send; hand the whole message back to the caller.
pub const FRAGMENT_SEND_SKIP: FragmentCode = 0;
/// Inject every fragment.
pub const FRAGMENT_SEND_ALL: FragmentCode = 1;
/// Inject all fragments but the first, which is returned to the caller.
pub const FRAGMENT_SEND_ALL_BUT_FIRST: FragmentCode = 2;
/// Inject all fragments but the last, which is returned to the caller.
pub const FRAGMENT_SEND_ALL_BUT_LAST: FragmentCode = 3;

/// Wire protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 3;

/// Per-contact stance governing whether and when the engine negotiates
/// an encrypted conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Never speak the protocol; everything passes through untouched.
    Never,
    /// Speak the protocol only when the peer asks for it.
    Manual,
    /// Advertise support with a whitespace tag and start when the peer answers.
    #[default]
    Opportunistic,
    /// Refuse to send plaintext; request a private conversation instead.
    Always,
}

impl Policy {
    pub fn allows_protocol(self) -> bool {
        self != Self::Never
    }

    pub fn requires_encryption(self) -> bool {
        self == Self::Always
    }

    pub fn sends_whitespace_tag(self) -> bool {
        self == Self::Opportunistic
    }

    pub fn whitespace_starts_ake(self) -> bool {
        matches!(self, Self::Opportunistic | Self::Always)
    }

    pub fn error_starts_ake(self) -> bool {
        matches!(self, Self::Opportunistic | Self::Always)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Manual => "manual",
            Self::Opportunistic => "opportunistic",
            Self::Always => "always",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "manual" => Ok(Self::Manual),
            "opportunistic" => Ok(Self::Opportunistic),
            "always" => Ok(Self::Always),
            other => Err(ProtocolError::UnknownPolicy(other.to_string())),
        }
    }
}
