//! Instance selection for outbound messages.

use std::fmt;
use std::str::FromStr;

use murmur_protocol::types::{
    InstanceTag, INSTAG_BEST, INSTAG_MASTER, INSTAG_RECENT, INSTAG_RECENT_RECEIVED,
    INSTAG_RECENT_SENT,
};

use crate::error::ResolutionError;

/// Symbolic instance resolved by the engine at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaInstance {
    Master,
    Best,
    Recent,
    RecentReceived,
    RecentSent,
}

impl MetaInstance {
    /// Every meta instance, in tag order. Read-only, shared by all clients.
    pub const ALL: [MetaInstance; 5] = [
        Self::Master,
        Self::Best,
        Self::Recent,
        Self::RecentReceived,
        Self::RecentSent,
    ];

    fn entry(self) -> (&'static str, InstanceTag) {
        match self {
            Self::Master => ("master", INSTAG_MASTER),
            Self::Best => ("best", INSTAG_BEST),
            Self::Recent => ("recent", INSTAG_RECENT),
            Self::RecentReceived => ("recent_received", INSTAG_RECENT_RECEIVED),
            Self::RecentSent => ("recent_sent", INSTAG_RECENT_SENT),
        }
    }

    pub fn name(self) -> &'static str {
        self.entry().0
    }

    pub fn tag(self) -> InstanceTag {
        self.entry().1
    }
}

impl fmt::Display for MetaInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target instance of a send: symbolic, or a concrete tag that bypasses
/// the meta-instance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instance {
    Meta(MetaInstance),
    Tag(InstanceTag),
}

impl Default for Instance {
    fn default() -> Self {
        Self::Meta(MetaInstance::Best)
    }
}

impl Instance {
    pub fn resolve(self) -> InstanceTag {
        match self {
            Self::Meta(meta) => meta.tag(),
            Self::Tag(tag) => tag,
        }
    }
}

impl From<MetaInstance> for Instance {
    fn from(meta: MetaInstance) -> Self {
        Self::Meta(meta)
    }
}

impl From<InstanceTag> for Instance {
    fn from(tag: InstanceTag) -> Self {
        Self::Tag(tag)
    }
}

/// Accepts a meta-instance name, a decimal tag, or a `0x`-prefixed hex tag.
impl FromStr for Instance {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(meta) = MetaInstance::ALL.into_iter().find(|meta| meta.name() == s) {
            return Ok(Self::Meta(meta));
        }
        let parsed = match s.strip_prefix("0x") {
            Some(hex) => InstanceTag::from_str_radix(hex, 16),
            None => s.parse(),
        };
        parsed
            .map(Self::Tag)
            .map_err(|_| ResolutionError::UnknownInstance(s.to_string()))
    }
}
