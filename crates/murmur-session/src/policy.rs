//! Fragmentation policy: the validated client setting and its mapping to
//! the engine's numeric codes.

use std::fmt;
use std::str::FromStr;

use murmur_protocol::types::{
    FragmentCode, FRAGMENT_SEND_ALL, FRAGMENT_SEND_ALL_BUT_FIRST, FRAGMENT_SEND_ALL_BUT_LAST,
    FRAGMENT_SEND_SKIP,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ResolutionError};

/// How an outbound message exceeding the transport's size limit is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragPolicy {
    SendAll,
    SendAllButFirst,
    SendAllButLast,
    #[default]
    SendSkip,
}

impl FragPolicy {
    /// Every policy, in engine code order.
    pub const ALL: [FragPolicy; 4] = [
        Self::SendSkip,
        Self::SendAll,
        Self::SendAllButFirst,
        Self::SendAllButLast,
    ];

    /// Symbolic name and engine code.
    fn entry(self) -> (&'static str, FragmentCode) {
        match self {
            Self::SendSkip => ("send_skip", FRAGMENT_SEND_SKIP),
            Self::SendAll => ("send_all", FRAGMENT_SEND_ALL),
            Self::SendAllButFirst => ("send_all_but_first", FRAGMENT_SEND_ALL_BUT_FIRST),
            Self::SendAllButLast => ("send_all_but_last", FRAGMENT_SEND_ALL_BUT_LAST),
        }
    }

    pub fn name(self) -> &'static str {
        self.entry().0
    }

    /// Numeric code handed to the engine.
    pub fn code(self) -> FragmentCode {
        self.entry().1
    }

    /// Whether a client may be configured with this policy.
    pub fn is_supported(self) -> bool {
        matches!(self, Self::SendAll | Self::SendSkip)
    }

    /// Whether the engine splits and sends messages itself.
    pub fn fragments(self) -> bool {
        self != Self::SendSkip
    }
}

impl fmt::Display for FragPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FragPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|policy| policy.name() == s)
            .ok_or_else(|| ConfigError::UnknownFragPolicy(s.to_string()))
    }
}

/// Reject policies a client cannot be configured with.
pub fn validate_frag_policy(policy: FragPolicy) -> Result<(), ConfigError> {
    if policy.is_supported() {
        Ok(())
    } else {
        Err(ConfigError::UnsupportedFragPolicy(policy))
    }
}

/// Fragmentation override for a single send: a policy name, translated
/// through the code table, or a raw engine code passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragSelector {
    Policy(FragPolicy),
    Code(FragmentCode),
}

impl FragSelector {
    pub fn resolve(self) -> FragmentCode {
        match self {
            Self::Policy(policy) => policy.code(),
            Self::Code(code) => code,
        }
    }
}

impl From<FragPolicy> for FragSelector {
    fn from(policy: FragPolicy) -> Self {
        Self::Policy(policy)
    }
}

impl From<FragmentCode> for FragSelector {
    fn from(code: FragmentCode) -> Self {
        Self::Code(code)
    }
}

impl FromStr for FragSelector {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<FragmentCode>() {
            return Ok(Self::Code(code));
        }
        s.parse::<FragPolicy>()
            .map(Self::Policy)
            .map_err(|_| ResolutionError::UnknownFragPolicy(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_policies_validate() {
        assert!(validate_frag_policy(FragPolicy::SendAll).is_ok());
        assert!(validate_frag_policy(FragPolicy::SendSkip).is_ok());
    }

    #[test]
    fn but_first_and_but_last_rejected() {
        for policy in [FragPolicy::SendAllButFirst, FragPolicy::SendAllButLast] {
            assert!(matches!(
                validate_frag_policy(policy),
                Err(ConfigError::UnsupportedFragPolicy(p)) if p == policy
            ));
        }
    }

    #[test]
    fn unknown_name_rejected() {
        assert!(matches!(
            "send_bogus".parse::<FragPolicy>(),
            Err(ConfigError::UnknownFragPolicy(name)) if name == "send_bogus"
        ));
    }

    #[test]
    fn code_table() {
        assert_eq!(FragPolicy::SendSkip.code(), 0);
        assert_eq!(FragPolicy::SendAll.code(), 1);
        assert_eq!(FragPolicy::SendAllButFirst.code(), 2);
        assert_eq!(FragPolicy::SendAllButLast.code(), 3);
        assert_eq!("send_all_but_last".parse::<FragPolicy>().unwrap(), FragPolicy::SendAllButLast);
    }

    #[test]
    fn every_policy_has_its_own_name_and_code() {
        for (i, policy) in FragPolicy::ALL.into_iter().enumerate() {
            assert_eq!(policy.code(), i as FragmentCode);
            assert_eq!(policy.name().parse::<FragPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn selector_resolution() {
        assert_eq!(FragSelector::from(FragPolicy::SendAll).resolve(), 1);
        assert_eq!(FragSelector::from(7u32).resolve(), 7);
        assert_eq!("2".parse::<FragSelector>().unwrap(), FragSelector::Code(2));
        assert_eq!(
            "send_skip".parse::<FragSelector>().unwrap(),
            FragSelector::Policy(FragPolicy::SendSkip)
        );
        assert!(matches!(
            "sometimes".parse::<FragSelector>(),
            Err(ResolutionError::UnknownFragPolicy(_))
        ));
    }
}
