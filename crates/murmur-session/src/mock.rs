//! Scripted engine for exercising the session layer without cryptography.
//!
//! Sends to `never`/`manual` contacts come back unchanged; everything else is
//! wrapped as `?OTR:<text>.` and injected by the engine itself. Inbound
//! `?OTR:` text is unwrapped; a query is answered by injection and yields no
//! plaintext.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use murmur_protocol::types::{FragmentCode, InstanceTag, Policy};

use crate::engine::{
    ConnContext, Engine, EngineError, EngineEvent, EngineOutput, Fingerprint, InboundMessage,
    KeyInfo, MessageOps, OutboundMessage,
};

pub const OUR_INSTANCE: InstanceTag = 0x100;
pub const THEIR_INSTANCE: InstanceTag = 0x200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub account: String,
    pub contact: String,
    pub text: String,
    pub instance: InstanceTag,
    pub frag_policy: FragmentCode,
}

#[derive(Debug, Default)]
pub struct MockEngine {
    pub keys: HashMap<(String, String), KeyInfo>,
    pub sent: Vec<SentRecord>,
    pub instag_files: Vec<PathBuf>,
    pub key_store: Option<PathBuf>,
    pub instag_store: Option<PathBuf>,
    pub ended: Vec<(String, String, InstanceTag)>,
    pub fail_reads: bool,
}

pub fn fingerprint_of(account: &str, protocol: &str) -> Fingerprint {
    let mut fp = [0u8; Fingerprint::LEN];
    for (i, b) in format!("{account}/{protocol}").bytes().enumerate() {
        fp[i % Fingerprint::LEN] ^= b;
    }
    Fingerprint(fp)
}

impl MockEngine {
    fn insert(&mut self, account: &str, protocol: &str) {
        self.keys.insert(
            (account.to_string(), protocol.to_string()),
            KeyInfo {
                accountname: account.to_string(),
                protocol: protocol.to_string(),
                fingerprint: fingerprint_of(account, protocol),
            },
        );
    }

    fn context(account: &str, protocol: &str, contact: &str) -> ConnContext {
        ConnContext {
            accountname: account.to_string(),
            protocol: protocol.to_string(),
            contactname: contact.to_string(),
            our_instance: OUR_INSTANCE,
            their_instance: THEIR_INSTANCE,
        }
    }
}

impl Engine for MockEngine {
    fn set_key_store(&mut self, path: &Path) {
        self.key_store = Some(path.to_path_buf());
    }

    fn set_instag_store(&mut self, path: &Path) {
        self.instag_store = Some(path.to_path_buf());
    }

    fn read_privkeys(&mut self, path: &Path) -> Result<(), EngineError> {
        if self.fail_reads {
            return Err(anyhow::anyhow!("corrupt key store").into());
        }
        let contents = fs::read_to_string(path)?;
        for line in contents.lines() {
            if let Some((account, protocol)) = line.split_once('\t') {
                self.insert(account, protocol);
            }
        }
        Ok(())
    }

    fn read_instags(&mut self, path: &Path) -> Result<(), EngineError> {
        self.instag_files.push(path.to_path_buf());
        Ok(())
    }

    fn generate_privkey(
        &mut self,
        account: &str,
        protocol: &str,
        key_store: Option<&Path>,
    ) -> Result<(), EngineError> {
        self.insert(account, protocol);
        if let Some(path) = key_store {
            let mut lines: Vec<String> = self
                .keys
                .values()
                .map(|k| format!("{}\t{}\n", k.accountname, k.protocol))
                .collect();
            lines.sort();
            fs::write(path, lines.concat())?;
        }
        Ok(())
    }

    fn find_privkey(&self, account: &str, protocol: &str) -> Option<KeyInfo> {
        self.keys
            .get(&(account.to_string(), protocol.to_string()))
            .cloned()
    }

    fn forget_privkey(&mut self, account: &str, protocol: &str) -> bool {
        self.keys
            .remove(&(account.to_string(), protocol.to_string()))
            .is_some()
    }

    fn forget_all(&mut self) {
        self.keys.clear();
    }

    fn send_message(
        &mut self,
        ops: &dyn MessageOps,
        message: OutboundMessage<'_>,
    ) -> Result<EngineOutput, EngineError> {
        self.sent.push(SentRecord {
            account: message.account.to_string(),
            contact: message.contact.to_string(),
            text: message.text.to_string(),
            instance: message.instance,
            frag_policy: message.frag_policy,
        });
        let context = Self::context(message.account, message.protocol, message.contact);
        let wire = match ops.policy(message.account, message.contact) {
            None => {
                return Err(EngineError::UnknownContact {
                    account: message.account.to_string(),
                    contact: message.contact.to_string(),
                })
            }
            Some(Policy::Never | Policy::Manual) => message.text.to_string(),
            Some(_) => {
                let wire = format!("?OTR:{}.", message.text);
                ops.inject_message(message.account, message.contact, &wire);
                wire
            }
        };
        Ok(EngineOutput {
            message: Some(wire),
            context,
        })
    }

    fn receive_message(
        &mut self,
        ops: &dyn MessageOps,
        message: InboundMessage<'_>,
    ) -> Result<EngineOutput, EngineError> {
        let context = Self::context(message.account, message.protocol, message.contact);
        let text = message.text;
        let plain = if let Some(inner) = text.strip_prefix("?OTR:") {
            Some(inner.trim_end_matches('.').to_string())
        } else if text.starts_with("?OTRv") {
            ops.inject_message(message.account, message.contact, "?OTR:commit.");
            ops.handle_event(
                message.account,
                message.contact,
                EngineEvent::GoneSecure {
                    their_fingerprint: fingerprint_of(message.contact, message.protocol),
                },
            );
            None
        } else {
            Some(text.to_string())
        };
        Ok(EngineOutput {
            message: plain,
            context,
        })
    }

    fn end_session(
        &mut self,
        ops: &dyn MessageOps,
        account: &str,
        _protocol: &str,
        contact: &str,
        instance: InstanceTag,
    ) -> Result<(), EngineError> {
        self.ended
            .push((account.to_string(), contact.to_string(), instance));
        if ops.is_logged_in(account, contact) != Some(false) {
            ops.inject_message(account, contact, "?OTR:end.");
        }
        Ok(())
    }
}
