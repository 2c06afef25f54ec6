//! All protocol state towards one contact: a master session used before the
//! peer's instance is known, one child session per peer instance, and the
//! conversation-wide bits shared between them.

use std::collections::{BTreeMap, HashSet};

use murmur_protocol::fragment::FragmentAssembler;
use murmur_protocol::types::{
    InstanceTag, INSTAG_BEST, INSTAG_MASTER, INSTAG_RECENT, INSTAG_RECENT_RECEIVED,
    INSTAG_RECENT_SENT,
};
use murmur_session::Fingerprint;

use crate::session::Session;

/// Whether we advertised protocol support with a whitespace tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    NotSent,
    Sent,
    /// The peer answered a tagged message with untagged plaintext.
    Rejected,
}

pub struct Conversation {
    pub our_instance: InstanceTag,
    pub master: Session,
    pub children: BTreeMap<InstanceTag, Session>,
    /// Message held back until a private conversation is established.
    pub pending: Option<String>,
    pub offer: Offer,
    pub assembler: FragmentAssembler,
    pub known_fingerprints: HashSet<Fingerprint>,
}

impl Conversation {
    pub fn new(our_instance: InstanceTag) -> Self {
        Self {
            our_instance,
            master: Session::new(INSTAG_MASTER),
            children: BTreeMap::new(),
            pending: None,
            offer: Offer::NotSent,
            assembler: FragmentAssembler::new(),
            known_fingerprints: HashSet::new(),
        }
    }

    /// Resolve a requested instance to the session that should carry it.
    /// Meta instances fall back to the master session while no peer
    /// instance is known; `None` means an unknown concrete instance.
    pub fn select(&self, instance: InstanceTag) -> Option<InstanceTag> {
        let newest = |key: fn(&Session) -> (bool, u64, u64)| {
            self.children
                .values()
                .max_by_key(|s| key(s))
                .map_or(INSTAG_MASTER, |s| s.their_instance)
        };
        match instance {
            INSTAG_MASTER => Some(INSTAG_MASTER),
            INSTAG_BEST => Some(newest(|s| (s.is_encrypted(), s.last_received, s.last_sent))),
            INSTAG_RECENT => Some(newest(|s| {
                (false, s.last_received.max(s.last_sent), s.last_received)
            })),
            INSTAG_RECENT_RECEIVED => Some(newest(|s| (false, s.last_received, 0))),
            INSTAG_RECENT_SENT => Some(newest(|s| (false, s.last_sent, 0))),
            tag if self.children.contains_key(&tag) => Some(tag),
            _ => None,
        }
    }

    pub fn session_mut(&mut self, their_instance: InstanceTag) -> Option<&mut Session> {
        if their_instance == INSTAG_MASTER {
            Some(&mut self.master)
        } else {
            self.children.get_mut(&their_instance)
        }
    }

    /// The child session for `their_instance`, created on first contact. A
    /// new child inherits any exchange the master session started.
    pub fn child(&mut self, their_instance: InstanceTag) -> &mut Session {
        let master = &mut self.master;
        self.children.entry(their_instance).or_insert_with(|| {
            let mut session = Session::new(their_instance);
            session.auth = std::mem::take(&mut master.auth);
            session
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.children.values().any(Session::is_encrypted)
    }
}
