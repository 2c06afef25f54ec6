use murmur_protocol::types::InstanceTag;

use crate::account::{Account, Contact};
use crate::engine::ConnContext;

/// One conversation leg, handed to send/receive result callbacks.
/// Borrows from the client for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub account: &'a Account,
    pub contact: &'a Contact,
    pub our_instance: InstanceTag,
    pub their_instance: InstanceTag,
}

impl<'a> Context<'a> {
    pub(crate) fn from_conn(account: &'a Account, contact: &'a Contact, conn: &ConnContext) -> Self {
        Self {
            account,
            contact,
            our_instance: conn.our_instance,
            their_instance: conn.their_instance,
        }
    }

    pub fn accountname(&self) -> &'a str {
        self.account.name()
    }

    pub fn contactname(&self) -> &'a str {
        self.contact.name()
    }

    /// Same as [`contactname`](Self::contactname).
    pub fn username(&self) -> &'a str {
        self.contactname()
    }
}
