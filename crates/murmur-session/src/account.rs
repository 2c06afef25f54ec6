use std::collections::hash_map::Entry;
use std::collections::HashMap;

use murmur_protocol::types::Policy;

/// A peer of an [`Account`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    name: String,
    policy: Policy,
    logged_in: bool,
}

impl Contact {
    pub(crate) fn new(name: impl Into<String>, policy: Policy) -> Self {
        Self {
            name: name.into(),
            policy,
            logged_in: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: Policy) -> &mut Self {
        self.policy = policy;
        self
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn log_in(&mut self) -> &mut Self {
        self.logged_in = true;
        self
    }

    pub fn log_out(&mut self) -> &mut Self {
        self.logged_in = false;
        self
    }
}

/// A local identity under a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    name: String,
    contacts: HashMap<String, Contact>,
}

impl Account {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contacts: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a contact, replacing any existing contact of the same name.
    pub fn add_contact(&mut self, name: &str, policy: Policy) -> &mut Contact {
        let contact = Contact::new(name, policy);
        match self.contacts.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(contact);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(contact),
        }
    }

    pub fn find_contact(&self, name: &str) -> Option<&Contact> {
        self.contacts.get(name)
    }

    pub fn find_contact_mut(&mut self, name: &str) -> Option<&mut Contact> {
        self.contacts.get_mut(name)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }
}
