//! Per-protocol client: account bookkeeping and the send/receive decision
//! logic around the engine.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::Deref;

use murmur_protocol::types::Policy;
use tracing::{debug, warn};

use crate::account::{Account, Contact};
use crate::config::{ClientConfig, InjectFn, ReceivedFn};
use crate::context::Context;
use crate::engine::{
    lock, Engine, EngineEvent, InboundMessage, MessageOps, OutboundMessage, SharedEngine,
};
use crate::error::{ConfigError, ResolutionError, SessionError};
use crate::instance::Instance;
use crate::policy::{FragPolicy, FragSelector};

/// Per-call overrides for [`Client::send`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Target instance, `best` when unset.
    pub instance: Option<Instance>,
    /// Fragmentation override, the client's policy when unset.
    pub frag_policy: Option<FragSelector>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance(mut self, instance: impl Into<Instance>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn frag_policy(mut self, selector: impl Into<FragSelector>) -> Self {
        self.frag_policy = Some(selector.into());
        self
    }
}

/// Engine callback raised during a send or receive, delivered once the
/// engine call has returned.
#[derive(Debug)]
enum Deferred {
    Inject {
        account: String,
        contact: String,
        message: String,
    },
    Event {
        account: String,
        contact: String,
        event: EngineEvent,
    },
}

/// [`MessageOps`] view over a client's accounts for the length of one
/// engine call.
struct ClientOps<'a> {
    accounts: &'a HashMap<String, Account>,
    max_message_size: Option<usize>,
    queue: RefCell<Vec<Deferred>>,
}

impl<'a> ClientOps<'a> {
    fn contact(&self, account: &str, contact: &str) -> Option<&'a Contact> {
        self.accounts.get(account)?.find_contact(contact)
    }

    fn into_deferred(self) -> Vec<Deferred> {
        self.queue.into_inner()
    }
}

impl MessageOps for ClientOps<'_> {
    fn policy(&self, account: &str, contact: &str) -> Option<Policy> {
        self.contact(account, contact).map(Contact::policy)
    }

    fn is_logged_in(&self, account: &str, contact: &str) -> Option<bool> {
        self.contact(account, contact).map(Contact::is_logged_in)
    }

    fn inject_message(&self, account: &str, contact: &str, message: &str) {
        self.queue.borrow_mut().push(Deferred::Inject {
            account: account.to_string(),
            contact: contact.to_string(),
            message: message.to_string(),
        });
    }

    fn max_message_size(&self) -> Option<usize> {
        self.max_message_size
    }

    fn handle_event(&self, account: &str, contact: &str, event: EngineEvent) {
        self.queue.borrow_mut().push(Deferred::Event {
            account: account.to_string(),
            contact: contact.to_string(),
            event,
        });
    }
}

/// A protocol configuration owning a set of accounts.
pub struct Client<E> {
    engine: SharedEngine<E>,
    protocol: String,
    max_message_size: Option<usize>,
    frag_policy: FragPolicy,
    accounts: HashMap<String, Account>,
    inject: Option<InjectFn>,
    received: Option<ReceivedFn>,
}

impl<E> std::fmt::Debug for Client<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("protocol", &self.protocol)
            .field("max_message_size", &self.max_message_size)
            .field("frag_policy", &self.frag_policy)
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

impl<E> Client<E> {
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn max_message_size(&self) -> Option<usize> {
        self.max_message_size
    }

    pub fn frag_policy(&self) -> FragPolicy {
        self.frag_policy
    }

    pub fn is_fragmenting(&self) -> bool {
        self.frag_policy.fragments()
    }

    pub fn engine(&self) -> &SharedEngine<E> {
        &self.engine
    }

    /// Add an account, replacing any existing account of the same name
    /// together with its contacts.
    pub fn add_account(&mut self, name: &str) -> &mut Account {
        let account = Account::new(name);
        match self.accounts.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(account);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(account),
        }
    }

    pub fn find_account(&self, name: &str) -> Option<&Account> {
        self.accounts.get(name)
    }

    pub fn find_account_mut(&mut self, name: &str) -> Option<&mut Account> {
        self.accounts.get_mut(name)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Mutable access to one contact, for policy and login changes.
    pub fn contact_mut(&mut self, account: &str, contact: &str) -> Option<&mut Contact> {
        self.accounts.get_mut(account)?.find_contact_mut(contact)
    }

    /// Borrowed view of an account that forwards sends and receives here.
    pub fn account(&self, name: &str) -> Option<AccountHandle<'_, E>> {
        self.find_account(name).map(|account| AccountHandle {
            client: self,
            account,
        })
    }

    fn resolve(
        &self,
        account: &str,
        contact: &str,
    ) -> Result<(&Account, &Contact), ResolutionError> {
        let acct = self
            .find_account(account)
            .ok_or_else(|| ResolutionError::UnknownAccount(account.to_string()))?;
        let peer = acct
            .find_contact(contact)
            .ok_or_else(|| ResolutionError::UnknownContact {
                account: account.to_string(),
                contact: contact.to_string(),
            })?;
        Ok((acct, peer))
    }

    fn ops(&self) -> ClientOps<'_> {
        ClientOps {
            accounts: &self.accounts,
            max_message_size: self.max_message_size,
            queue: RefCell::new(Vec::new()),
        }
    }

    fn inject(&self, account: &Account, contact: &Contact, text: &str) {
        match &self.inject {
            Some(inject) => inject(account, contact, text),
            None => debug!(
                account = account.name(),
                contact = contact.name(),
                "no inject callback, dropping outbound text"
            ),
        }
    }

    /// Deliver queued engine callbacks in the order they were raised.
    fn dispatch(&self, deferred: Vec<Deferred>) {
        for item in deferred {
            match item {
                Deferred::Inject {
                    account,
                    contact,
                    message,
                } => match self.resolve(&account, &contact) {
                    Ok((acct, peer)) => self.inject(acct, peer, &message),
                    Err(e) => warn!("dropping injected message: {}", e),
                },
                Deferred::Event {
                    account,
                    contact,
                    event,
                } => match self.resolve(&account, &contact) {
                    Ok((acct, peer)) => {
                        debug!(account = %account, contact = %contact, ?event, "engine event");
                        if let Some(received) = &self.received {
                            received(acct, peer, &event);
                        }
                    }
                    Err(e) => warn!(?event, "dropping engine event: {}", e),
                },
            }
        }
    }
}

impl<E: Engine> Client<E> {
    /// Validate `config` and build a client over `engine`.
    pub fn new(engine: SharedEngine<E>, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            engine,
            protocol: config.protocol,
            max_message_size: config.max_message_size,
            frag_policy: config.frag_policy,
            accounts: HashMap::new(),
            inject: config.inject,
            received: config.received,
        })
    }

    pub fn send(
        &self,
        account: &str,
        contact: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<String, SessionError> {
        self.send_with(account, contact, text, options, |_, _| {})
    }

    /// Hand `text` to the engine and return the wire text it produced.
    ///
    /// Text the engine returns unchanged went out unencrypted and is passed
    /// to the inject callback; anything else was already delivered by the
    /// engine. `on_result` sees the wire text and the conversation leg.
    pub fn send_with<F>(
        &self,
        account: &str,
        contact: &str,
        text: &str,
        options: SendOptions,
        on_result: F,
    ) -> Result<String, SessionError>
    where
        F: FnOnce(&str, &Context<'_>),
    {
        let (acct, peer) = self.resolve(account, contact)?;
        let instance = options.instance.unwrap_or_default().resolve();
        let frag_policy = options
            .frag_policy
            .map(FragSelector::resolve)
            .unwrap_or_else(|| self.frag_policy.code());

        debug!(account, contact, instance, frag_policy, "sending message");
        let ops = self.ops();
        let output = {
            let mut engine = lock(&self.engine)?;
            engine.send_message(
                &ops,
                OutboundMessage {
                    account,
                    protocol: &self.protocol,
                    contact,
                    text,
                    instance,
                    frag_policy,
                },
            )?
        };
        self.dispatch(ops.into_deferred());

        let msg = output.message.unwrap_or_default();
        if msg == text {
            self.inject(acct, peer, text);
        }

        on_result(&msg, &Context::from_conn(acct, peer, &output.context));
        Ok(msg)
    }

    pub fn receive(
        &self,
        account: &str,
        contact: &str,
        text: &str,
    ) -> Result<Option<String>, SessionError> {
        self.receive_with(account, contact, text, |_, _| {})
    }

    /// Hand inbound wire text to the engine. Returns the plaintext for the
    /// user, or `None` for protocol-internal traffic; `on_message` runs only
    /// when there is plaintext.
    pub fn receive_with<F>(
        &self,
        account: &str,
        contact: &str,
        text: &str,
        on_message: F,
    ) -> Result<Option<String>, SessionError>
    where
        F: FnOnce(&str, &Context<'_>),
    {
        let (acct, peer) = self.resolve(account, contact)?;

        let ops = self.ops();
        let output = {
            let mut engine = lock(&self.engine)?;
            engine.receive_message(
                &ops,
                InboundMessage {
                    account,
                    protocol: &self.protocol,
                    contact,
                    text,
                },
            )?
        };
        self.dispatch(ops.into_deferred());

        debug!(
            account,
            contact,
            deliverable = output.message.is_some(),
            "received message"
        );
        if let Some(msg) = &output.message {
            on_message(msg, &Context::from_conn(acct, peer, &output.context));
        }
        Ok(output.message)
    }

    /// End the private conversation with one instance of `contact`.
    pub fn end_session(
        &self,
        account: &str,
        contact: &str,
        instance: impl Into<Instance>,
    ) -> Result<(), SessionError> {
        self.resolve(account, contact)?;
        let instance = instance.into().resolve();

        let ops = self.ops();
        {
            let mut engine = lock(&self.engine)?;
            engine.end_session(&ops, account, &self.protocol, contact, instance)?;
        }
        self.dispatch(ops.into_deferred());
        debug!(account, contact, instance, "ended private conversation");
        Ok(())
    }
}

/// An [`Account`] together with the client that owns it.
pub struct AccountHandle<'a, E> {
    client: &'a Client<E>,
    account: &'a Account,
}

impl<E> Clone for AccountHandle<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for AccountHandle<'_, E> {}

impl<E> Deref for AccountHandle<'_, E> {
    type Target = Account;

    fn deref(&self) -> &Account {
        self.account
    }
}

impl<'a, E> AccountHandle<'a, E> {
    pub fn client(&self) -> &'a Client<E> {
        self.client
    }

    pub fn contact(&self, name: &str) -> Option<ContactHandle<'a, E>> {
        self.account.find_contact(name).map(|contact| ContactHandle {
            account: *self,
            contact,
        })
    }
}

impl<E: Engine> AccountHandle<'_, E> {
    pub fn send(
        &self,
        contact: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<String, SessionError> {
        self.client.send(self.account.name(), contact, text, options)
    }

    pub fn send_with<F>(
        &self,
        contact: &str,
        text: &str,
        options: SendOptions,
        on_result: F,
    ) -> Result<String, SessionError>
    where
        F: FnOnce(&str, &Context<'_>),
    {
        self.client
            .send_with(self.account.name(), contact, text, options, on_result)
    }

    pub fn receive(&self, contact: &str, text: &str) -> Result<Option<String>, SessionError> {
        self.client.receive(self.account.name(), contact, text)
    }

    pub fn receive_with<F>(
        &self,
        contact: &str,
        text: &str,
        on_message: F,
    ) -> Result<Option<String>, SessionError>
    where
        F: FnOnce(&str, &Context<'_>),
    {
        self.client
            .receive_with(self.account.name(), contact, text, on_message)
    }
}

/// A [`Contact`] together with its account and client.
pub struct ContactHandle<'a, E> {
    account: AccountHandle<'a, E>,
    contact: &'a Contact,
}

impl<E> Clone for ContactHandle<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for ContactHandle<'_, E> {}

impl<E> Deref for ContactHandle<'_, E> {
    type Target = Contact;

    fn deref(&self) -> &Contact {
        self.contact
    }
}

impl<'a, E> ContactHandle<'a, E> {
    pub fn account(&self) -> AccountHandle<'a, E> {
        self.account
    }
}

impl<E: Engine> ContactHandle<'_, E> {
    pub fn send(&self, text: &str, options: SendOptions) -> Result<String, SessionError> {
        self.account.send(self.contact.name(), text, options)
    }

    pub fn send_with<F>(
        &self,
        text: &str,
        options: SendOptions,
        on_result: F,
    ) -> Result<String, SessionError>
    where
        F: FnOnce(&str, &Context<'_>),
    {
        self.account
            .send_with(self.contact.name(), text, options, on_result)
    }

    pub fn receive(&self, text: &str) -> Result<Option<String>, SessionError> {
        self.account.receive(self.contact.name(), text)
    }

    pub fn receive_with<F>(
        &self,
        text: &str,
        on_message: F,
    ) -> Result<Option<String>, SessionError>
    where
        F: FnOnce(&str, &Context<'_>),
    {
        self.account
            .receive_with(self.contact.name(), text, on_message)
    }

    pub fn end_session(&self, instance: impl Into<Instance>) -> Result<(), SessionError> {
        self.account
            .client
            .end_session(self.account.name(), self.contact.name(), instance)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use murmur_protocol::types::{INSTAG_BEST, INSTAG_RECENT_SENT};

    use super::*;
    use crate::instance::MetaInstance;
    use crate::mock::{MockEngine, OUR_INSTANCE, THEIR_INSTANCE};

    type Log = Arc<Mutex<Vec<(String, String, String)>>>;

    fn client_with(config: ClientConfig) -> (Client<MockEngine>, Log, Log) {
        let injected: Log = Arc::default();
        let events: Log = Arc::default();
        let inject_log = Arc::clone(&injected);
        let event_log = Arc::clone(&events);
        let config = config
            .on_inject(move |account, contact, text| {
                inject_log.lock().unwrap().push((
                    account.name().to_string(),
                    contact.name().to_string(),
                    text.to_string(),
                ));
            })
            .on_received(move |account, contact, event| {
                event_log.lock().unwrap().push((
                    account.name().to_string(),
                    contact.name().to_string(),
                    format!("{event:?}"),
                ));
            });
        let mut client = Client::new(Arc::new(Mutex::new(MockEngine::default())), config).unwrap();
        let alice = client.add_account("alice");
        alice.add_contact("bob", Policy::Manual);
        alice.add_contact("carol", Policy::Opportunistic);
        (client, injected, events)
    }

    fn entry(account: &str, contact: &str, text: &str) -> (String, String, String) {
        (account.to_string(), contact.to_string(), text.to_string())
    }

    #[test]
    fn supported_frag_policies_read_back() {
        for policy in [FragPolicy::SendAll, FragPolicy::SendSkip] {
            let engine = Arc::new(Mutex::new(MockEngine::default()));
            let client = Client::new(engine, ClientConfig::new().frag_policy(policy)).unwrap();
            assert_eq!(client.frag_policy(), policy);
            assert_eq!(client.is_fragmenting(), policy == FragPolicy::SendAll);
        }
    }

    #[test]
    fn unsupported_frag_policies_rejected() {
        for policy in [FragPolicy::SendAllButFirst, FragPolicy::SendAllButLast] {
            let engine = Arc::new(Mutex::new(MockEngine::default()));
            let err = Client::new(engine, ClientConfig::new().frag_policy(policy)).unwrap_err();
            assert!(matches!(err, ConfigError::UnsupportedFragPolicy(p) if p == policy));
        }
    }

    #[test]
    fn add_account_then_find() {
        let (mut client, _, _) = client_with(ClientConfig::new());
        client.add_account("dave").add_contact("erin", Policy::Never);
        let dave = client.find_account("dave").unwrap();
        assert_eq!(dave.name(), "dave");
        assert!(dave.find_contact("erin").is_some());
    }

    #[test]
    fn add_account_last_write_wins() {
        let (mut client, _, _) = client_with(ClientConfig::new());
        assert!(client.find_account("alice").unwrap().find_contact("bob").is_some());

        client.add_account("alice");
        let alice = client.find_account("alice").unwrap();
        assert!(alice.find_contact("bob").is_none());
        assert_eq!(client.accounts().count(), 1);
    }

    #[test]
    fn unknown_names_fail_resolution() {
        let (client, injected, _) = client_with(ClientConfig::new());
        let err = client
            .send("mallory", "bob", "hi", SendOptions::new())
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Resolution(ResolutionError::UnknownAccount(_))
        ));

        let err = client.receive("alice", "mallory", "hi").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Resolution(ResolutionError::UnknownContact { .. })
        ));
        assert!(injected.lock().unwrap().is_empty());
        assert!(client.engine().lock().unwrap().sent.is_empty());
    }

    #[test]
    fn untransformed_send_is_injected() {
        let (client, injected, _) = client_with(ClientConfig::new());
        let msg = client
            .send("alice", "bob", "hello bob!", SendOptions::new())
            .unwrap();
        assert_eq!(msg, "hello bob!");
        assert_eq!(
            *injected.lock().unwrap(),
            vec![entry("alice", "bob", "hello bob!")]
        );

        let engine = client.engine().lock().unwrap();
        assert_eq!(engine.sent[0].instance, INSTAG_BEST);
        assert_eq!(engine.sent[0].frag_policy, FragPolicy::SendSkip.code());
    }

    #[test]
    fn transformed_send_is_delivered_by_engine_only() {
        let (client, injected, _) = client_with(ClientConfig::new());
        let msg = client
            .send("alice", "carol", "psst", SendOptions::new())
            .unwrap();
        assert_eq!(msg, "?OTR:psst.");
        assert_eq!(
            *injected.lock().unwrap(),
            vec![entry("alice", "carol", "?OTR:psst.")]
        );
    }

    #[test]
    fn send_options_override_defaults() {
        let (client, _, _) = client_with(ClientConfig::new().fragment(true));
        client
            .send("alice", "bob", "a", SendOptions::new())
            .unwrap();
        client
            .send(
                "alice",
                "bob",
                "b",
                SendOptions::new()
                    .instance(MetaInstance::RecentSent)
                    .frag_policy(FragPolicy::SendSkip),
            )
            .unwrap();
        client
            .send(
                "alice",
                "bob",
                "c",
                SendOptions::new().instance(0x1234u32).frag_policy(3u32),
            )
            .unwrap();

        let engine = client.engine().lock().unwrap();
        let seen: Vec<(u32, u32)> = engine
            .sent
            .iter()
            .map(|s| (s.instance, s.frag_policy))
            .collect();
        assert_eq!(
            seen,
            [(INSTAG_BEST, 1), (INSTAG_RECENT_SENT, 0), (0x1234, 3)]
        );
    }

    #[test]
    fn send_with_reports_context() {
        let (client, _, _) = client_with(ClientConfig::new());
        let mut seen = None;
        client
            .send_with("alice", "bob", "hi", SendOptions::new(), |msg, ctx| {
                seen = Some((
                    msg.to_string(),
                    ctx.accountname().to_string(),
                    ctx.username().to_string(),
                    ctx.our_instance,
                    ctx.their_instance,
                ));
            })
            .unwrap();
        assert_eq!(
            seen,
            Some((
                "hi".to_string(),
                "alice".to_string(),
                "bob".to_string(),
                OUR_INSTANCE,
                THEIR_INSTANCE
            ))
        );
    }

    #[test]
    fn receive_plaintext_runs_callback() {
        let (client, _, _) = client_with(ClientConfig::new());
        let mut seen = None;
        let msg = client
            .receive_with("alice", "carol", "?OTR:hello alice!.", |msg, ctx| {
                seen = Some((msg.to_string(), ctx.contactname().to_string()));
            })
            .unwrap();
        assert_eq!(msg.as_deref(), Some("hello alice!"));
        assert_eq!(seen, Some(("hello alice!".to_string(), "carol".to_string())));
    }

    #[test]
    fn receive_control_traffic_skips_callback() {
        let (client, injected, events) = client_with(ClientConfig::new());
        let mut called = false;
        let msg = client
            .receive_with("alice", "carol", "?OTRv3?", |_, _| called = true)
            .unwrap();
        assert!(msg.is_none());
        assert!(!called);
        assert_eq!(
            *injected.lock().unwrap(),
            vec![entry("alice", "carol", "?OTR:commit.")]
        );
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].2.starts_with("GoneSecure"));
    }

    #[test]
    fn callbacks_run_after_engine_lock_released() {
        let engine = Arc::new(Mutex::new(MockEngine::default()));
        let watched = Arc::clone(&engine);
        let unlocked = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&unlocked);
        let config = ClientConfig::new().on_inject(move |_, _, _| {
            record.lock().unwrap().push(watched.try_lock().is_ok());
        });
        let mut client = Client::new(engine, config).unwrap();
        client
            .add_account("alice")
            .add_contact("carol", Policy::Always);

        client
            .send("alice", "carol", "secret", SendOptions::new())
            .unwrap();
        assert_eq!(*unlocked.lock().unwrap(), vec![true]);
    }

    #[test]
    fn handles_forward_to_client() {
        let (client, injected, _) = client_with(ClientConfig::new());
        let alice = client.account("alice").unwrap();
        assert_eq!(alice.name(), "alice");
        assert!(client.account("mallory").is_none());
        assert!(alice.contact("mallory").is_none());

        let bob = alice.contact("bob").unwrap();
        assert_eq!(bob.policy(), Policy::Manual);
        assert_eq!(bob.account().name(), "alice");
        bob.send("via contact", SendOptions::new()).unwrap();
        alice.send("bob", "via account", SendOptions::new()).unwrap();
        assert_eq!(
            bob.receive("plain").unwrap().as_deref(),
            Some("plain")
        );

        assert_eq!(
            *injected.lock().unwrap(),
            vec![
                entry("alice", "bob", "via contact"),
                entry("alice", "bob", "via account"),
            ]
        );
    }

    #[test]
    fn contact_state_is_visible_to_engine() {
        let (mut client, injected, _) = client_with(ClientConfig::new());
        client.end_session("alice", "carol", MetaInstance::Best).unwrap();
        assert!(injected.lock().unwrap().is_empty());

        client.contact_mut("alice", "carol").unwrap().log_in();
        client
            .account("alice")
            .unwrap()
            .contact("carol")
            .unwrap()
            .end_session(0x300u32)
            .unwrap();
        assert_eq!(
            *injected.lock().unwrap(),
            vec![entry("alice", "carol", "?OTR:end.")]
        );
        let engine = client.engine().lock().unwrap();
        assert_eq!(engine.ended[0].2, INSTAG_BEST);
        assert_eq!(engine.ended[1].2, 0x300);
    }

    #[test]
    fn policy_change_alters_routing() {
        let (mut client, _, _) = client_with(ClientConfig::new());
        client
            .contact_mut("alice", "bob")
            .unwrap()
            .set_policy(Policy::Opportunistic);
        let msg = client
            .send("alice", "bob", "hi", SendOptions::new())
            .unwrap();
        assert_eq!(msg, "?OTR:hi.");
    }
}
