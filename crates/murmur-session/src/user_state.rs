use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::client::Client;
use crate::config::{ClientConfig, UserStateOptions};
use crate::engine::{lock, Engine, EngineError, Fingerprint, KeyInfo, SharedEngine};
use crate::error::SessionError;

fn is_non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Top-level per-user container: the engine, its key store, and the
/// clients created against them.
pub struct UserState<E> {
    engine: SharedEngine<E>,
    options: UserStateOptions,
    clients: Vec<Client<E>>,
}

impl<E> fmt::Debug for UserState<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserState")
            .field("options", &self.options)
            .field("clients", &self.clients)
            .finish()
    }
}

impl<E: Engine> UserState<E> {
    /// Wrap `engine`, point it at the configured stores and load whichever
    /// of them exist and are non-empty. A store that fails to load is logged
    /// and skipped.
    pub fn new(mut engine: E, options: UserStateOptions) -> Self {
        if let Some(path) = options.key_store.as_deref() {
            engine.set_key_store(path);
        }
        if let Some(path) = options.instag_store.as_deref() {
            engine.set_instag_store(path);
        }
        let engine = Arc::new(Mutex::new(engine));

        if let Some(path) = options.key_store.as_deref().filter(|p| is_non_empty(p)) {
            match lock(&engine).and_then(|mut e| e.read_privkeys(path)) {
                Ok(()) => info!(path = %path.display(), "loaded private keys"),
                Err(e) => warn!(path = %path.display(), "failed to load private keys: {}", e),
            }
        }
        if let Some(path) = options.instag_store.as_deref().filter(|p| is_non_empty(p)) {
            match lock(&engine).and_then(|mut e| e.read_instags(path)) {
                Ok(()) => info!(path = %path.display(), "loaded instance tags"),
                Err(e) => warn!(path = %path.display(), "failed to load instance tags: {}", e),
            }
        }

        Self {
            engine,
            options,
            clients: Vec::new(),
        }
    }

    pub fn options(&self) -> &UserStateOptions {
        &self.options
    }

    pub fn engine(&self) -> &SharedEngine<E> {
        &self.engine
    }

    /// Generate a key for (account, protocol), persisting to the configured
    /// key store if there is one.
    pub fn generate_privkey(&self, account: &str, protocol: &str) -> Result<(), EngineError> {
        lock(&self.engine)?.generate_privkey(account, protocol, self.options.key_store.as_deref())?;
        info!(account, protocol, "generated private key");
        Ok(())
    }

    /// Generate a key for (account, protocol) and write the key store to `path`.
    pub fn generate_privkey_to(
        &self,
        account: &str,
        protocol: &str,
        path: &Path,
    ) -> Result<(), EngineError> {
        lock(&self.engine)?.generate_privkey(account, protocol, Some(path))?;
        info!(account, protocol, path = %path.display(), "generated private key");
        Ok(())
    }

    /// Load additional keys from `path`.
    pub fn read_privkeys(&self, path: &Path) -> Result<(), EngineError> {
        lock(&self.engine)?.read_privkeys(path)
    }

    /// `Ok(None)` when the engine holds no such key.
    pub fn find_privkey(
        &self,
        account: &str,
        protocol: &str,
    ) -> Result<Option<PrivKey<E>>, EngineError> {
        let info = lock(&self.engine)?.find_privkey(account, protocol);
        Ok(info.map(|info| PrivKey {
            engine: Arc::clone(&self.engine),
            info,
        }))
    }

    /// Drop every key held in memory. Key store files are left alone.
    pub fn forget_all(&self) -> Result<(), EngineError> {
        lock(&self.engine)?.forget_all();
        info!("forgot all private keys");
        Ok(())
    }

    pub fn create_client(&mut self, config: ClientConfig) -> Result<&mut Client<E>, SessionError> {
        let client = Client::new(Arc::clone(&self.engine), config)?;
        info!(
            protocol = client.protocol(),
            frag_policy = %client.frag_policy(),
            "created client"
        );
        self.clients.push(client);
        let index = self.clients.len() - 1;
        Ok(&mut self.clients[index])
    }

    /// Clients in creation order.
    pub fn each_client(&self) -> impl Iterator<Item = &Client<E>> {
        self.clients.iter()
    }

    pub fn client(&self, index: usize) -> Option<&Client<E>> {
        self.clients.get(index)
    }

    pub fn client_mut(&mut self, index: usize) -> Option<&mut Client<E>> {
        self.clients.get_mut(index)
    }
}

/// Handle to a private key held by the engine.
pub struct PrivKey<E> {
    engine: SharedEngine<E>,
    info: KeyInfo,
}

impl<E> Clone for PrivKey<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            info: self.info.clone(),
        }
    }
}

impl<E> fmt::Debug for PrivKey<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivKey").field("info", &self.info).finish()
    }
}

impl<E: Engine> PrivKey<E> {
    pub fn accountname(&self) -> &str {
        &self.info.accountname
    }

    pub fn protocol(&self) -> &str {
        &self.info.protocol
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.info.fingerprint
    }

    /// Remove this key from the engine. Returns false if it was already gone.
    pub fn forget(self) -> Result<bool, EngineError> {
        Ok(lock(&self.engine)?.forget_privkey(&self.info.accountname, &self.info.protocol))
    }
}
