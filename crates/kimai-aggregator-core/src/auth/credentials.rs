use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Bearer credential pair. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }
}

/// Observable holder of the current credential.
///
/// Clones share the same state. Every outbound request reads `current()` at
/// send time, so a refresh finished by one task is seen by all others.
/// Subscribers are notified on every `set`/`clear`.
#[derive(Clone)]
pub struct CredentialStore {
    tx: Arc<watch::Sender<Option<Credential>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn with_credential(credential: Credential) -> Self {
        let store = Self::new();
        store.set(credential);
        store
    }

    pub fn current(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|c| c.access_token.clone())
    }

    pub fn set(&self, credential: Credential) {
        self.tx.send_replace(Some(credential));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
