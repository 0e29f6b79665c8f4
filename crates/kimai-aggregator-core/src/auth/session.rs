use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Credential, CredentialStore, Keychain, LogoutBus};

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub username: String,
    pub access_token: String,
    /// Only written to the file when the keychain is disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionData {
    pub fn new(username: impl Into<String>, credential: Credential) -> Self {
        Self {
            username: username.into(),
            access_token: credential.access_token,
            refresh_token: credential.refresh_token,
            created_at: Utc::now(),
        }
    }

    pub fn credential(&self) -> Credential {
        Credential::new(self.access_token.clone(), self.refresh_token.clone())
    }
}

/// Persisted login state.
///
/// The access token and username go to `session.json`; the refresh token goes
/// to the OS keychain unless the session was built with `without_keychain`.
pub struct Session {
    data_dir: PathBuf,
    use_keychain: bool,
    pub data: Option<SessionData>,
}

impl Session {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            use_keychain: true,
            data: None,
        }
    }

    /// Keep the refresh token in the session file (headless hosts, tests)
    pub fn without_keychain(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            use_keychain: false,
            data: None,
        }
    }

    /// Load session from disk
    pub fn load(&mut self) -> Result<bool> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(false);
        }

        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let mut data: SessionData =
            serde_json::from_str(&contents).context("Failed to parse session file")?;

        if self.use_keychain {
            match Keychain::refresh_token(&data.username) {
                Ok(token) => data.refresh_token = token,
                Err(e) => warn!(error = %e, "Refresh token unavailable, session cannot be renewed"),
            }
        }

        self.data = Some(data);
        Ok(true)
    }

    /// Save session to disk
    pub fn save(&self) -> Result<()> {
        let Some(ref data) = self.data else {
            return Ok(());
        };

        let path = self.session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut on_disk = data.clone();
        if self.use_keychain {
            if let Some(token) = on_disk.refresh_token.take() {
                Keychain::store_refresh_token(&data.username, &token)?;
            }
        }

        let contents = serde_json::to_string_pretty(&on_disk)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Clear session data on disk and in the keychain
    pub fn clear(&mut self) -> Result<()> {
        if let Some(data) = self.data.take() {
            if self.use_keychain {
                Keychain::delete(&data.username)?;
            }
        }
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn update(&mut self, data: SessionData) {
        self.data = Some(data);
    }

    /// Replace the stored tokens, keeping username and creation time
    pub fn update_credential(&mut self, credential: Credential) {
        if let Some(ref mut data) = self.data {
            data.access_token = credential.access_token;
            data.refresh_token = credential.refresh_token;
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.username.as_str())
    }

    /// Seed the credential store from the persisted session
    pub fn restore_into(&self, store: &CredentialStore) -> bool {
        match self.data {
            Some(ref data) => {
                store.set(data.credential());
                true
            }
            None => false,
        }
    }

    fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }
}

/// Keep the persisted session in step with the credential store.
///
/// Every credential change (login, refresh) is saved; a logout event clears
/// the store and deletes the session. The task ends once every `LogoutBus`
/// clone is dropped.
pub fn spawn_session_sync(
    session: Arc<Mutex<Session>>,
    store: CredentialStore,
    logout: &LogoutBus,
) -> JoinHandle<()> {
    let mut credentials = store.subscribe();
    let mut logouts = logout.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = credentials.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = credentials.borrow_and_update().clone();
                    if let Some(credential) = current {
                        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
                        session.update_credential(credential);
                        if let Err(e) = session.save() {
                            warn!(error = %e, "Failed to save session");
                        } else {
                            debug!("Session saved after credential change");
                        }
                    }
                }
                event = logouts.recv() => {
                    match event {
                        Ok(()) | Err(RecvError::Lagged(_)) => {
                            info!("Logout event received, clearing session");
                            store.clear();
                            // Drop the cleared value so the next iteration does not re-save it
                            credentials.borrow_and_update();
                            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
                            if let Err(e) = session.clear() {
                                warn!(error = %e, "Failed to clear session");
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    })
}
