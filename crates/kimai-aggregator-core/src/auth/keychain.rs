use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "kimai-aggregator";

/// Refresh tokens live in the OS keychain rather than the session file.
pub struct Keychain;

impl Keychain {
    /// Store the refresh token for a username in the OS keychain
    pub fn store_refresh_token(username: &str, token: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(token)
            .context("Failed to store refresh token in keychain")?;
        Ok(())
    }

    /// Retrieve the refresh token for a username, `None` when nothing is stored
    pub fn refresh_token(username: &str) -> Result<Option<String>> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        match entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve refresh token from keychain"),
        }
    }

    /// Delete the stored refresh token. Missing entries are not an error.
    pub fn delete(username: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete refresh token from keychain"),
        }
    }
}
