//! Authentication state shared across the application.
//!
//! This module provides:
//! - `CredentialStore`: the observable holder of the current bearer credential
//! - `LogoutBus`: the event fired when a session cannot be recovered
//! - `Session`: on-disk persistence of the login, refresh token in the OS keychain
//!
//! Only the auth flows (login, register, refresh, logout) write the store.

pub mod credentials;
pub mod events;
pub mod keychain;
pub mod session;

pub use credentials::{Credential, CredentialStore};
pub use events::LogoutBus;
pub use keychain::Keychain;
pub use session::{spawn_session_sync, Session, SessionData};
