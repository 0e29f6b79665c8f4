//! HTTP access to the backend and to Kimai.
//!
//! This module provides the `AuthenticatedClient`, which attaches the current
//! bearer token to every request and transparently recovers from token expiry
//! with a single coordinated refresh. `AuthApi` implements login, registration
//! and logout; `KimaiApi` reads projects and timesheets from Kimai.

pub mod auth;
pub mod client;
pub mod error;
pub mod kimai;
mod tokens;

pub use auth::AuthApi;
pub use client::{AuthenticatedClient, AuthenticatedClientBuilder};
pub use error::{ApiError, RefreshError};
pub use kimai::KimaiApi;
