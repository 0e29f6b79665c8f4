//! Core library for the Kimai Aggregator desktop dashboard.
//!
//! This crate holds everything below the UI layer:
//!
//! - `api`: the authenticated backend client with single-flight token refresh,
//!   the auth endpoints and the Kimai REST API
//! - `auth`: the observable credential store, logout event bus and session persistence
//! - `queue`: the durable offline operation queue and its key-value storage
//! - `cache`: JSON caching of Kimai data for offline display
//! - `models`: Kimai entities and project progress summaries
//! - `sync`: send-or-queue mutations and queue draining

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod queue;
pub mod sync;

pub use api::{ApiError, AuthApi, AuthenticatedClient, KimaiApi};
pub use auth::{Credential, CredentialStore, LogoutBus, Session};
pub use cache::CacheManager;
pub use config::{Config, QueueConfig};
pub use queue::{FileStore, KeyValueStore, MemoryStore, OfflineQueue, OperationType, QueuedOperation};
pub use sync::{SaveOutcome, SyncService};
