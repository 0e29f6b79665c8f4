//! Local caching module for offline data access.
//!
//! This module provides the `CacheManager` for storing and retrieving
//! Kimai data locally. Data is cached in JSON format and considered
//! stale after 60 minutes.
//!
//! Cached data types include:
//! - Projects
//! - Activities
//! - Timesheets

pub mod manager;

pub use manager::{CacheAges, CacheKind, CacheManager, CachedData};
