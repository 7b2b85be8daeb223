//! Request caching for offline support.
//!
//! This module provides:
//! - Named, versioned cache stores over a storage backend (SQLite)
//! - Strategy selection per request (URL pattern + destination)
//! - The four strategy protocols and offline fallbacks

mod layer;
mod storage;
mod store;
mod strategy;
mod traits;

pub use layer::{BackgroundTasks, StrategyExecutor};
pub use storage::{CacheStorage, SqliteStorage, StoredEntry};
pub use store::{CacheStoreManager, StoreNames};
pub use strategy::{
  Category, LiveStrategies, Strategy, StrategyConfig, StrategySelector, StrategyTable,
  StrategyTableUpdate,
};
pub use traits::{CacheResult, CacheSource, CachedResponse};
