//! Named, versioned cache stores on top of a [`CacheStorage`] backend.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use super::storage::{CacheStorage, StoredEntry};
use super::traits::CachedResponse;
use crate::net::{Request, Response};

/// Naming scheme for the engine's partitions.
///
/// Versioned partitions are `{prefix}-{partition}-v{version}`; the sync queue
/// is unversioned so pending mutations survive an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNames {
  prefix: String,
  version: String,
}

impl StoreNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      version: version.to_string(),
    }
  }

  /// App shell and long-lived assets
  pub fn static_store(&self) -> String {
    format!("{}-static-v{}", self.prefix, self.version)
  }

  /// API responses
  pub fn dynamic_store(&self) -> String {
    format!("{}-dynamic-v{}", self.prefix, self.version)
  }

  pub fn sync_queue_store(&self) -> String {
    format!("{}-sync-queue", self.prefix)
  }

  /// Stores holding cached responses for the current version.
  pub fn response_stores(&self) -> [String; 2] {
    [self.static_store(), self.dynamic_store()]
  }

  /// Every store that belongs to the current version.
  pub fn current(&self) -> [String; 3] {
    [
      self.static_store(),
      self.dynamic_store(),
      self.sync_queue_store(),
    ]
  }

  /// Whether a store was created by this engine (any version).
  pub fn is_managed(&self, name: &str) -> bool {
    name
      .strip_prefix(self.prefix.as_str())
      .is_some_and(|rest| rest.starts_with('-'))
  }

  /// Managed, but not part of the current version.
  pub fn is_stale(&self, name: &str) -> bool {
    self.is_managed(name) && !self.current().iter().any(|c| c == name)
  }
}

/// Cache store manager: get/put/evict/clear over named stores.
pub struct CacheStoreManager<S: CacheStorage> {
  storage: Arc<S>,
  names: StoreNames,
}

impl<S: CacheStorage> CacheStoreManager<S> {
  pub fn new(storage: S, names: StoreNames) -> Self {
    Self {
      storage: Arc::new(storage),
      names,
    }
  }

  pub fn names(&self) -> &StoreNames {
    &self.names
  }

  pub fn open_store(&self, store: &str) -> Result<()> {
    self.storage.open_store(store)
  }

  /// Look up a request. Freshness is the caller's concern.
  pub fn get(&self, request: &Request, store: &str) -> Result<Option<CachedResponse>> {
    if !request.is_get() {
      return Ok(None);
    }
    self.storage.get_entry(store, &request.cache_key())
  }

  /// Store a response stamped with the current time.
  ///
  /// Returns `false` without writing when the request is not a GET or the
  /// response is not a success.
  pub fn put(&self, request: &Request, response: &Response, store: &str) -> Result<bool> {
    if !request.is_get() || !response.is_success() {
      debug!(
        url = %request.url,
        status = response.status,
        "Not caching response"
      );
      return Ok(false);
    }

    let entry = StoredEntry {
      key: request.cache_key(),
      url: request.url.to_string(),
      cached: CachedResponse::new(response.clone(), Utc::now()),
    };
    self.storage.put_entries(store, &[entry])?;
    Ok(true)
  }

  /// Store several responses in one transaction. Fails without writing
  /// anything if any of them is not cacheable.
  pub fn put_all(&self, store: &str, pairs: &[(Request, Response)]) -> Result<()> {
    let now = Utc::now();
    let entries = pairs
      .iter()
      .map(|(request, response)| {
        if !request.is_get() || !response.is_success() {
          return Err(eyre!(
            "Refusing to cache {} {} (status {})",
            request.method,
            request.url,
            response.status
          ));
        }
        Ok(StoredEntry {
          key: request.cache_key(),
          url: request.url.to_string(),
          cached: CachedResponse::new(response.clone(), now),
        })
      })
      .collect::<Result<Vec<_>>>()?;

    self.storage.put_entries(store, &entries)
  }

  /// Remove every entry whose URL matches `pattern`.
  pub fn evict_by_pattern(&self, store: &str, pattern: &Regex) -> Result<usize> {
    let keys: Vec<String> = self
      .storage
      .entry_urls(store)?
      .into_iter()
      .filter(|(_, url)| pattern.is_match(url))
      .map(|(key, _)| key)
      .collect();

    if keys.is_empty() {
      return Ok(0);
    }

    let removed = self.storage.delete_entries(store, &keys)?;
    debug!(store, removed, pattern = pattern.as_str(), "Evicted entries");
    Ok(removed)
  }

  pub fn delete_store(&self, store: &str) -> Result<bool> {
    self.storage.delete_store(store)
  }

  pub fn list_stores(&self) -> Result<Vec<String>> {
    self.storage.store_names()
  }

  pub fn entry_count(&self, store: &str) -> Result<usize> {
    self.storage.count_entries(store)
  }
}

impl<S: CacheStorage> Clone for CacheStoreManager<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
    }
  }
}
