//! Core types shared by the cache stores and the strategy executor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::net::Response;

/// A response as it sits in a cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn new(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      cached_at,
    }
  }

  /// Fresh iff `now - cached_at < max_age`. Entries from the future count as age zero.
  pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    let age = (now - self.cached_at).to_std().unwrap_or_default();
    age < max_age
  }
}

/// Result of running a strategy, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: Response,
  pub source: CacheSource,
  /// When the served entry was cached (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(cached: CachedResponse, is_stale: bool) -> Self {
    Self {
      response: cached.response,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached.cached_at),
    }
  }

  /// Network failed, serving whatever the cache had.
  pub fn offline(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Offline,
      cached_at: Some(cached.cached_at),
    }
  }

  pub fn fallback(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cached entry within its max-age
  CacheFresh,
  /// Cached entry past its max-age (served while revalidating)
  CacheStale,
  /// Network unavailable, serving cached data
  Offline,
  /// Neither network nor cache; synthesized placeholder
  Fallback,
}
