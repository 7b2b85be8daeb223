//! Strategy executor: runs a caching strategy against the stores and the network.

use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use super::storage::CacheStorage;
use super::store::CacheStoreManager;
use super::strategy::{Strategy, StrategyConfig};
use super::traits::{CacheResult, CachedResponse};
use crate::net::{Destination, Network, Request, Response};

const OFFLINE_PAGE: &str = "/offline.html";

const OFFLINE_IMAGE: &str = concat!(
  r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200">"##,
  r##"<rect width="200" height="200" fill="#f0f0f0"/>"##,
  r##"<text x="50%" y="50%" text-anchor="middle" fill="#666">Offline</text></svg>"##
);

/// Fire-and-forget work that must still run to completion (cache
/// revalidation, queue drains). Tests await it with [`BackgroundTasks::wait`].
#[derive(Clone, Default)]
pub struct BackgroundTasks {
  set: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
    self
      .set
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let mut set = self.lock();
    // Reap whatever already finished so the set does not grow unbounded
    while let Some(finished) = set.try_join_next() {
      if let Err(e) = finished {
        warn!(error = %e, "Background task failed");
      }
    }
    set.spawn(task);
  }

  /// Wait until every spawned task (including ones spawned meanwhile) is done.
  pub async fn wait(&self) {
    loop {
      let mut set = std::mem::take(&mut *self.lock());
      if set.is_empty() {
        break;
      }
      while let Some(finished) = set.join_next().await {
        if let Err(e) = finished {
          warn!(error = %e, "Background task failed");
        }
      }
    }
  }
}

/// Runs the four strategies.
///
/// Storage errors never fail a request: a failed read is a miss and a failed
/// write is logged, so the request degrades to network-only behavior.
pub struct StrategyExecutor<N: Network, S: CacheStorage> {
  network: Arc<N>,
  stores: CacheStoreManager<S>,
  origin: Url,
  background: BackgroundTasks,
}

impl<N: Network, S: CacheStorage> StrategyExecutor<N, S> {
  pub fn new(
    network: Arc<N>,
    stores: CacheStoreManager<S>,
    origin: Url,
    background: BackgroundTasks,
  ) -> Self {
    Self {
      network,
      stores,
      origin,
      background,
    }
  }

  pub async fn execute(&self, request: &Request, config: StrategyConfig, store: &str) -> CacheResult {
    match config.strategy {
      Strategy::CacheFirst => self.cache_first(request, config, store).await,
      Strategy::NetworkFirst => self.network_first(request, store).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, config, store).await,
      Strategy::NetworkOnly => self.network_only(request).await,
    }
  }

  /// 1. Fresh cache entry -> return it, network untouched
  /// 2. Otherwise fetch and store on success
  /// 3. On network failure serve the stale entry, else the offline fallback
  pub async fn cache_first(&self, request: &Request, config: StrategyConfig, store: &str) -> CacheResult {
    let cached = read_cache(&self.stores, request, store);

    if let Some(entry) = &cached {
      if entry.is_fresh(Utc::now(), config.max_age) {
        debug!(url = %request.url, "Cache hit (fresh)");
        return CacheResult::from_cache(entry.clone(), false);
      }
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        write_cache(&self.stores, request, &response, store);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed for cache-first request");
        match cached {
          Some(entry) => CacheResult::offline(entry),
          None => self.offline_fallback(request),
        }
      }
    }
  }

  pub async fn network_first(&self, request: &Request, store: &str) -> CacheResult {
    match self.network.fetch(request).await {
      Ok(response) => {
        write_cache(&self.stores, request, &response, store);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed, falling back to cache");
        match read_cache(&self.stores, request, store) {
          Some(entry) => CacheResult::offline(entry),
          None => self.offline_fallback(request),
        }
      }
    }
  }

  /// Serve the cached entry at once and refresh it in the background.
  /// Without an entry, wait for the network.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    config: StrategyConfig,
    store: &str,
  ) -> CacheResult {
    match read_cache(&self.stores, request, store) {
      Some(entry) => {
        let stale = !entry.is_fresh(Utc::now(), config.max_age);
        self.spawn_revalidation(request.clone(), store.to_string());
        CacheResult::from_cache(entry, stale)
      }
      None => match self.network.fetch(request).await {
        Ok(response) => {
          write_cache(&self.stores, request, &response, store);
          CacheResult::from_network(response)
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "Network failed with empty cache");
          self.offline_fallback(request)
        }
      },
    }
  }

  pub async fn network_only(&self, request: &Request) -> CacheResult {
    match self.network.fetch(request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed for network-only request");
        self.offline_fallback(request)
      }
    }
  }

  fn spawn_revalidation(&self, request: Request, store: String) {
    let network = Arc::clone(&self.network);
    let stores = self.stores.clone();

    self.background.spawn(async move {
      match network.fetch(&request).await {
        Ok(response) => write_cache(&stores, &request, &response, &store),
        Err(e) => debug!(url = %request.url, error = %e, "Background revalidation failed"),
      }
    });
  }

  /// Placeholder when neither network nor cache can answer.
  pub fn offline_fallback(&self, request: &Request) -> CacheResult {
    let response = match request.destination {
      Destination::Image => {
        Response::new(200, OFFLINE_IMAGE).with_header("Content-Type", "image/svg+xml")
      }
      Destination::Document => self
        .offline_page()
        .unwrap_or_else(|| Response::text(503, "Offline")),
      _ => Response::text(503, "Offline"),
    };
    CacheResult::fallback(response)
  }

  fn offline_page(&self) -> Option<Response> {
    let url = self.origin.join(OFFLINE_PAGE).ok()?;
    let request = Request::get(url, Destination::Document);
    read_cache(&self.stores, &request, &self.stores.names().static_store()).map(|e| e.response)
  }
}

fn read_cache<S: CacheStorage>(
  stores: &CacheStoreManager<S>,
  request: &Request,
  store: &str,
) -> Option<CachedResponse> {
  match stores.get(request, store) {
    Ok(entry) => entry,
    Err(e) => {
      warn!(url = %request.url, store, error = %e, "Cache read failed, treating as miss");
      None
    }
  }
}

fn write_cache<S: CacheStorage>(
  stores: &CacheStoreManager<S>,
  request: &Request,
  response: &Response,
  store: &str,
) {
  if let Err(e) = stores.put(request, response, store) {
    warn!(url = %request.url, store, error = %e, "Cache write failed");
  }
}
