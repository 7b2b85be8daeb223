//! Install / activate lifecycle: pre-warming and stale generation cleanup.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheStoreManager};
use crate::net::{Destination, Network, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
  /// Loaded, install not attempted yet
  Parsed,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  /// Intercepting requests
  Active,
  /// Install failed; this generation will never activate
  Redundant,
}

pub struct LifecycleController<N: Network, S: CacheStorage> {
  network: Arc<N>,
  stores: CacheStoreManager<S>,
  origin: Url,
  manifest: Vec<String>,
  state: Mutex<LifecycleState>,
}

impl<N: Network, S: CacheStorage> LifecycleController<N, S> {
  pub fn new(network: Arc<N>, stores: CacheStoreManager<S>, origin: Url, manifest: Vec<String>) -> Self {
    Self {
      network,
      stores,
      origin,
      manifest,
      state: Mutex::new(LifecycleState::Parsed),
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn set_state(&self, state: LifecycleState) {
    *self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
  }

  /// Pre-warm the static store with the install manifest.
  ///
  /// Every resource must fetch with a success status, otherwise nothing is
  /// written and the generation becomes redundant.
  pub async fn install(&self, version: &str) -> Result<usize> {
    info!(version, "Installing");
    self.set_state(LifecycleState::Installing);

    match self.precache().await {
      Ok(count) => {
        self.set_state(LifecycleState::Installed);
        info!(version, resources = count, "Installed");
        Ok(count)
      }
      Err(e) => {
        self.set_state(LifecycleState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let static_store = self.stores.names().static_store();
    self.stores.open_store(&static_store)?;

    let requests = self
      .manifest
      .iter()
      .map(|path| {
        let url = self
          .origin
          .join(path)
          .map_err(|e| eyre!("Invalid precache path '{}': {}", path, e))?;
        let destination = if path.ends_with(".html") || !path.contains('.') {
          Destination::Document
        } else {
          Destination::Empty
        };
        Ok(Request::get(url, destination))
      })
      .collect::<Result<Vec<_>>>()?;

    let pairs = try_join_all(requests.into_iter().map(|request| async move {
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok((request, response))
    }))
    .await?;

    self.stores.put_all(&static_store, &pairs)?;
    Ok(pairs.len())
  }

  /// Delete every store of a previous version. Returns the deleted names.
  ///
  /// Cleanup failures are logged; activation still completes.
  pub fn activate(&self, version: &str) -> Result<Vec<String>> {
    match self.state() {
      LifecycleState::Redundant => {
        return Err(eyre!("Cannot activate a redundant worker"));
      }
      LifecycleState::Active => return Ok(Vec::new()),
      LifecycleState::Parsed | LifecycleState::Installing => {
        warn!(state = ?self.state(), "Activating before install completed");
      }
      LifecycleState::Installed | LifecycleState::Activating => {}
    }

    info!(version, "Activating");
    self.set_state(LifecycleState::Activating);

    let mut deleted = Vec::new();
    match self.stores.list_stores() {
      Ok(names) => {
        let names_scheme = self.stores.names();
        for name in names.into_iter().filter(|n| names_scheme.is_stale(n)) {
          match self.stores.delete_store(&name) {
            Ok(_) => {
              info!(store = %name, "Deleted old cache");
              deleted.push(name);
            }
            Err(e) => warn!(store = %name, error = %e, "Failed to delete old cache"),
          }
        }
      }
      Err(e) => warn!(error = %e, "Failed to list caches"),
    }

    self.set_state(LifecycleState::Active);
    Ok(deleted)
  }

  pub fn is_active(&self) -> bool {
    self.state() == LifecycleState::Active
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{SqliteStorage, StoreNames};
  use crate::net::Response;
  use crate::testing::MockNetwork;

  fn origin() -> Url {
    Url::parse("http://localhost:8080").unwrap()
  }

  fn controller(
    network: &Arc<MockNetwork>,
    stores: CacheStoreManager<SqliteStorage>,
    manifest: &[&str],
  ) -> LifecycleController<MockNetwork, SqliteStorage> {
    LifecycleController::new(
      Arc::clone(network),
      stores,
      origin(),
      manifest.iter().map(|s| s.to_string()).collect(),
    )
  }

  #[tokio::test]
  async fn test_install_caches_manifest() {
    let network = Arc::new(MockNetwork::new());
    network.respond("/", 200, "shell");
    network.respond("/manifest.json", 200, "{}");
    let stores = CacheStoreManager::new(
      SqliteStorage::open_in_memory().unwrap(),
      StoreNames::new("app", "1"),
    );
    let lc = controller(&network, stores.clone(), &["/", "/manifest.json"]);

    assert_eq!(lc.install("1").await.unwrap(), 2);
    assert_eq!(lc.state(), LifecycleState::Installed);
    assert_eq!(stores.entry_count("app-static-v1").unwrap(), 2);
  }

  #[tokio::test]
  async fn test_install_is_atomic() {
    let network = Arc::new(MockNetwork::new());
    network.respond("/", 200, "shell");
    // "/missing" answers 404
    let stores = CacheStoreManager::new(
      SqliteStorage::open_in_memory().unwrap(),
      StoreNames::new("app", "1"),
    );
    let lc = controller(&network, stores.clone(), &["/", "/missing"]);

    assert!(lc.install("1").await.is_err());
    assert_eq!(lc.state(), LifecycleState::Redundant);
    assert_eq!(stores.entry_count("app-static-v1").unwrap(), 0);
    assert!(lc.activate("1").is_err());
  }

  #[tokio::test]
  async fn test_activate_removes_previous_generation() {
    let network = Arc::new(MockNetwork::new());
    network.respond("/", 200, "shell");
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");
    let request = Request::get(origin().join("/").unwrap(), Destination::Document);

    {
      let old = CacheStoreManager::new(
        SqliteStorage::open(Some(&db)).unwrap(),
        StoreNames::new("app", "1"),
      );
      for store in old.names().current() {
        old.put(&request, &Response::text(200, "v1"), &store).unwrap();
      }
      old.open_store("unrelated-cache").unwrap();
    }

    // Restart with the version bumped
    let stores = CacheStoreManager::new(
      SqliteStorage::open(Some(&db)).unwrap(),
      StoreNames::new("app", "2"),
    );
    let lc = controller(&network, stores.clone(), &["/"]);
    lc.install("2").await.unwrap();
    let deleted = lc.activate("2").unwrap();

    assert_eq!(deleted, vec!["app-dynamic-v1", "app-static-v1"]);
    assert_eq!(
      stores.list_stores().unwrap(),
      vec!["app-static-v2", "app-sync-queue", "unrelated-cache"]
    );
    assert!(lc.is_active());
  }
}
