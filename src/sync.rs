//! Background sync queue: durable FIFO of mutations awaiting connectivity.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::cache::{CacheStorage, CacheStoreManager};
use crate::net::{Destination, Network, Request, Response};

/// Key of the persisted queue inside the sync-queue store.
const QUEUE_PATH: &str = "/sync-queue";

/// A deferred mutating request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
  pub endpoint: String,
  #[serde(default = "default_method")]
  pub method: String,
  #[serde(default, alias = "data")]
  pub payload: serde_json::Value,
}

fn default_method() -> String {
  "POST".to_string()
}

impl SyncOperation {
  pub fn post(endpoint: &str, payload: serde_json::Value) -> Self {
    Self {
      endpoint: endpoint.to_string(),
      method: default_method(),
      payload,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
  pub id: String,
  pub operation: SyncOperation,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

/// What a drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub delivered: usize,
  pub retrying: usize,
  pub dropped: usize,
  /// Items still queued after the pass
  pub remaining: usize,
}

enum ItemOutcome {
  Delivered,
  Retry(u32),
  Dropped,
}

pub struct SyncQueue<N: Network, S: CacheStorage> {
  network: Arc<N>,
  stores: CacheStoreManager<S>,
  origin: Url,
  max_retries: u32,
  items: Mutex<Vec<SyncQueueItem>>,
  /// Serializes drain passes; enqueue never waits on it.
  drain_lock: tokio::sync::Mutex<()>,
}

impl<N: Network, S: CacheStorage> SyncQueue<N, S> {
  pub fn new(network: Arc<N>, stores: CacheStoreManager<S>, origin: Url, max_retries: u32) -> Self {
    Self {
      network,
      stores,
      origin,
      max_retries,
      items: Mutex::new(Vec::new()),
      drain_lock: tokio::sync::Mutex::new(()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Vec<SyncQueueItem>> {
    self
      .items
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  #[allow(dead_code)]
  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  pub fn items(&self) -> Vec<SyncQueueItem> {
    self.lock().clone()
  }

  /// Append an operation and persist the queue right away.
  pub fn enqueue(&self, operation: SyncOperation) -> String {
    let item = SyncQueueItem {
      id: Uuid::new_v4().to_string(),
      operation,
      enqueued_at: Utc::now(),
      retry_count: 0,
    };
    let id = item.id.clone();

    // Persist under the guard so an older snapshot never lands last
    let mut items = self.lock();
    items.push(item);
    self.persist_or_warn(&items);
    debug!(id, queued = items.len(), "Enqueued sync item");

    id
  }

  /// Replay every queued item once, in FIFO order.
  ///
  /// Items enqueued while the pass runs are left for the next pass.
  pub async fn drain(&self) -> SyncReport {
    let _pass = self.drain_lock.lock().await;
    let batch = self.items();
    if batch.is_empty() {
      return SyncReport::default();
    }

    info!(items = batch.len(), "Processing sync queue");
    let mut outcomes = HashMap::with_capacity(batch.len());
    let mut report = SyncReport::default();

    for item in &batch {
      let outcome = match self.replay(&item.operation).await {
        Ok(()) => {
          report.delivered += 1;
          self.invalidate(&item.operation.endpoint);
          ItemOutcome::Delivered
        }
        Err(e) => {
          let retries = item.retry_count + 1;
          if retries >= self.max_retries {
            report.dropped += 1;
            error!(
              target: "sync::dropped",
              id = %item.id,
              endpoint = %item.operation.endpoint,
              method = %item.operation.method,
              retries,
              error = %e,
              "Max retries reached, dropping sync item"
            );
            ItemOutcome::Dropped
          } else {
            report.retrying += 1;
            warn!(id = %item.id, retries, error = %e, "Sync item failed, will retry");
            ItemOutcome::Retry(retries)
          }
        }
      };
      outcomes.insert(item.id.clone(), outcome);
    }

    {
      let mut items = self.lock();
      items.retain_mut(|item| match outcomes.get(&item.id) {
        Some(ItemOutcome::Delivered | ItemOutcome::Dropped) => false,
        Some(ItemOutcome::Retry(retries)) => {
          item.retry_count = *retries;
          true
        }
        None => true,
      });
      report.remaining = items.len();
      self.persist_or_warn(&items);
    }

    report
  }

  /// Drop cached reads of a resource the replayed mutation just changed.
  fn invalidate(&self, endpoint: &str) {
    let path = endpoint.split(['?', '#']).next().unwrap_or(endpoint);
    let Ok(pattern) = Regex::new(&format!("{}($|[?#])", regex::escape(path))) else {
      return;
    };
    let store = self.stores.names().dynamic_store();
    match self.stores.evict_by_pattern(&store, &pattern) {
      Ok(0) => {}
      Ok(evicted) => debug!(endpoint, evicted, "Invalidated cached responses"),
      Err(e) => warn!(endpoint, error = %e, "Failed to invalidate cached responses"),
    }
  }

  /// Issue the HTTP call exactly as originally intended.
  async fn replay(&self, operation: &SyncOperation) -> Result<()> {
    let method = Method::from_bytes(operation.method.to_ascii_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", operation.method, e))?;
    let url = self
      .origin
      .join(&operation.endpoint)
      .map_err(|e| eyre!("Invalid endpoint '{}': {}", operation.endpoint, e))?;
    let body = serde_json::to_vec(&operation.payload)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let request = Request::new(method, url, Destination::Empty)
      .with_header("Content-Type", "application/json")
      .with_body(body);

    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!("Sync failed: {}", response.status));
    }
    Ok(())
  }

  /// Restore the persisted queue. Items already in memory that are not in
  /// the persisted copy are kept after it.
  pub fn load(&self) -> Result<usize> {
    let request = self.queue_request()?;
    let store = self.stores.names().sync_queue_store();

    let Some(cached) = self.stores.get(&request, &store)? else {
      return Ok(0);
    };
    let persisted: Vec<SyncQueueItem> = serde_json::from_slice(&cached.response.body)
      .map_err(|e| eyre!("Failed to parse persisted sync queue: {}", e))?;

    let mut items = self.lock();
    let pending: Vec<SyncQueueItem> = items
      .drain(..)
      .filter(|item| !persisted.iter().any(|p| p.id == item.id))
      .collect();
    let count = persisted.len();
    items.extend(persisted);
    items.extend(pending);

    info!(restored = count, "Loaded sync queue");
    Ok(count)
  }

  fn persist(&self, items: &[SyncQueueItem]) -> Result<()> {
    let body =
      serde_json::to_vec(items).map_err(|e| eyre!("Failed to serialize sync queue: {}", e))?;
    let response = Response::new(200, body).with_header("Content-Type", "application/json");
    let request = self.queue_request()?;

    self
      .stores
      .put(&request, &response, &self.stores.names().sync_queue_store())?;
    Ok(())
  }

  /// The in-memory queue keeps working when storage is gone.
  fn persist_or_warn(&self, items: &[SyncQueueItem]) {
    if let Err(e) = self.persist(items) {
      warn!(error = %e, "Failed to save sync queue");
    }
  }

  fn queue_request(&self) -> Result<Request> {
    let url = self
      .origin
      .join(QUEUE_PATH)
      .map_err(|e| eyre!("Invalid sync queue URL: {}", e))?;
    Ok(Request::get(url, Destination::Empty))
  }
}
